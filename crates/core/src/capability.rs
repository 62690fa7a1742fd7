//! Injected capabilities -- [`ModuleFactories`] and the collaborator traits
//! it bundles.
//!
//! Everything here is object safe (`BoxFuture` returns) so the bundle can
//! hold `Arc<dyn ...>` values chosen at the entry point: OpenSSH-backed
//! sessions and the stubs below in production, in-memory fakes in tests.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{HarnessError, ProvisioningError};
use crate::service_config::ServiceConfig;
use crate::types::{TestCase, TestResult};

/// Boxed `Send` future returned by object-safe async traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ─── Session ─────────────────────────────────────────────────────────

/// Where to open a remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{user}@{}:{}", self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Output of a command run to completion over a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; `-1` when the remote side reported none.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Authenticated command session.
pub trait SshClient: Send + Sync {
    /// Where this session is connected.
    fn target(&self) -> &SessionTarget;

    /// Run a command to completion.
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandOutput, HarnessError>>;

    /// Close the session. Idempotent.
    fn close(&self) -> BoxFuture<'_, Result<(), HarnessError>>;
}

/// File transfer over an established session.
pub trait SftpClient: Send + Sync {
    fn put<'a>(
        &'a self,
        remote_path: &'a str,
        contents: &'a [u8],
    ) -> BoxFuture<'a, Result<(), HarnessError>>;

    fn get<'a>(&'a self, remote_path: &'a str) -> BoxFuture<'a, Result<Vec<u8>, HarnessError>>;
}

/// Long-running remote command (the service process).
pub trait SshChannel: Send {
    /// Exit status, if the command already finished.
    fn try_status(&mut self) -> Result<Option<i32>, HarnessError>;

    /// Wait for the command to finish.
    fn wait(&mut self) -> BoxFuture<'_, Result<i32, HarnessError>>;

    /// Tear the channel down. Idempotent.
    fn kill(&mut self) -> BoxFuture<'_, Result<(), HarnessError>>;
}

/// Constructors for the session-bound capabilities.
pub trait SessionFactory: Send + Sync {
    fn connect<'a>(
        &'a self,
        target: &'a SessionTarget,
    ) -> BoxFuture<'a, Result<Arc<dyn SshClient>, ProvisioningError>>;

    fn open_sftp(
        &self,
        client: Arc<dyn SshClient>,
    ) -> BoxFuture<'_, Result<Arc<dyn SftpClient>, ProvisioningError>>;

    fn open_channel<'a>(
        &'a self,
        client: Arc<dyn SshClient>,
        command: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn SshChannel>, HarnessError>>;
}

// ─── Backends ────────────────────────────────────────────────────────

/// Publishes a finished result upstream.
pub trait ResultProcessor: Send + Sync {
    fn process<'a>(
        &'a self,
        test_case: &'a TestCase,
        result: &'a TestResult,
    ) -> BoxFuture<'a, Result<(), HarnessError>>;
}

/// Determines the deployed service version.
pub trait VersionFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        client: &'a dyn SshClient,
    ) -> BoxFuture<'a, Result<String, ProvisioningError>>;
}

/// Produces the configuration document uploaded to the remote host.
pub trait ConfigGenerator: Send + Sync {
    fn generate<'a>(
        &'a self,
        config: &'a ServiceConfig,
        version: &'a str,
    ) -> BoxFuture<'a, Result<String, ProvisioningError>>;
}

// ─── ModuleFactories ─────────────────────────────────────────────────

/// Capability bundle passed explicitly to the remote harness.
#[derive(Clone)]
pub struct ModuleFactories {
    pub result_processor: Arc<dyn ResultProcessor>,
    pub version_fetcher: Arc<dyn VersionFetcher>,
    pub config_generator: Arc<dyn ConfigGenerator>,
    pub session_factory: Arc<dyn SessionFactory>,
}

impl ModuleFactories {
    pub fn new(
        result_processor: Arc<dyn ResultProcessor>,
        version_fetcher: Arc<dyn VersionFetcher>,
        config_generator: Arc<dyn ConfigGenerator>,
        session_factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            result_processor,
            version_fetcher,
            config_generator,
            session_factory,
        }
    }

    /// Stub backends with the given session factory.
    pub fn with_stubs(session_factory: Arc<dyn SessionFactory>) -> Self {
        Self::new(
            Arc::new(ResultProcessorStub),
            Arc::new(VersionFetcherStub::default()),
            Arc::new(ConfigGeneratorStub),
            session_factory,
        )
    }
}

impl fmt::Debug for ModuleFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleFactories").finish_non_exhaustive()
    }
}

// ─── Stubs ───────────────────────────────────────────────────────────

/// Logs the result instead of publishing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResultProcessorStub;

impl ResultProcessor for ResultProcessorStub {
    fn process<'a>(
        &'a self,
        test_case: &'a TestCase,
        result: &'a TestResult,
    ) -> BoxFuture<'a, Result<(), HarnessError>> {
        Box::pin(async move {
            tracing::info!(
                test = test_case.name(),
                status = %result.status(),
                artifacts = result.artifact_paths().len(),
                "result processed"
            );
            Ok(())
        })
    }
}

/// Reports a fixed version without touching the session.
#[derive(Debug, Clone)]
pub struct VersionFetcherStub {
    version: String,
}

impl VersionFetcherStub {
    pub const DEFAULT_VERSION: &'static str = "1.0.0-test";

    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl Default for VersionFetcherStub {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VERSION)
    }
}

impl VersionFetcher for VersionFetcherStub {
    fn fetch<'a>(
        &'a self,
        _client: &'a dyn SshClient,
    ) -> BoxFuture<'a, Result<String, ProvisioningError>> {
        Box::pin(async move { Ok(self.version.clone()) })
    }
}

/// Serializes the synthesized config as TOML, ignoring the version.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigGeneratorStub;

impl ConfigGenerator for ConfigGeneratorStub {
    fn generate<'a>(
        &'a self,
        config: &'a ServiceConfig,
        _version: &'a str,
    ) -> BoxFuture<'a, Result<String, ProvisioningError>> {
        Box::pin(async move {
            config
                .to_toml()
                .map_err(|e| ProvisioningError::ConfigGeneration(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopClient(SessionTarget);

    impl SshClient for NoopClient {
        fn target(&self) -> &SessionTarget {
            &self.0
        }

        fn exec<'a>(
            &'a self,
            _command: &'a str,
        ) -> BoxFuture<'a, Result<CommandOutput, HarnessError>> {
            Box::pin(async { Ok(CommandOutput::default()) })
        }

        fn close(&self) -> BoxFuture<'_, Result<(), HarnessError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn session_target_display() {
        let mut target = SessionTarget {
            host: "validation-01".to_owned(),
            user: Some("ci".to_owned()),
            port: 22,
            identity_file: None,
        };
        assert_eq!(target.to_string(), "ci@validation-01:22");
        target.user = None;
        assert_eq!(target.to_string(), "validation-01:22");
    }

    #[tokio::test]
    async fn version_stub_returns_fixed_version() {
        let client = NoopClient(SessionTarget {
            host: "noop".to_owned(),
            user: None,
            port: 22,
            identity_file: None,
        });
        let version = VersionFetcherStub::default()
            .fetch(&client)
            .await
            .unwrap();
        assert_eq!(version, "1.0.0-test");
    }

    #[tokio::test]
    async fn config_stub_emits_parseable_toml() {
        let config = ServiceConfig::default();
        let doc = ConfigGeneratorStub.generate(&config, "1.0.0").await.unwrap();
        let parsed = ServiceConfig::from_toml(&doc).unwrap();
        assert_eq!(parsed, config);
    }

    #[tokio::test]
    async fn result_stub_accepts_any_result() {
        let case = TestCase::named("checkpoint-validation");
        let result = TestResult::fail("mismatch", vec![]);
        ResultProcessorStub.process(&case, &result).await.unwrap();
    }

    #[test]
    fn command_output_success() {
        let mut out = CommandOutput::default();
        assert!(out.success());
        out.status = 3;
        assert!(!out.success());
    }
}

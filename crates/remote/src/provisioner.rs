//! Remote environment provisioning.
//!
//! Opens a session through the injected factory, asks the version fetcher
//! what is deployed, gates it against `min_server_version`, and uploads the
//! generated config into a per-run directory under `remote_root`.

use std::sync::Arc;

use bsh_core::capability::{ModuleFactories, SessionTarget, SftpClient, SshClient};
use bsh_core::config::RemoteConfig;
use bsh_core::error::{HarnessError, ProvisioningError, TeardownError};
use bsh_core::lifecycle::Provisioner;
use bsh_core::service_config::ServiceConfig;
use semver::Version;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::shell::quote;

pub const SERVICE_CONFIG_FILE: &str = "service.toml";
pub const SERVICE_LOG_FILE: &str = "nbs.log";
pub const SERVICE_PID_FILE: &str = "service.pid";

/// Everything provisioned on the remote host for one invocation.
pub struct RemoteEnvironment {
    run_id: Uuid,
    client: Arc<dyn SshClient>,
    sftp: Arc<dyn SftpClient>,
    version: String,
    run_dir: String,
}

impl RemoteEnvironment {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn client(&self) -> &Arc<dyn SshClient> {
        &self.client
    }

    pub fn sftp(&self) -> &Arc<dyn SftpClient> {
        &self.sftp
    }

    /// Deployed server version reported by the version fetcher.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn run_dir(&self) -> &str {
        &self.run_dir
    }

    pub fn config_path(&self) -> String {
        format!("{}/{SERVICE_CONFIG_FILE}", self.run_dir)
    }

    pub fn log_path(&self) -> String {
        format!("{}/{SERVICE_LOG_FILE}", self.run_dir)
    }

    pub fn pid_path(&self) -> String {
        format!("{}/{SERVICE_PID_FILE}", self.run_dir)
    }
}

impl std::fmt::Debug for RemoteEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEnvironment")
            .field("run_id", &self.run_id)
            .field("target", self.client.target())
            .field("version", &self.version)
            .field("run_dir", &self.run_dir)
            .finish_non_exhaustive()
    }
}

/// Provisions remote environments through a [`ModuleFactories`] bundle.
pub struct RemoteProvisioner {
    config: RemoteConfig,
    factories: ModuleFactories,
}

impl RemoteProvisioner {
    pub fn new(config: RemoteConfig, factories: ModuleFactories) -> Self {
        Self { config, factories }
    }

    fn target(&self) -> SessionTarget {
        session_target(&self.config)
    }

    async fn prepare(
        &self,
        client: &Arc<dyn SshClient>,
        config: &ServiceConfig,
        run_dir: &str,
    ) -> Result<(String, Arc<dyn SftpClient>), ProvisioningError> {
        let version = self.factories.version_fetcher.fetch(client.as_ref()).await?;
        check_version(&version, &self.config.min_server_version)?;
        info!(version = version.as_str(), "deployed server version");

        let document = self
            .factories
            .config_generator
            .generate(config, &version)
            .await?;

        let mkdir = format!("mkdir -p {}", quote(run_dir));
        let out = client
            .exec(&mkdir)
            .await
            .map_err(|e| ProvisioningError::Workspace(e.to_string()))?;
        if !out.success() {
            return Err(ProvisioningError::Workspace(format!(
                "mkdir {run_dir} exited with {}: {}",
                out.status,
                out.stderr.trim()
            )));
        }

        let sftp = self
            .factories
            .session_factory
            .open_sftp(client.clone())
            .await?;
        let config_path = format!("{run_dir}/{SERVICE_CONFIG_FILE}");
        sftp.put(&config_path, document.as_bytes())
            .await
            .map_err(|e| ProvisioningError::ConfigGeneration(format!("upload {config_path}: {e}")))?;
        debug!(path = config_path.as_str(), bytes = document.len(), "config uploaded");

        Ok((version, sftp))
    }
}

impl Provisioner for RemoteProvisioner {
    type Env = RemoteEnvironment;

    async fn provision(&mut self, config: &ServiceConfig) -> Result<RemoteEnvironment, HarnessError> {
        let target = self.target();
        let client = self.factories.session_factory.connect(&target).await?;
        info!(target = %target, "session opened");

        let run_id = Uuid::new_v4();
        let run_dir = format!(
            "{}/run-{run_id}",
            self.config.remote_root.trim_end_matches('/')
        );

        match self.prepare(&client, config, &run_dir).await {
            Ok((version, sftp)) => Ok(RemoteEnvironment {
                run_id,
                client,
                sftp,
                version,
                run_dir,
            }),
            Err(e) => {
                warn!(error = %e, "provisioning failed, discarding partial environment");
                if let Err(cleanup) = remove_dir(client.as_ref(), &run_dir).await {
                    warn!(error = %cleanup, "failed to remove partial run dir");
                }
                if let Err(close) = client.close().await {
                    warn!(error = %close, "failed to close session");
                }
                Err(e.into())
            }
        }
    }

    async fn release(&mut self, env: RemoteEnvironment) -> Result<(), HarnessError> {
        let removed = remove_dir(env.client.as_ref(), &env.run_dir).await;
        let closed = env.client.close().await;
        removed?;
        closed.map_err(|e| TeardownError::Release(format!("close session: {e}")))?;
        info!(run_id = %env.run_id, "remote environment released");
        Ok(())
    }
}

async fn remove_dir(client: &dyn SshClient, run_dir: &str) -> Result<(), TeardownError> {
    let out = client
        .exec(&format!("rm -rf {}", quote(run_dir)))
        .await
        .map_err(|e| TeardownError::Release(format!("remove {run_dir}: {e}")))?;
    if !out.success() {
        return Err(TeardownError::Release(format!(
            "remove {run_dir} exited with {}: {}",
            out.status,
            out.stderr.trim()
        )));
    }
    Ok(())
}

/// Session target described by the remote config.
pub fn session_target(config: &RemoteConfig) -> SessionTarget {
    SessionTarget {
        host: config.host.clone(),
        user: (!config.user.is_empty()).then(|| config.user.clone()),
        port: config.ssh_port,
        identity_file: (!config.identity_file.is_empty()).then(|| config.identity_file.clone().into()),
    }
}

/// Reject deployed versions older than `required`.
///
/// Pre-release and build tags are ignored, so `1.0.0-test` satisfies
/// `1.0.0`. An empty `required` disables the gate.
pub fn check_version(found: &str, required: &str) -> Result<(), ProvisioningError> {
    if required.is_empty() {
        return Ok(());
    }
    let parse = |v: &str| {
        Version::parse(v.trim())
            .map(|v| (v.major, v.minor, v.patch))
            .map_err(|e| ProvisioningError::VersionFetch(format!("unparseable version '{v}': {e}")))
    };
    if parse(found)? < parse(required)? {
        return Err(ProvisioningError::IncompatibleVersion {
            found: found.to_owned(),
            required: required.to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSessionFactory, factories_with};

    fn remote_config() -> RemoteConfig {
        RemoteConfig {
            host: "validation-01".to_owned(),
            ..RemoteConfig::default()
        }
    }

    #[test]
    fn version_gate() {
        assert!(check_version("1.0.0-test", "").is_ok());
        assert!(check_version("1.0.0-test", "1.0.0").is_ok());
        assert!(check_version("2.3.1", "2.3.0").is_ok());
        assert!(matches!(
            check_version("0.9.9", "1.0.0"),
            Err(ProvisioningError::IncompatibleVersion { .. })
        ));
        assert!(matches!(
            check_version("nightly", "1.0.0"),
            Err(ProvisioningError::VersionFetch(_))
        ));
    }

    #[test]
    fn session_target_from_config() {
        let mut config = remote_config();
        assert_eq!(session_target(&config).to_string(), "validation-01:22");
        config.user = "ci".to_owned();
        config.identity_file = "/keys/ci".to_owned();
        let target = session_target(&config);
        assert_eq!(target.user.as_deref(), Some("ci"));
        assert_eq!(target.identity_file, Some("/keys/ci".into()));
    }

    #[tokio::test]
    async fn provision_uploads_config_and_release_cleans_up() {
        let factory = FakeSessionFactory::default();
        let mut provisioner =
            RemoteProvisioner::new(remote_config(), factories_with(factory.clone()));
        let config = ServiceConfig::default();

        let env = provisioner.provision(&config).await.unwrap();
        assert_eq!(env.version(), "1.0.0-test");
        assert!(env.run_dir().starts_with("/tmp/bsh/run-"));

        let uploaded = factory.file(&env.config_path()).expect("config uploaded");
        let parsed = ServiceConfig::from_toml(&String::from_utf8(uploaded).unwrap()).unwrap();
        assert_eq!(parsed, config);

        let run_dir = env.run_dir().to_owned();
        provisioner.release(env).await.unwrap();
        let commands = factory.commands();
        assert!(commands.iter().any(|c| c == &format!("mkdir -p {run_dir}")));
        assert!(commands.iter().any(|c| c == &format!("rm -rf {run_dir}")));
        assert_eq!(factory.open_sessions(), 0);
    }

    #[tokio::test]
    async fn old_server_is_rejected_and_session_closed() {
        let factory = FakeSessionFactory::default();
        let config = RemoteConfig {
            min_server_version: "2.0.0".to_owned(),
            ..remote_config()
        };
        let mut provisioner = RemoteProvisioner::new(config, factories_with(factory.clone()));

        let err = provisioner
            .provision(&ServiceConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Provisioning(ProvisioningError::IncompatibleVersion { .. })
        ));
        assert_eq!(factory.open_sessions(), 0);
        assert!(!factory.commands().iter().any(|c| c.starts_with("mkdir")));
    }

    #[tokio::test]
    async fn failed_connect_is_a_provisioning_error() {
        let factory = FakeSessionFactory::refusing("connection refused");
        let mut provisioner = RemoteProvisioner::new(remote_config(), factories_with(factory));
        let err = provisioner
            .provision(&ServiceConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Provisioning(ProvisioningError::Session { .. })
        ));
    }
}

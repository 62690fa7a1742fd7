//! In-memory session fakes for exercising the remote harness without a host.
//!
//! [`FakeSessionFactory`] records every command, keeps uploaded files in a
//! map, and simulates one service process per opened channel. Responses
//! are scripted by command prefix; anything unscripted succeeds with empty
//! output.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bsh_core::capability::{
    BoxFuture, CommandOutput, ConfigGenerator, ModuleFactories, ResultProcessor, SessionFactory,
    SessionTarget, SftpClient, SshChannel, SshClient, VersionFetcherStub,
};
use bsh_core::error::{HarnessError, ProvisioningError};
use bsh_core::service_config::ServiceConfig;
use bsh_core::types::{TestCase, TestResult, TestStatus};
use tokio::sync::watch;

/// Exit status reported after a graceful stop.
pub const TERMINATED_STATUS: i32 = 143;
/// Exit status reported after a forced kill.
pub const KILLED_STATUS: i32 = 137;

/// Scripted reply to commands starting with a prefix.
#[derive(Debug, Clone)]
pub enum Reply {
    Output(CommandOutput),
    /// Never completes.
    Hang,
}

impl Reply {
    pub fn status(status: i32, stdout: &str) -> Self {
        Self::Output(CommandOutput {
            status,
            stdout: stdout.to_owned(),
            stderr: String::new(),
        })
    }
}

/// How the simulated service process behaves.
#[derive(Debug, Clone, Default)]
pub struct ServiceBehaviour {
    /// Exit immediately with this status (e.g. config rejected).
    pub exit_on_launch: Option<i32>,
    /// Exit with status 1 after this long.
    pub crash_after: Option<Duration>,
    /// Keep running after `kill -TERM`.
    pub ignore_term: bool,
}

#[derive(Default)]
struct Inner {
    refuse: Option<String>,
    replies: Vec<(String, Reply)>,
    service: ServiceBehaviour,
    service_log: String,
    files: HashMap<String, Vec<u8>>,
    commands: Vec<String>,
    channels: Vec<String>,
    open_sessions: usize,
    service_exit: Option<Arc<watch::Sender<Option<i32>>>>,
}

/// Shared-state session factory; clones observe the same host.
#[derive(Clone, Default)]
pub struct FakeSessionFactory {
    inner: Arc<Mutex<Inner>>,
}

impl FakeSessionFactory {
    /// A factory whose `connect` always fails with `reason`.
    pub fn refusing(reason: &str) -> Self {
        let factory = Self::default();
        factory.lock().refuse = Some(reason.to_owned());
        factory
    }

    pub fn reply(self, prefix: &str, reply: Reply) -> Self {
        self.lock().replies.push((prefix.to_owned(), reply));
        self
    }

    pub fn service(self, behaviour: ServiceBehaviour) -> Self {
        self.lock().service = behaviour;
        self
    }

    /// Contents served for any `*/nbs.log` download.
    pub fn service_log(self, text: &str) -> Self {
        self.lock().service_log = text.to_owned();
        self
    }

    /// Commands run through `exec`, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Commands that opened long-running channels.
    pub fn channels(&self) -> Vec<String> {
        self.lock().channels.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Sessions connected and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionFactory for FakeSessionFactory {
    fn connect<'a>(
        &'a self,
        target: &'a SessionTarget,
    ) -> BoxFuture<'a, Result<Arc<dyn SshClient>, ProvisioningError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(reason) = &inner.refuse {
                return Err(ProvisioningError::Session {
                    target: target.to_string(),
                    reason: reason.clone(),
                });
            }
            inner.open_sessions += 1;
            drop(inner);
            Ok(Arc::new(FakeClient {
                target: target.clone(),
                host: self.clone(),
                closed: Mutex::new(false),
            }) as Arc<dyn SshClient>)
        })
    }

    fn open_sftp(
        &self,
        _client: Arc<dyn SshClient>,
    ) -> BoxFuture<'_, Result<Arc<dyn SftpClient>, ProvisioningError>> {
        Box::pin(async move { Ok(Arc::new(FakeSftp { host: self.clone() }) as Arc<dyn SftpClient>) })
    }

    fn open_channel<'a>(
        &'a self,
        _client: Arc<dyn SshClient>,
        command: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn SshChannel>, HarnessError>> {
        Box::pin(async move {
            let (tx, rx) = watch::channel(None);
            let tx = Arc::new(tx);
            let mut inner = self.lock();
            inner.channels.push(command.to_owned());
            if let Some(status) = inner.service.exit_on_launch {
                tx.send_replace(Some(status));
            }
            if let Some(delay) = inner.service.crash_after {
                let crash = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    crash.send_if_modified(|status| {
                        if status.is_none() {
                            *status = Some(1);
                            return true;
                        }
                        false
                    });
                });
            }
            inner.service_exit = Some(tx.clone());
            Ok(Box::new(FakeChannel { tx, rx }) as Box<dyn SshChannel>)
        })
    }
}

struct FakeClient {
    target: SessionTarget,
    host: FakeSessionFactory,
    closed: Mutex<bool>,
}

impl SshClient for FakeClient {
    fn target(&self) -> &SessionTarget {
        &self.target
    }

    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandOutput, HarnessError>> {
        Box::pin(async move {
            let reply = {
                let mut inner = self.host.lock();
                inner.commands.push(command.to_owned());
                if command.starts_with("kill -TERM") && !inner.service.ignore_term {
                    exit_service(&inner, TERMINATED_STATUS);
                }
                if command.starts_with("kill -KILL") {
                    exit_service(&inner, KILLED_STATUS);
                }
                inner
                    .replies
                    .iter()
                    .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                    .map(|(_, reply)| reply.clone())
            };
            match reply {
                Some(Reply::Output(output)) => Ok(output),
                Some(Reply::Hang) => std::future::pending().await,
                None => Ok(CommandOutput::default()),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), HarnessError>> {
        Box::pin(async move {
            let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
            if !*closed {
                *closed = true;
                self.host.lock().open_sessions -= 1;
            }
            Ok(())
        })
    }
}

fn exit_service(inner: &Inner, status: i32) {
    if let Some(tx) = &inner.service_exit {
        tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(status);
                return true;
            }
            false
        });
    }
}

struct FakeSftp {
    host: FakeSessionFactory,
}

impl SftpClient for FakeSftp {
    fn put<'a>(
        &'a self,
        remote_path: &'a str,
        contents: &'a [u8],
    ) -> BoxFuture<'a, Result<(), HarnessError>> {
        Box::pin(async move {
            self.host
                .lock()
                .files
                .insert(remote_path.to_owned(), contents.to_vec());
            Ok(())
        })
    }

    fn get<'a>(&'a self, remote_path: &'a str) -> BoxFuture<'a, Result<Vec<u8>, HarnessError>> {
        Box::pin(async move {
            let inner = self.host.lock();
            if let Some(contents) = inner.files.get(remote_path) {
                return Ok(contents.clone());
            }
            if remote_path.ends_with("/nbs.log") {
                return Ok(inner.service_log.clone().into_bytes());
            }
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, remote_path.to_owned()).into())
        })
    }
}

struct FakeChannel {
    tx: Arc<watch::Sender<Option<i32>>>,
    rx: watch::Receiver<Option<i32>>,
}

impl SshChannel for FakeChannel {
    fn try_status(&mut self) -> Result<Option<i32>, HarnessError> {
        Ok(*self.rx.borrow())
    }

    fn wait(&mut self) -> BoxFuture<'_, Result<i32, HarnessError>> {
        Box::pin(async move {
            let status = *self
                .rx
                .wait_for(Option::is_some)
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            Ok(status.unwrap_or(-1))
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, Result<(), HarnessError>> {
        Box::pin(async move {
            self.tx.send_if_modified(|status| {
                if status.is_none() {
                    *status = Some(KILLED_STATUS);
                    return true;
                }
                false
            });
            Ok(())
        })
    }
}

/// Generator emitting the same document regardless of input.
#[derive(Debug, Clone)]
pub struct FixedConfigGenerator(pub String);

impl ConfigGenerator for FixedConfigGenerator {
    fn generate<'a>(
        &'a self,
        _config: &'a ServiceConfig,
        _version: &'a str,
    ) -> BoxFuture<'a, Result<String, ProvisioningError>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

/// Result processor remembering what it was handed.
#[derive(Debug, Clone, Default)]
pub struct RecordingResultProcessor {
    seen: Arc<Mutex<Vec<(String, TestStatus)>>>,
}

impl RecordingResultProcessor {
    pub fn seen(&self) -> Vec<(String, TestStatus)> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ResultProcessor for RecordingResultProcessor {
    fn process<'a>(
        &'a self,
        test_case: &'a TestCase,
        result: &'a TestResult,
    ) -> BoxFuture<'a, Result<(), HarnessError>> {
        Box::pin(async move {
            self.seen
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((test_case.name().to_owned(), result.status()));
            Ok(())
        })
    }
}

/// Stub backends around `factory`.
pub fn factories_with(factory: FakeSessionFactory) -> ModuleFactories {
    ModuleFactories::with_stubs(Arc::new(factory))
}

/// Stub version fetcher, a fixed config document, a recording result
/// processor, and `factory`.
pub fn fixed_factories(
    factory: FakeSessionFactory,
    document: &str,
    results: RecordingResultProcessor,
) -> ModuleFactories {
    ModuleFactories::new(
        Arc::new(results),
        Arc::new(VersionFetcherStub::default()),
        Arc::new(FixedConfigGenerator(document.to_owned())),
        Arc::new(factory),
    )
}

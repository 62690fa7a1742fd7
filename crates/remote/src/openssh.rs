//! OpenSSH-backed session capabilities.
//!
//! Every operation shells out to the system `ssh` client in batch mode, so
//! authentication comes from the agent, `~/.ssh/config`, or the configured
//! identity file. File transfer streams through `cat` on the remote side.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bsh_core::capability::{
    BoxFuture, CommandOutput, SessionFactory, SessionTarget, SftpClient, SshChannel, SshClient,
};
use bsh_core::error::{HarnessError, ProvisioningError};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::shell::quote;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Opens sessions with the `ssh` binary.
#[derive(Debug, Clone)]
pub struct OpenSshSessionFactory {
    ssh_binary: PathBuf,
    connect_timeout_secs: u64,
}

impl Default for OpenSshSessionFactory {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl OpenSshSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, ssh_binary: impl Into<PathBuf>) -> Self {
        self.ssh_binary = ssh_binary.into();
        self
    }

    fn session(&self, target: &SessionTarget) -> OpenSshClient {
        OpenSshClient {
            ssh_binary: self.ssh_binary.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
            target: target.clone(),
            closed: AtomicBool::new(false),
        }
    }
}

impl SessionFactory for OpenSshSessionFactory {
    fn connect<'a>(
        &'a self,
        target: &'a SessionTarget,
    ) -> BoxFuture<'a, Result<Arc<dyn SshClient>, ProvisioningError>> {
        Box::pin(async move {
            let client = self.session(target);
            let session_error = |reason: String| ProvisioningError::Session {
                target: target.to_string(),
                reason,
            };

            // authenticate once up front so failures surface as provisioning errors
            let probe = client
                .exec("true")
                .await
                .map_err(|e| session_error(e.to_string()))?;
            if !probe.success() {
                return Err(session_error(format!(
                    "ssh exited with {}: {}",
                    probe.status,
                    probe.stderr.trim()
                )));
            }
            debug!(target = %target, "ssh session established");
            Ok(Arc::new(client) as Arc<dyn SshClient>)
        })
    }

    fn open_sftp(
        &self,
        client: Arc<dyn SshClient>,
    ) -> BoxFuture<'_, Result<Arc<dyn SftpClient>, ProvisioningError>> {
        Box::pin(async move {
            let transfer = CatTransfer {
                session: self.session(client.target()),
            };
            Ok(Arc::new(transfer) as Arc<dyn SftpClient>)
        })
    }

    fn open_channel<'a>(
        &'a self,
        client: Arc<dyn SshClient>,
        command: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn SshChannel>, HarnessError>> {
        Box::pin(async move {
            let target = client.target();
            let mut cmd = Command::new(&self.ssh_binary);
            // a pty ties the remote process to the channel: closing it hangs up
            cmd.args(["-tt", "-o", "BatchMode=yes"])
                .args(destination_args(target))
                .arg("--")
                .arg(command)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            let child = cmd.spawn()?;
            debug!(target = %target, command, "ssh channel opened");
            Ok(Box::new(OpenSshChannel { child }) as Box<dyn SshChannel>)
        })
    }
}

/// Command session over `ssh`.
#[derive(Debug)]
pub struct OpenSshClient {
    ssh_binary: PathBuf,
    connect_timeout_secs: u64,
    target: SessionTarget,
    closed: AtomicBool,
}

impl OpenSshClient {
    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.ssh_binary);
        cmd.args(["-o", "BatchMode=yes", "-o"])
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .args(destination_args(&self.target))
            .arg("--")
            .arg(remote)
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, remote: &str, stdin: Option<&[u8]>) -> Result<Output, HarnessError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProvisioningError::Session {
                target: self.target.to_string(),
                reason: "session closed".to_owned(),
            }
            .into());
        }

        let mut cmd = self.command(remote);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let Some(input) = stdin else {
            cmd.stdin(Stdio::null());
            return Ok(cmd.output().await?);
        };

        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn()?;
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }
        Ok(child.wait_with_output().await?)
    }
}

impl SshClient for OpenSshClient {
    fn target(&self) -> &SessionTarget {
        &self.target
    }

    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandOutput, HarnessError>> {
        Box::pin(async move {
            let output = self.run(command, None).await?;
            Ok(command_output(&output))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), HarnessError>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                debug!(target = %self.target, "ssh session closed");
            }
            Ok(())
        })
    }
}

/// File transfer by piping through `cat` on the remote host.
struct CatTransfer {
    session: OpenSshClient,
}

impl SftpClient for CatTransfer {
    fn put<'a>(
        &'a self,
        remote_path: &'a str,
        contents: &'a [u8],
    ) -> BoxFuture<'a, Result<(), HarnessError>> {
        Box::pin(async move {
            let command = format!("cat > {}", quote(remote_path));
            let out = command_output(&self.session.run(&command, Some(contents)).await?);
            if !out.success() {
                return Err(std::io::Error::other(format!(
                    "upload to {remote_path} failed: {}",
                    out.stderr.trim()
                ))
                .into());
            }
            Ok(())
        })
    }

    fn get<'a>(&'a self, remote_path: &'a str) -> BoxFuture<'a, Result<Vec<u8>, HarnessError>> {
        Box::pin(async move {
            let command = format!("cat {}", quote(remote_path));
            let output = self.session.run(&command, None).await?;
            if !output.status.success() {
                return Err(std::io::Error::other(format!(
                    "download of {remote_path} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ))
                .into());
            }
            Ok(output.stdout)
        })
    }
}

/// Long-running `ssh` process.
struct OpenSshChannel {
    child: Child,
}

impl SshChannel for OpenSshChannel {
    fn try_status(&mut self) -> Result<Option<i32>, HarnessError> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    fn wait(&mut self) -> BoxFuture<'_, Result<i32, HarnessError>> {
        Box::pin(async move {
            let status = self.child.wait().await?;
            Ok(status.code().unwrap_or(-1))
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, Result<(), HarnessError>> {
        Box::pin(async move {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            self.child.kill().await?;
            Ok(())
        })
    }
}

fn command_output(output: &Output) -> CommandOutput {
    CommandOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

/// `-p PORT [-i IDENTITY] [USER@]HOST`
fn destination_args(target: &SessionTarget) -> Vec<String> {
    let mut args = vec!["-p".to_owned(), target.port.to_string()];
    if let Some(identity) = target.identity_file.as_deref().map(Path::display) {
        args.push("-i".to_owned());
        args.push(identity.to_string());
    }
    args.push(match &target.user {
        Some(user) => format!("{user}@{}", target.host),
        None => target.host.clone(),
    });
    args
}

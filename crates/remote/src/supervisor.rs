//! Remote service supervision.
//!
//! The service is launched on a long-running channel from the run
//! directory. It writes its pid next to the config, which is what the
//! default stop commands target. Readiness is an injected probe command,
//! `test -s <log>` unless configured, polled over the session.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bsh_core::capability::{SessionFactory, SftpClient, SshChannel, SshClient};
use bsh_core::config::RemoteConfig;
use bsh_core::error::{HarnessError, LifecycleError, StartupError, TeardownError};
use bsh_core::lifecycle::{ReadyHandle, ServiceSupervisor, SupervisorState};
use bsh_core::service_config::ServiceConfig;
use bsh_core::types::{Endpoints, LOG_TAIL_LINES, log_tail};
use tracing::{debug, info, warn};

use crate::provisioner::{RemoteEnvironment, SERVICE_PID_FILE};
use crate::shell::quote;

/// Handle to a service running on the remote host.
pub struct RemoteServiceHandle {
    state: SupervisorState,
    channel: Option<Box<dyn SshChannel>>,
    endpoints: Endpoints,
    client: Arc<dyn SshClient>,
    sftp: Arc<dyn SftpClient>,
    run_dir: String,
    threads_count: u32,
    exit_status: Option<i32>,
}

impl RemoteServiceHandle {
    fn new(env: &RemoteEnvironment, config: &ServiceConfig, remote: &RemoteConfig) -> Self {
        Self {
            state: SupervisorState::NotStarted,
            channel: None,
            endpoints: Endpoints {
                host: remote.host.clone(),
                service_port: remote.service_port,
                monitoring_port: remote.monitoring_port,
                log_path: PathBuf::from(env.log_path()),
            },
            client: env.client().clone(),
            sftp: env.sftp().clone(),
            run_dir: env.run_dir().to_owned(),
            threads_count: config.server.server.threads_count,
            exit_status: None,
        }
    }

    pub fn run_dir(&self) -> &str {
        &self.run_dir
    }

    pub fn client(&self) -> &Arc<dyn SshClient> {
        &self.client
    }

    pub fn threads_count(&self) -> u32 {
        self.threads_count
    }

    /// Exit status observed after the service died on its own.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Resolve when the service channel closes. Never resolves without one.
    pub async fn wait_for_exit(&mut self) -> Result<i32, HarnessError> {
        match self.channel.as_mut() {
            Some(channel) => channel.wait().await,
            None => std::future::pending().await,
        }
    }

    /// Record that the service died while the scenario was running.
    pub fn record_crash(&mut self, status: i32) {
        self.exit_status = Some(status);
        self.channel = None;
        if let Err(e) = self.state.transition_to(SupervisorState::Failed) {
            warn!(error = %e, "unexpected crash report");
        }
    }

    /// Last lines of the remote service log.
    ///
    /// The future owns what it needs, so it can be awaited while the
    /// handle is borrowed elsewhere.
    pub fn log_excerpt(&self) -> impl Future<Output = String> + Send + 'static {
        let sftp = Arc::clone(&self.sftp);
        let path = self.endpoints.log_path.to_string_lossy().into_owned();
        async move { fetch_log_tail(sftp.as_ref(), &path).await }
    }

    fn pid_path(&self) -> String {
        format!("{}/{SERVICE_PID_FILE}", self.run_dir)
    }
}

impl ReadyHandle for RemoteServiceHandle {
    fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn state(&self) -> SupervisorState {
        self.state
    }

    fn mark_running(&mut self) -> Result<(), LifecycleError> {
        self.state.transition_to(SupervisorState::Running)
    }
}

/// Starts and stops the deployed service over the session.
pub struct RemoteSupervisor {
    config: RemoteConfig,
    sessions: Arc<dyn SessionFactory>,
}

impl RemoteSupervisor {
    pub fn new(config: RemoteConfig, sessions: Arc<dyn SessionFactory>) -> Self {
        Self { config, sessions }
    }

    fn launch_command(&self, env: &RemoteEnvironment) -> String {
        format!(
            "cd {} && echo $$ > {SERVICE_PID_FILE} && exec {} --config {} --log-file {}",
            quote(env.run_dir()),
            self.config.service_command,
            quote(&env.config_path()),
            quote(&env.log_path()),
        )
    }

    fn probe_command(&self, env: &RemoteEnvironment) -> String {
        if self.config.probe_command.is_empty() {
            format!("test -s {}", quote(&env.log_path()))
        } else {
            self.config.probe_command.clone()
        }
    }

    fn stop_command(&self, pid_path: &str) -> String {
        if self.config.stop_command.is_empty() {
            format!("kill -TERM \"$(cat {})\"", quote(pid_path))
        } else {
            self.config.stop_command.clone()
        }
    }

    /// Poll the probe until it succeeds or the channel closes.
    async fn wait_ready(
        channel: &mut dyn SshChannel,
        client: &dyn SshClient,
        probe: &str,
        poll: Duration,
    ) -> Result<(), StartupError> {
        loop {
            match channel.try_status() {
                Ok(Some(status)) => {
                    return Err(StartupError::ExitedEarly {
                        status: format!("exit status: {status}"),
                    });
                }
                Ok(None) => {}
                Err(e) => return Err(StartupError::SpawnFailed(e.to_string())),
            }

            match client.exec(probe).await {
                Ok(out) if out.success() => return Ok(()),
                Ok(out) => debug!(status = out.status, "readiness probe not satisfied yet"),
                Err(e) => debug!(error = %e, "readiness probe failed"),
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn terminate(
        &self,
        client: &dyn SshClient,
        pid_path: &str,
        channel: &mut dyn SshChannel,
    ) -> Result<(), TeardownError> {
        if let Ok(Some(status)) = channel.try_status() {
            debug!(status, "service already exited");
            return Ok(());
        }

        let grace = self.config.shutdown_grace();
        match client.exec(&self.stop_command(pid_path)).await {
            Ok(out) if !out.success() => {
                warn!(status = out.status, stderr = out.stderr.trim(), "stop command failed")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stop command failed"),
        }
        match tokio::time::timeout(grace, channel.wait()).await {
            Ok(Ok(status)) => {
                info!(status, "service stopped");
                return Ok(());
            }
            Ok(Err(e)) => warn!(error = %e, "failed to wait for service"),
            Err(_) => warn!(
                error = %TeardownError::GracefulTimeout { grace },
                "escalating to kill"
            ),
        }

        Self::force_kill(client, pid_path, channel).await?;
        info!("service killed");
        Ok(())
    }

    /// SIGKILL the pid on the host, then drop the channel. Closing the
    /// channel alone does not reach a service that ignores the hangup.
    async fn force_kill(
        client: &dyn SshClient,
        pid_path: &str,
        channel: &mut dyn SshChannel,
    ) -> Result<(), TeardownError> {
        let kill = format!("kill -KILL \"$(cat {})\"", quote(pid_path));
        match client.exec(&kill).await {
            Ok(out) if !out.success() => {
                warn!(status = out.status, stderr = out.stderr.trim(), "remote kill failed")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "remote kill failed"),
        }
        channel
            .kill()
            .await
            .map_err(|e| TeardownError::ForceKillFailed(e.to_string()))
    }
}

impl ServiceSupervisor<RemoteEnvironment> for RemoteSupervisor {
    type Handle = RemoteServiceHandle;

    fn prepare(&mut self, config: &ServiceConfig, env: &RemoteEnvironment) -> RemoteServiceHandle {
        RemoteServiceHandle::new(env, config, &self.config)
    }

    async fn start(
        &mut self,
        handle: &mut RemoteServiceHandle,
        env: &mut RemoteEnvironment,
    ) -> Result<(), HarnessError> {
        handle.state.transition_to(SupervisorState::Starting)?;

        let command = self.launch_command(env);
        let mut channel = match self
            .sessions
            .open_channel(env.client().clone(), &command)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                handle.state.transition_to(SupervisorState::Failed)?;
                return Err(StartupError::SpawnFailed(e.to_string()).into());
            }
        };
        info!(run_dir = env.run_dir(), version = env.version(), "service launched");

        let timeout = self.config.startup_timeout();
        let probe = self.probe_command(env);
        let ready = tokio::time::timeout(
            timeout,
            Self::wait_ready(
                channel.as_mut(),
                env.client().as_ref(),
                &probe,
                self.config.readiness_poll_interval(),
            ),
        )
        .await;

        let failure = match ready {
            Ok(Ok(())) => None,
            Ok(Err(StartupError::ExitedEarly { status })) => Some(StartupError::ExitedEarly {
                status: format!("{status}\n{}", handle.log_excerpt().await),
            }),
            Ok(Err(e)) => Some(e),
            Err(_) => Some(StartupError::Timeout { timeout }),
        };

        if let Some(e) = failure {
            warn!(error = %e, "service failed to start, terminating");
            let kill = if matches!(channel.try_status(), Ok(Some(_))) {
                Ok(())
            } else {
                Self::force_kill(env.client().as_ref(), &handle.pid_path(), channel.as_mut()).await
            };
            if let Err(kill_err) = kill {
                warn!(error = %kill_err, "failed to kill partially started service");
            }
            handle.state.transition_to(SupervisorState::Failed)?;
            return Err(e.into());
        }

        handle.channel = Some(channel);
        handle.state.transition_to(SupervisorState::Ready)?;
        info!(addr = %handle.endpoints.service_addr(), "service ready");
        Ok(())
    }

    async fn stop(&mut self, handle: &mut RemoteServiceHandle) -> Result<(), HarnessError> {
        match handle.state {
            SupervisorState::Stopped => return Ok(()),
            SupervisorState::NotStarted => {
                handle.state.transition_to(SupervisorState::Stopped)?;
                return Ok(());
            }
            SupervisorState::Stopping => {}
            _ => handle.state.transition_to(SupervisorState::Stopping)?,
        }

        let outcome = match handle.channel.take() {
            Some(mut channel) => {
                let client = Arc::clone(&handle.client);
                self.terminate(client.as_ref(), &handle.pid_path(), channel.as_mut())
                    .await
            }
            None => Ok(()),
        };
        handle.state.transition_to(SupervisorState::Stopped)?;
        outcome.map_err(Into::into)
    }
}

pub(crate) async fn fetch_log_tail(sftp: &dyn SftpClient, path: &str) -> String {
    match sftp.get(path).await {
        Ok(bytes) => log_tail(&String::from_utf8_lossy(&bytes), LOG_TAIL_LINES),
        Err(e) => format!("<log unavailable: {e}>"),
    }
}

//! Service subprocess supervision.
//!
//! [`ProcessSupervisor`] launches the service binary bound to the
//! provisioned ports and config, then polls a TCP connect to the service
//! port until it succeeds, the process exits, or the startup timeout
//! elapses. Stopping sends SIGTERM, waits for the grace period, and kills.
//!
//! The child is spawned with `kill_on_drop`, so a dropped handle never
//! leaves the service running.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bsh_core::config::LocalConfig;
use bsh_core::error::{HarnessError, LifecycleError, StartupError, TeardownError};
use bsh_core::lifecycle::{ReadyHandle, ServiceSupervisor, SupervisorState};
use bsh_core::service_config::ServiceConfig;
use bsh_core::types::{Endpoints, LOG_TAIL_LINES, log_tail};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::provisioner::{DiskBacking, LocalEnvironment};

/// Handle to a locally supervised service process.
#[derive(Debug)]
pub struct LocalServiceHandle {
    state: SupervisorState,
    child: Option<Child>,
    endpoints: Endpoints,
    run_dir: PathBuf,
    overlay_files: Vec<PathBuf>,
    threads_count: u32,
    exit_status: Option<ExitStatus>,
}

impl LocalServiceHandle {
    fn new(env: &LocalEnvironment, config: &ServiceConfig) -> Self {
        Self {
            state: SupervisorState::NotStarted,
            child: None,
            endpoints: Endpoints {
                host: env.host().to_owned(),
                service_port: env.service_port(),
                monitoring_port: env.monitoring_port(),
                log_path: env.log_path().to_path_buf(),
            },
            run_dir: env.run_dir().to_path_buf(),
            overlay_files: env.config_files().overlays.clone(),
            threads_count: config.server.server.threads_count,
            exit_status: None,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Storage overlay files, in application order.
    pub fn overlay_files(&self) -> &[PathBuf] {
        &self.overlay_files
    }

    pub fn threads_count(&self) -> u32 {
        self.threads_count
    }

    /// Service process id while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Exit status observed after the service died on its own.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Resolve when the service process exits. Never resolves when there is
    /// no process, so it can sit in a `select!` next to the scenario.
    pub async fn wait_for_exit(&mut self) -> std::io::Result<ExitStatus> {
        match self.child.as_mut() {
            Some(child) => child.wait().await,
            None => std::future::pending().await,
        }
    }

    /// Record that the service died while the scenario was running.
    pub fn record_crash(&mut self, status: ExitStatus) {
        self.exit_status = Some(status);
        self.child = None;
        if let Err(e) = self.state.transition_to(SupervisorState::Failed) {
            warn!(error = %e, "unexpected crash report");
        }
    }

    /// Service log contents, last lines only.
    pub async fn log_excerpt(&self) -> String {
        read_log_tail(&self.endpoints.log_path).await
    }
}

impl ReadyHandle for LocalServiceHandle {
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

/// Starts and stops the service binary configured in [`LocalConfig`].
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    config: LocalConfig,
}

impl ProcessSupervisor {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    fn command(&self, env: &LocalEnvironment) -> Result<Command, StartupError> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(env.log_path())
            .map_err(|e| StartupError::SpawnFailed(format!("cannot open service log: {e}")))?;
        let log_err = log
            .try_clone()
            .map_err(|e| StartupError::SpawnFailed(format!("cannot open service log: {e}")))?;

        let files = env.config_files();
        let mut cmd = Command::new(&self.config.service_binary);
        cmd.arg("--host")
            .arg(env.host())
            .arg("--service-port")
            .arg(env.service_port().to_string())
            .arg("--monitoring-port")
            .arg(env.monitoring_port().to_string())
            .arg("--config")
            .arg(&files.service)
            .arg("--storage-config")
            .arg(&files.storage)
            .arg("--log-file")
            .arg(env.log_path());

        match env.disk() {
            DiskBacking::InMemory { size_mb } => {
                cmd.arg("--in-memory-disks")
                    .arg("--disk-size-mb")
                    .arg(size_mb.to_string());
            }
            DiskBacking::File { path, size_mb } => {
                cmd.arg("--disk-file")
                    .arg(path)
                    .arg("--disk-size-mb")
                    .arg(size_mb.to_string());
            }
        }

        cmd.args(&self.config.service_args)
            .current_dir(env.run_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Poll until the service port accepts a connection or the process exits.
    async fn wait_ready(
        child: &mut Child,
        addr: &str,
        poll: Duration,
    ) -> Result<(), StartupError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(StartupError::ExitedEarly {
                        status: status.to_string(),
                    });
                }
                Ok(None) => {}
                Err(e) => return Err(StartupError::SpawnFailed(e.to_string())),
            }

            match TcpStream::connect(addr).await {
                Ok(_) => return Ok(()),
                Err(e) => debug!(addr, error = %e, "service not accepting connections yet"),
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn force_kill(child: &mut Child) -> Result<(), TeardownError> {
        child
            .kill()
            .await
            .map_err(|e| TeardownError::ForceKillFailed(e.to_string()))
    }
}

impl ServiceSupervisor<LocalEnvironment> for ProcessSupervisor {
    type Handle = LocalServiceHandle;

    fn prepare(&mut self, config: &ServiceConfig, env: &LocalEnvironment) -> LocalServiceHandle {
        LocalServiceHandle::new(env, config)
    }

    async fn start(
        &mut self,
        handle: &mut LocalServiceHandle,
        env: &mut LocalEnvironment,
    ) -> Result<(), HarnessError> {
        handle.state.transition_to(SupervisorState::Starting)?;

        let mut cmd = match self.command(env) {
            Ok(cmd) => cmd,
            Err(e) => {
                handle.state.transition_to(SupervisorState::Failed)?;
                return Err(e.into());
            }
        };

        env.release_port_listeners();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                handle.state.transition_to(SupervisorState::Failed)?;
                return Err(StartupError::SpawnFailed(format!(
                    "{}: {e}",
                    self.config.service_binary.display()
                ))
                .into());
            }
        };
        info!(
            pid = child.id(),
            binary = %self.config.service_binary.display(),
            port = env.service_port(),
            "service spawned"
        );

        let addr = handle.endpoints.service_addr();
        let timeout = self.config.startup_timeout();
        let ready = tokio::time::timeout(
            timeout,
            Self::wait_ready(&mut child, &addr, self.config.readiness_poll_interval()),
        )
        .await;

        let failure = match ready {
            Ok(Ok(())) => None,
            Ok(Err(StartupError::ExitedEarly { status })) => {
                let tail = read_log_tail(env.log_path()).await;
                Some(StartupError::ExitedEarly {
                    status: format!("{status}\n{tail}"),
                })
            }
            Ok(Err(e)) => Some(e),
            Err(_) => Some(StartupError::Timeout { timeout }),
        };

        if let Some(e) = failure {
            warn!(error = %e, "service failed to start, terminating");
            if let Err(kill_err) = Self::force_kill(&mut child).await {
                warn!(error = %kill_err, "failed to kill partially started service");
            }
            handle.state.transition_to(SupervisorState::Failed)?;
            return Err(e.into());
        }

        handle.child = Some(child);
        handle.state.transition_to(SupervisorState::Ready)?;
        info!(addr = %addr, "service ready");
        Ok(())
    }

    async fn stop(&mut self, handle: &mut LocalServiceHandle) -> Result<(), HarnessError> {
        match handle.state {
            SupervisorState::Stopped => return Ok(()),
            SupervisorState::NotStarted => {
                handle.state.transition_to(SupervisorState::Stopped)?;
                return Ok(());
            }
            SupervisorState::Stopping => {}
            _ => handle.state.transition_to(SupervisorState::Stopping)?,
        }

        let outcome = match handle.child.take() {
            Some(mut child) => self.terminate(&mut child).await,
            None => Ok(()),
        };
        handle.state.transition_to(SupervisorState::Stopped)?;
        outcome.map_err(Into::into)
    }
}

impl ProcessSupervisor {
    async fn terminate(&self, child: &mut Child) -> Result<(), TeardownError> {
        if let Ok(Some(status)) = child.try_wait() {
            debug!(%status, "service already exited");
            return Ok(());
        }

        let grace = self.config.shutdown_grace();
        if send_sigterm(child) {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(%status, "service stopped");
                    return Ok(());
                }
                Ok(Err(e)) => warn!(error = %e, "failed to wait for service"),
                Err(_) => warn!(
                    error = %TeardownError::GracefulTimeout { grace },
                    "escalating to kill"
                ),
            }
        }

        Self::force_kill(child).await?;
        info!("service killed");
        Ok(())
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: pid belongs to a child we own and have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    rc == 0
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

async fn read_log_tail(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => log_tail(&text, LOG_TAIL_LINES),
        Err(e) => format!("<log unavailable: {e}>"),
    }
}

//! Scenario execution against a locally supervised service.
//!
//! The scenario interpreter is an external binary. It receives the
//! endpoints, the service log path, the storage overlay files and the
//! thread count as arguments, and reports its verdict through its exit
//! status. While it runs, the service process is watched: if it dies first
//! the scenario is killed and the run fails with the service log attached.

use std::fs::File;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use bsh_core::config::LocalConfig;
use bsh_core::error::{HarnessError, ScenarioError};
use bsh_core::lifecycle::{ReadyHandle, ScenarioRunner};
use bsh_core::types::{LOG_TAIL_LINES, ScenarioRef, TestCase, TestResult, log_tail};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::supervisor::LocalServiceHandle;

/// How the scenario ended.
enum Finished {
    Scenario(std::io::Result<ExitStatus>),
    ServiceDied(std::io::Result<ExitStatus>),
}

/// Runs the scenario interpreter configured in [`LocalConfig`].
#[derive(Debug, Clone)]
pub struct LocalScenarioRunner {
    config: LocalConfig,
}

impl LocalScenarioRunner {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    fn spawn(
        &self,
        test_case: &TestCase,
        handle: &LocalServiceHandle,
        output: &Path,
    ) -> Result<Child, ScenarioError> {
        let out = File::create(output)
            .map_err(|e| ScenarioError::LaunchFailed(format!("{}: {e}", output.display())))?;
        let err = out
            .try_clone()
            .map_err(|e| ScenarioError::LaunchFailed(format!("{}: {e}", output.display())))?;

        let endpoints = handle.endpoints();
        let mut cmd = Command::new(&self.config.scenario_binary);
        cmd.arg("--name").arg(test_case.name());
        match test_case.scenario() {
            ScenarioRef::Path(path) => cmd.arg("--scenario").arg(path),
            ScenarioRef::Named(name) => cmd.arg("--scenario-name").arg(name),
        };
        cmd.arg("--host")
            .arg(&endpoints.host)
            .arg("--service-port")
            .arg(endpoints.service_port.to_string())
            .arg("--monitoring-port")
            .arg(endpoints.monitoring_port.to_string())
            .arg("--threads")
            .arg(handle.threads_count().to_string())
            .arg("--service-log")
            .arg(&endpoints.log_path);
        for overlay in handle.overlay_files() {
            cmd.arg("--storage-overlay").arg(overlay);
        }

        cmd.current_dir(handle.run_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| {
            ScenarioError::LaunchFailed(format!(
                "{}: {e}",
                self.config.scenario_binary.display()
            ))
        })
    }
}

impl ScenarioRunner<LocalServiceHandle> for LocalScenarioRunner {
    async fn run(
        &mut self,
        test_case: &TestCase,
        handle: &mut LocalServiceHandle,
    ) -> Result<TestResult, HarnessError> {
        if !handle.state().is_live() {
            return Err(ScenarioError::NotReady {
                state: handle.state().to_string(),
            }
            .into());
        }
        if let ScenarioRef::Path(path) = test_case.scenario() {
            if !path.exists() {
                return Err(ScenarioError::NotFound(path.display().to_string()).into());
            }
        }

        let output = handle
            .run_dir()
            .join(format!("scenario-{}.log", test_case.name()));
        let mut child = self.spawn(test_case, handle, &output)?;
        info!(
            pid = child.id(),
            scenario = %test_case.scenario(),
            "scenario started"
        );

        let race = async {
            tokio::select! {
                biased;
                status = child.wait() => Finished::Scenario(status),
                status = handle.wait_for_exit() => Finished::ServiceDied(status),
            }
        };
        let finished = match self.config.scenario_timeout() {
            Some(limit) => tokio::time::timeout(limit, race).await.ok(),
            None => Some(race.await),
        };

        let artifacts = vec![handle.endpoints().log_path.clone(), output.clone()];
        let result = match finished {
            Some(Finished::Scenario(Ok(status))) if status.success() => {
                info!(%status, "scenario passed");
                TestResult::pass("", artifacts)
            }
            Some(Finished::Scenario(Ok(status))) => {
                warn!(%status, "scenario failed");
                let diagnostics = format!(
                    "scenario exited with {status}\n{}",
                    excerpts(&output, handle).await
                );
                TestResult::fail(diagnostics, artifacts)
            }
            Some(Finished::Scenario(Err(e))) => {
                return Err(ScenarioError::LaunchFailed(format!("lost scenario process: {e}")).into());
            }
            Some(Finished::ServiceDied(status)) => {
                kill_scenario(&mut child).await;
                let status = match status {
                    Ok(status) => {
                        handle.record_crash(status);
                        status.to_string()
                    }
                    Err(e) => format!("unknown ({e})"),
                };
                warn!(status = %status, "service crashed during scenario");
                let diagnostics = format!(
                    "service crashed during scenario: {status}\n{}",
                    excerpts(&output, handle).await
                );
                TestResult::fail(diagnostics, artifacts)
            }
            None => {
                kill_scenario(&mut child).await;
                warn!(timeout_secs = self.config.scenario_timeout_secs, "scenario timed out");
                let diagnostics = format!(
                    "scenario did not finish within {}s\n{}",
                    self.config.scenario_timeout_secs,
                    excerpts(&output, handle).await
                );
                TestResult::fail(diagnostics, artifacts)
            }
        };
        Ok(result)
    }
}

async fn kill_scenario(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill scenario");
    }
}

async fn excerpts(output: &Path, handle: &LocalServiceHandle) -> String {
    let scenario = match tokio::fs::read_to_string(output).await {
        Ok(text) => log_tail(&text, LOG_TAIL_LINES),
        Err(e) => format!("<scenario output unavailable: {e}>"),
    };
    format!(
        "--- scenario output ---\n{scenario}\n--- service log ---\n{}",
        handle.log_excerpt().await
    )
}

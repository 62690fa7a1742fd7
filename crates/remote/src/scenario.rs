//! Validation scenario execution over the session.

use std::sync::Arc;

use bsh_core::capability::CommandOutput;
use bsh_core::config::RemoteConfig;
use bsh_core::error::{HarnessError, ScenarioError};
use bsh_core::lifecycle::{ReadyHandle, ScenarioRunner};
use bsh_core::types::{LOG_TAIL_LINES, ScenarioRef, TestCase, TestResult, log_tail};
use tracing::{info, warn};

use crate::shell::quote;
use crate::supervisor::RemoteServiceHandle;

enum Finished {
    Scenario(Result<CommandOutput, HarnessError>),
    ServiceDied(Result<i32, HarnessError>),
}

/// Runs `scenario_command` on the remote host against the live service.
#[derive(Debug, Clone)]
pub struct RemoteScenarioRunner {
    config: RemoteConfig,
}

impl RemoteScenarioRunner {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    fn command(&self, test_case: &TestCase, handle: &RemoteServiceHandle) -> String {
        let endpoints = handle.endpoints();
        let scenario = match test_case.scenario() {
            ScenarioRef::Path(path) => format!("--scenario {}", quote(&path.to_string_lossy())),
            ScenarioRef::Named(name) => format!("--scenario-name {}", quote(name)),
        };
        format!(
            "cd {} && {} --name {} {scenario} --host {} --service-port {} --monitoring-port {} --threads {} --service-log {}",
            quote(handle.run_dir()),
            self.config.scenario_command,
            quote(test_case.name()),
            quote(&endpoints.host),
            endpoints.service_port,
            endpoints.monitoring_port,
            handle.threads_count(),
            quote(&endpoints.log_path.to_string_lossy()),
        )
    }
}

impl ScenarioRunner<RemoteServiceHandle> for RemoteScenarioRunner {
    async fn run(
        &mut self,
        test_case: &TestCase,
        handle: &mut RemoteServiceHandle,
    ) -> Result<TestResult, HarnessError> {
        if !handle.state().is_live() {
            return Err(ScenarioError::NotReady {
                state: handle.state().to_string(),
            }
            .into());
        }

        let command = self.command(test_case, handle);
        let client = Arc::clone(handle.client());
        info!(scenario = %test_case.scenario(), "scenario started");

        let finished = tokio::select! {
            biased;
            out = client.exec(&command) => Finished::Scenario(out),
            status = handle.wait_for_exit() => Finished::ServiceDied(status),
        };

        let artifacts = vec![handle.endpoints().log_path.clone()];
        let result = match finished {
            Finished::Scenario(Ok(out)) if out.success() => {
                info!("scenario passed");
                TestResult::pass(log_tail(&out.stdout, LOG_TAIL_LINES), artifacts)
            }
            Finished::Scenario(Ok(out)) => {
                warn!(status = out.status, "scenario failed");
                let diagnostics = format!(
                    "scenario exited with status {}\n--- scenario output ---\n{}\n{}\n--- service log ---\n{}",
                    out.status,
                    log_tail(&out.stdout, LOG_TAIL_LINES),
                    log_tail(&out.stderr, LOG_TAIL_LINES),
                    handle.log_excerpt().await
                );
                TestResult::fail(diagnostics, artifacts)
            }
            Finished::Scenario(Err(e)) => {
                return Err(ScenarioError::LaunchFailed(e.to_string()).into());
            }
            Finished::ServiceDied(status) => {
                let status = match status {
                    Ok(status) => {
                        handle.record_crash(status);
                        format!("exit status {status}")
                    }
                    Err(e) => format!("unknown ({e})"),
                };
                warn!(status = %status, "service crashed during scenario");
                let diagnostics = format!(
                    "service crashed during scenario: {status}\n--- service log ---\n{}",
                    handle.log_excerpt().await
                );
                TestResult::fail(diagnostics, artifacts)
            }
        };
        Ok(result)
    }
}

//! Test orchestrator -- one invocation from provisioning to teardown.
//!
//! ```text
//! provision → prepare → start → run → stop → release
//! ```
//!
//! Once provisioning succeeds, `stop` and `release` each run exactly once on
//! every exit path, a failed `start` included. Teardown failures are logged
//! and counted but never replace the primary outcome: the scenario result,
//! or the first error raised before teardown.

use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{Instrument, error, info, info_span, warn};

use crate::error::HarnessError;
use crate::lifecycle::{Provisioner, ReadyHandle, ScenarioRunner, ServiceSupervisor};
use crate::metrics as m;
use crate::service_config::ServiceConfig;
use crate::types::{TestCase, TestResult};

/// Runs test cases against environments produced by `P`, services started
/// by `S`, and scenarios driven by `R`.
pub struct TestOrchestrator<P, S, R> {
    provisioner: P,
    supervisor: S,
    runner: R,
}

impl<P, S, R> TestOrchestrator<P, S, R>
where
    P: Provisioner,
    S: ServiceSupervisor<P::Env>,
    R: ScenarioRunner<S::Handle>,
{
    pub fn new(provisioner: P, supervisor: S, runner: R) -> Self {
        Self {
            provisioner,
            supervisor,
            runner,
        }
    }

    /// Run `test_case` in a fresh environment.
    ///
    /// `Ok` carries the scenario verdict, pass or fail. `Err` is an
    /// infrastructure failure (provisioning, startup, scenario launch).
    pub async fn run(
        &mut self,
        test_case: &TestCase,
        config: &ServiceConfig,
    ) -> Result<TestResult, HarnessError> {
        let span = info_span!("test", name = test_case.name());
        async {
            info!(scenario = %test_case.scenario(), "provisioning environment");
            let mut env = match self.provisioner.provision(config).await {
                Ok(env) => env,
                Err(e) => {
                    record_outcome(&Err(()));
                    return Err(e);
                }
            };

            let mut handle = self.supervisor.prepare(config, &env);
            let outcome = self.start_and_run(test_case, &mut handle, &mut env).await;

            if let Err(e) = self.supervisor.stop(&mut handle).await {
                warn!(error = %e, "failed to stop service");
                counter!(m::TEARDOWN_FAILURES_TOTAL, m::LABEL_PHASE => "stop").increment(1);
            }

            if let Err(e) = self.provisioner.release(env).await {
                warn!(error = %e, "failed to release environment");
                counter!(m::TEARDOWN_FAILURES_TOTAL, m::LABEL_PHASE => "release").increment(1);
            }

            match &outcome {
                Ok(result) => {
                    info!(status = %result.status(), "test finished");
                    record_outcome(&Ok(result));
                }
                Err(e) => {
                    error!(error = %e, "test aborted");
                    record_outcome(&Err(()));
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn start_and_run(
        &mut self,
        test_case: &TestCase,
        handle: &mut S::Handle,
        env: &mut P::Env,
    ) -> Result<TestResult, HarnessError> {
        let started = Instant::now();
        self.supervisor.start(handle, env).await?;
        histogram!(m::STARTUP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        info!(
            service = %handle.endpoints().service_addr(),
            monitoring = %handle.endpoints().monitoring_addr(),
            "service ready"
        );

        handle.mark_running()?;
        let started = Instant::now();
        let outcome = self.runner.run(test_case, handle).await;
        histogram!(m::SCENARIO_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        outcome
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }
}

fn record_outcome(outcome: &Result<&TestResult, ()>) {
    let label = match outcome {
        Ok(result) if result.is_pass() => "pass",
        Ok(_) => "fail",
        Err(()) => "error",
    };
    counter!(m::RUNS_TOTAL, m::LABEL_RESULT => label).increment(1);
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::{LifecycleError, ProvisioningError, StartupError, TeardownError};
    use crate::lifecycle::SupervisorState;
    use crate::types::Endpoints;

    type CallLog = Arc<Mutex<Vec<&'static str>>>;

    /// `(state on entry, state on exit)` of every `stop` call.
    type StopLog = Arc<Mutex<Vec<(SupervisorState, SupervisorState)>>>;

    fn record(log: &CallLog, call: &'static str) {
        log.lock().unwrap().push(call);
    }

    fn calls(log: &CallLog) -> Vec<&'static str> {
        log.lock().unwrap().clone()
    }

    #[derive(Default)]
    struct Faults {
        provision: bool,
        start: bool,
        run_error: bool,
        run_fail: bool,
        stop: bool,
        release: bool,
    }

    struct FakeProvisioner {
        log: CallLog,
        fail: bool,
        fail_release: bool,
    }

    impl Provisioner for FakeProvisioner {
        type Env = u16;

        async fn provision(&mut self, _config: &ServiceConfig) -> Result<u16, HarnessError> {
            record(&self.log, "provision");
            if self.fail {
                return Err(ProvisioningError::Workspace("disk full".to_owned()).into());
            }
            Ok(9766)
        }

        async fn release(&mut self, _env: u16) -> Result<(), HarnessError> {
            record(&self.log, "release");
            if self.fail_release {
                return Err(TeardownError::Release("busy".to_owned()).into());
            }
            Ok(())
        }
    }

    struct FakeHandle {
        endpoints: Endpoints,
        state: SupervisorState,
    }

    impl ReadyHandle for FakeHandle {
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

    struct FakeSupervisor {
        log: CallLog,
        stops: StopLog,
        fail_start: bool,
        fail_stop: bool,
    }

    impl ServiceSupervisor<u16> for FakeSupervisor {
        type Handle = FakeHandle;

        fn prepare(&mut self, _config: &ServiceConfig, env: &u16) -> FakeHandle {
            FakeHandle {
                endpoints: Endpoints {
                    host: "127.0.0.1".to_owned(),
                    service_port: *env,
                    monitoring_port: *env + 1,
                    log_path: PathBuf::from("/tmp/nbs.log"),
                },
                state: SupervisorState::NotStarted,
            }
        }

        async fn start(
            &mut self,
            handle: &mut FakeHandle,
            _env: &mut u16,
        ) -> Result<(), HarnessError> {
            record(&self.log, "start");
            handle.state.transition_to(SupervisorState::Starting)?;
            if self.fail_start {
                handle.state.transition_to(SupervisorState::Failed)?;
                return Err(StartupError::ExitedEarly {
                    status: "exit status: 2".to_owned(),
                }
                .into());
            }
            handle.state.transition_to(SupervisorState::Ready)?;
            Ok(())
        }

        async fn stop(&mut self, handle: &mut FakeHandle) -> Result<(), HarnessError> {
            record(&self.log, "stop");
            let entry = handle.state;
            if entry != SupervisorState::Stopped {
                if entry != SupervisorState::NotStarted {
                    handle.state.transition_to(SupervisorState::Stopping)?;
                }
                handle.state.transition_to(SupervisorState::Stopped)?;
            }
            self.stops.lock().unwrap().push((entry, handle.state));
            if self.fail_stop {
                return Err(TeardownError::ForceKillFailed("EPERM".to_owned()).into());
            }
            Ok(())
        }
    }

    struct FakeRunner {
        log: CallLog,
        error: bool,
        fail: bool,
    }

    impl ScenarioRunner<FakeHandle> for FakeRunner {
        async fn run(
            &mut self,
            _test_case: &TestCase,
            handle: &mut FakeHandle,
        ) -> Result<TestResult, HarnessError> {
            record(&self.log, "run");
            assert_eq!(handle.state(), SupervisorState::Running);
            if self.error {
                return Err(crate::error::ScenarioError::LaunchFailed("ENOENT".to_owned()).into());
            }
            if self.fail {
                return Ok(TestResult::fail("checksum mismatch", vec![]));
            }
            Ok(TestResult::pass("", vec![]))
        }
    }

    type Orchestrator = TestOrchestrator<FakeProvisioner, FakeSupervisor, FakeRunner>;

    fn orchestrator(faults: Faults) -> (Orchestrator, CallLog, StopLog) {
        let log = CallLog::default();
        let stops = StopLog::default();
        let orch = TestOrchestrator::new(
            FakeProvisioner {
                log: log.clone(),
                fail: faults.provision,
                fail_release: faults.release,
            },
            FakeSupervisor {
                log: log.clone(),
                stops: stops.clone(),
                fail_start: faults.start,
                fail_stop: faults.stop,
            },
            FakeRunner {
                log: log.clone(),
                error: faults.run_error,
                fail: faults.run_fail,
            },
        );
        (orch, log, stops)
    }

    async fn run(faults: Faults) -> (Result<TestResult, HarnessError>, Vec<&'static str>) {
        let (result, calls, _) = run_recording_stops(faults).await;
        (result, calls)
    }

    async fn run_recording_stops(
        faults: Faults,
    ) -> (
        Result<TestResult, HarnessError>,
        Vec<&'static str>,
        Vec<(SupervisorState, SupervisorState)>,
    ) {
        let (mut orch, log, stops) = orchestrator(faults);
        let result = orch
            .run(&TestCase::named("partition-reboots"), &ServiceConfig::default())
            .await;
        let stops = stops.lock().unwrap().clone();
        (result, calls(&log), stops)
    }

    #[tokio::test]
    async fn happy_path_runs_every_phase_once() {
        let (result, calls) = run(Faults::default()).await;
        assert!(result.unwrap().is_pass());
        assert_eq!(calls, ["provision", "start", "run", "stop", "release"]);
    }

    #[tokio::test]
    async fn failed_scenario_is_a_result_not_an_error() {
        let (result, calls) = run(Faults {
            run_fail: true,
            ..Default::default()
        })
        .await;
        let result = result.unwrap();
        assert!(!result.is_pass());
        assert_eq!(result.diagnostics(), "checksum mismatch");
        assert_eq!(calls, ["provision", "start", "run", "stop", "release"]);
    }

    #[tokio::test]
    async fn provisioning_failure_starts_nothing() {
        let (result, calls) = run(Faults {
            provision: true,
            ..Default::default()
        })
        .await;
        assert!(matches!(result, Err(HarnessError::Provisioning(_))));
        assert_eq!(calls, ["provision"]);
    }

    #[tokio::test]
    async fn start_failure_still_stops_and_releases_once() {
        let (result, calls, stops) = run_recording_stops(Faults {
            start: true,
            ..Default::default()
        })
        .await;
        assert!(matches!(result, Err(HarnessError::Startup(_))));
        assert_eq!(calls, ["provision", "start", "stop", "release"]);
        assert_eq!(
            stops,
            [(SupervisorState::Failed, SupervisorState::Stopped)],
            "failed handle must be driven to stopped"
        );
    }

    #[tokio::test]
    async fn live_handle_is_stopped_from_running() {
        let (_, _, stops) = run_recording_stops(Faults::default()).await;
        assert_eq!(stops, [(SupervisorState::Running, SupervisorState::Stopped)]);
    }

    #[tokio::test]
    async fn run_error_still_stops_and_releases_once() {
        let (result, calls) = run(Faults {
            run_error: true,
            ..Default::default()
        })
        .await;
        assert!(matches!(result, Err(HarnessError::Scenario(_))));
        assert_eq!(calls, ["provision", "start", "run", "stop", "release"]);
    }

    #[tokio::test]
    async fn teardown_failures_do_not_mask_the_result() {
        let (result, calls) = run(Faults {
            stop: true,
            release: true,
            ..Default::default()
        })
        .await;
        assert!(result.unwrap().is_pass());
        assert_eq!(calls, ["provision", "start", "run", "stop", "release"]);
    }

    #[tokio::test]
    async fn teardown_failures_do_not_mask_the_primary_error() {
        let (result, _) = run(Faults {
            run_error: true,
            stop: true,
            release: true,
            ..Default::default()
        })
        .await;
        assert!(
            matches!(result, Err(HarnessError::Scenario(_))),
            "primary error must survive teardown failures"
        );
    }

    #[tokio::test]
    async fn orchestrator_is_reusable_across_invocations() {
        let (mut orch, log, _) = orchestrator(Faults::default());
        let case = TestCase::named("partition-reboots");
        orch.run(&case, &ServiceConfig::default()).await.unwrap();
        orch.run(&case, &ServiceConfig::default()).await.unwrap();
        let calls = calls(&log);
        assert_eq!(calls.iter().filter(|c| **c == "release").count(), 2);
        assert_eq!(calls.iter().filter(|c| **c == "stop").count(), 2);
    }
}

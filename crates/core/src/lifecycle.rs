//! Service lifecycle -- supervisor state machine and the role traits the
//! orchestrator is generic over.
//!
//! # Lifecycle
//! ```text
//! NotStarted → Starting → Ready → Running → Stopping → Stopped
//!                  │                  │
//!                  └──── Failed ◄─────┘
//! ```
//!
//! `stop` may be requested from any non-terminal state, so `NotStarted`,
//! `Starting`, `Ready`, `Running` and `Failed` can all move to `Stopping`
//! (or straight to `Stopped` when nothing was ever launched).

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, LifecycleError};
use crate::service_config::ServiceConfig;
use crate::types::{Endpoints, TestCase, TestResult};

// ─── SupervisorState ─────────────────────────────────────────────────

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SupervisorState {
    /// Transition table.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (NotStarted, Stopped)
                | (Starting, Ready)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Ready, Running)
                | (Ready, Stopping)
                | (Running, Failed)
                | (Running, Stopping)
                | (Failed, Stopping)
                | (Failed, Stopped)
                | (Stopping, Stopped)
        )
    }

    /// Move to `next`, rejecting transitions outside the table.
    pub fn transition_to(&mut self, next: Self) -> Result<(), LifecycleError> {
        if !self.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(from = %self, to = %next, "supervisor state transition");
        *self = next;
        Ok(())
    }

    /// `Stopped` is the only state nothing leaves.
    pub fn is_terminal(self) -> bool {
        self == Self::Stopped
    }

    /// The service accepts scenario traffic.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ─── Role traits ─────────────────────────────────────────────────────

/// Acquires and reclaims everything one invocation needs.
///
/// `release` consumes the environment; the orchestrator calls it exactly
/// once per successful `provision`. A failing `provision` must release its
/// own partial allocations before returning the error.
pub trait Provisioner: Send {
    /// Provisioned environment (ports, run dir, session, ...).
    type Env: Send;

    fn provision(
        &mut self,
        config: &ServiceConfig,
    ) -> impl Future<Output = Result<Self::Env, HarnessError>> + Send;

    fn release(&mut self, env: Self::Env) -> impl Future<Output = Result<(), HarnessError>> + Send;
}

/// A service instance that reached readiness.
pub trait ReadyHandle: Send {
    fn endpoints(&self) -> &Endpoints;

    fn state(&self) -> SupervisorState;

    /// `Ready → Running`, once the scenario takes over.
    fn mark_running(&mut self) -> Result<(), LifecycleError>;
}

/// Starts the service inside a provisioned environment and owns it until
/// teardown.
///
/// The handle exists before anything is launched, so the caller can hand
/// it to [`stop`](Self::stop) on every path, including a failed `start`.
pub trait ServiceSupervisor<E>: Send {
    type Handle: ReadyHandle;

    /// Handle for a service that has not been launched (`NotStarted`).
    fn prepare(&mut self, config: &ServiceConfig, env: &E) -> Self::Handle;

    /// Launch and block until ready. On any failure the partial start is
    /// forcibly terminated and the handle is left `Failed`.
    fn start(
        &mut self,
        handle: &mut Self::Handle,
        env: &mut E,
    ) -> impl Future<Output = Result<(), HarnessError>> + Send;

    /// Graceful stop, forced after the grace period. Safe from any state,
    /// idempotent.
    fn stop(
        &mut self,
        handle: &mut Self::Handle,
    ) -> impl Future<Output = Result<(), HarnessError>> + Send;
}

/// Drives one scenario against a live service.
///
/// Assertion failures and service crashes are reported as a failed
/// [`TestResult`], not as errors. `Err` means the scenario could not be
/// driven at all.
pub trait ScenarioRunner<H: ReadyHandle>: Send {
    fn run(
        &mut self,
        test_case: &TestCase,
        handle: &mut H,
    ) -> impl Future<Output = Result<TestResult, HarnessError>> + Send;
}

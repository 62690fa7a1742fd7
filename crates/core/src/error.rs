//! Error types, one enum per harness phase.
//!
//! Infrastructure failures (provisioning, startup, teardown) are errors.
//! A scenario whose assertions fail is *not* an error: it is reported as a
//! failed [`TestResult`](crate::types::TestResult).

use std::time::Duration;

/// Top-level harness error.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Harness or service configuration problem.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Resource acquisition failed; nothing was started.
    #[error("provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// The service did not reach `Ready`.
    #[error("startup error: {0}")]
    Startup(#[from] StartupError),

    /// A supervisor handle was driven through an illegal state change.
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// The scenario could not be driven at all (not an assertion failure).
    #[error("scenario error: {0}")]
    Scenario(#[from] ScenarioError),

    /// Shutdown or release did not complete.
    #[error("teardown error: {0}")]
    Teardown(#[from] TeardownError),

    /// A scenario completed with a failed result and the caller asked for it
    /// to be treated as an error (remote entry point).
    #[error("test '{name}' failed: {diagnostics}")]
    TestFailed { name: String, diagnostics: String },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    #[error("failed to serialize config: {reason}")]
    SerializeFailed { reason: String },

    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Resource acquisition errors.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    /// No free port could be reserved.
    #[error("port allocation failed after {allocated} of {requested} ports: {reason}")]
    PortExhausted {
        requested: usize,
        allocated: usize,
        reason: String,
    },

    /// Run directory, log path, or disk backing could not be created.
    #[error("workspace setup failed: {0}")]
    Workspace(String),

    /// Remote session could not be established or authenticated.
    #[error("session to '{target}' failed: {reason}")]
    Session { target: String, reason: String },

    /// Deployed service version could not be determined.
    #[error("version fetch failed: {0}")]
    VersionFetch(String),

    /// Deployed version is older than the configured minimum.
    #[error("server version {found} is older than required {required}")]
    IncompatibleVersion { found: String, required: String },

    /// Remote configuration could not be generated or uploaded.
    #[error("config generation failed: {0}")]
    ConfigGeneration(String),
}

/// Service startup errors.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// Readiness was not observed within the bound.
    #[error("service not ready within {timeout:?}")]
    Timeout { timeout: Duration },

    /// The service process or remote trigger could not be launched.
    #[error("failed to launch service: {0}")]
    SpawnFailed(String),

    /// The service exited before becoming ready (e.g. it rejected its config).
    #[error("service exited during startup: {status}")]
    ExitedEarly { status: String },
}

/// Supervisor state machine violations, raised by any phase that moves a
/// handle (start, scenario hand-over, stop).
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("illegal supervisor transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Errors that prevent a scenario from being driven.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("scenario descriptor not found: {0}")]
    NotFound(String),

    #[error("failed to launch scenario: {0}")]
    LaunchFailed(String),

    #[error("service handle is not ready: {state}")]
    NotReady { state: String },
}

/// Teardown errors. Logged by the orchestrator, never allowed to mask the
/// primary outcome.
#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error("graceful shutdown did not finish within {grace:?}")]
    GracefulTimeout { grace: Duration },

    #[error("forced termination failed: {0}")]
    ForceKillFailed(String),

    #[error("resource release failed: {0}")]
    Release(String),
}

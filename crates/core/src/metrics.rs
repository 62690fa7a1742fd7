//! Metric names and label keys.
//!
//! Recorded through the `metrics` facade; the harness installs no exporter,
//! so these are no-ops unless the embedding process installs a recorder.
//!
//! # Naming
//!
//! - prefix: `bsh_`
//! - suffix: `_total` (counter), `_seconds` (histogram)
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(bsh_core::metrics::RUNS_TOTAL, bsh_core::metrics::LABEL_RESULT => "pass").increment(1);
//! ```

/// Result label key (pass, fail, error)
pub const LABEL_RESULT: &str = "result";

/// Teardown phase label key (stop, release)
pub const LABEL_PHASE: &str = "phase";

/// Finished invocations (counter, label: result)
pub const RUNS_TOTAL: &str = "bsh_runs_total";

/// Time from launch to readiness (histogram, seconds)
pub const STARTUP_DURATION_SECONDS: &str = "bsh_startup_duration_seconds";

/// Scenario wall time (histogram, seconds)
pub const SCENARIO_DURATION_SECONDS: &str = "bsh_scenario_duration_seconds";

/// Failed stop or release steps (counter, label: phase)
pub const TEARDOWN_FAILURES_TOTAL: &str = "bsh_teardown_failures_total";

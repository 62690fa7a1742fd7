//! bsh-core -- shared types, errors, configuration, and the test orchestrator
//! for the blockstore scenario harness.
//!
//! The local (`bsh-local`) and remote (`bsh-remote`) harnesses implement the
//! role traits in [`lifecycle`] and are driven by
//! [`TestOrchestrator`](orchestrator::TestOrchestrator).

pub mod capability;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod orchestrator;
pub mod service_config;
pub mod types;

// --- re-exports ---

// errors
pub use error::{
    ConfigError, HarnessError, LifecycleError, ProvisioningError, ScenarioError, StartupError,
    TeardownError,
};

// config
pub use config::HarnessConfig;
pub use service_config::{ConfigOverrides, ServiceConfig, StorageOverrides, synthesize};

// lifecycle
pub use lifecycle::{Provisioner, ReadyHandle, ScenarioRunner, ServiceSupervisor, SupervisorState};
pub use orchestrator::TestOrchestrator;

// capabilities
pub use capability::{BoxFuture, ModuleFactories};

// domain types
pub use types::{Endpoints, ScenarioRef, TestCase, TestResult, TestStatus, thread_count};

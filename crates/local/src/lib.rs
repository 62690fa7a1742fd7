//! bsh-local -- boots the service under test as a local subprocess on
//! ephemeral ports and replays a scenario against it.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), bsh_core::HarnessError> {
//! use bsh_core::config::LocalConfig;
//! use bsh_core::service_config::{ConfigOverrides, synthesize};
//! use bsh_core::types::TestCase;
//! use bsh_local::LocalHarness;
//!
//! let mut harness = LocalHarness::new(LocalConfig::default());
//! let config = synthesize(&ConfigOverrides::default());
//! let result = harness
//!     .run(&TestCase::with_path("smoke", "scenarios/smoke.txt"), &config)
//!     .await?;
//! println!("{}", result.status());
//! # Ok(())
//! # }
//! ```

pub mod ports;
pub mod provisioner;
pub mod scenario;
pub mod supervisor;

use bsh_core::config::LocalConfig;
use bsh_core::error::HarnessError;
use bsh_core::orchestrator::TestOrchestrator;
use bsh_core::service_config::ServiceConfig;
use bsh_core::types::{TestCase, TestResult};

pub use ports::{PortAllocator, PortReservation};
pub use provisioner::{DiskBacking, LocalEnvironment, LocalProvisioner};
pub use scenario::LocalScenarioRunner;
pub use supervisor::{LocalServiceHandle, ProcessSupervisor};

/// Orchestrator wired with the local roles.
pub type LocalOrchestrator =
    TestOrchestrator<LocalProvisioner, ProcessSupervisor, LocalScenarioRunner>;

/// Local harness entry point.
pub struct LocalHarness {
    orchestrator: LocalOrchestrator,
}

impl LocalHarness {
    pub fn new(config: LocalConfig) -> Self {
        Self::with_allocator(config, PortAllocator::new())
    }

    pub fn with_allocator(config: LocalConfig, ports: PortAllocator) -> Self {
        let orchestrator = TestOrchestrator::new(
            LocalProvisioner::with_allocator(config.clone(), ports),
            ProcessSupervisor::new(config.clone()),
            LocalScenarioRunner::new(config),
        );
        Self { orchestrator }
    }

    /// Run one test case in a fresh environment. Teardown is complete when
    /// this returns.
    pub async fn run(
        &mut self,
        test_case: &TestCase,
        config: &ServiceConfig,
    ) -> Result<TestResult, HarnessError> {
        self.orchestrator.run(test_case, config).await
    }

    /// Ports currently held by environments of this harness.
    pub fn allocated_ports(&self) -> usize {
        self.orchestrator.provisioner().allocator().allocated_count()
    }
}

//! bsh-remote -- validates a service already deployed on a remote host.
//!
//! All host interaction goes through the capabilities in a
//! [`ModuleFactories`] bundle. [`production_factories`] wires the OpenSSH
//! session factory with the stub backends; tests substitute in-memory
//! fakes from [`testing`] (behind the `test-util` feature).

pub mod openssh;
pub mod provisioner;
pub mod runner;
pub mod scenario;
mod shell;
pub mod supervisor;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use std::sync::Arc;

use bsh_core::capability::ModuleFactories;

pub use openssh::OpenSshSessionFactory;
pub use provisioner::{RemoteEnvironment, RemoteProvisioner, check_version, session_target};
pub use runner::{RemoteOrchestrator, TestRunner};
pub use scenario::RemoteScenarioRunner;
pub use supervisor::{RemoteServiceHandle, RemoteSupervisor};

/// OpenSSH sessions with the stub result processor, version fetcher and
/// config generator.
pub fn production_factories() -> ModuleFactories {
    ModuleFactories::with_stubs(Arc::new(OpenSshSessionFactory::new()))
}

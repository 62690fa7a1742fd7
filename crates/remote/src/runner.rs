//! Remote validation entry point.

use bsh_core::capability::ModuleFactories;
use bsh_core::config::RemoteConfig;
use bsh_core::error::HarnessError;
use bsh_core::orchestrator::TestOrchestrator;
use bsh_core::service_config::{ConfigOverrides, synthesize};
use bsh_core::types::{TestCase, TestResult, thread_count};
use tracing::info;

use crate::provisioner::RemoteProvisioner;
use crate::scenario::RemoteScenarioRunner;
use crate::supervisor::RemoteSupervisor;

/// Orchestrator wired with the remote roles.
pub type RemoteOrchestrator =
    TestOrchestrator<RemoteProvisioner, RemoteSupervisor, RemoteScenarioRunner>;

/// Runs validation test cases against the deployed service on one host.
#[derive(Debug, Clone)]
pub struct TestRunner {
    config: RemoteConfig,
    factories: ModuleFactories,
}

impl TestRunner {
    pub fn new(config: RemoteConfig, factories: ModuleFactories) -> Self {
        Self { config, factories }
    }

    fn orchestrator(&self) -> RemoteOrchestrator {
        TestOrchestrator::new(
            RemoteProvisioner::new(self.config.clone(), self.factories.clone()),
            RemoteSupervisor::new(self.config.clone(), self.factories.session_factory.clone()),
            RemoteScenarioRunner::new(self.config.clone()),
        )
    }

    /// Provision, start, validate, tear down, and publish the result.
    ///
    /// A failed scenario is published first and then returned as
    /// [`HarnessError::TestFailed`], so callers see one error path.
    pub async fn run_test(
        &self,
        test_case: &TestCase,
        overrides: &ConfigOverrides,
    ) -> Result<TestResult, HarnessError> {
        self.config.validate()?;

        let mut overrides = overrides.clone();
        overrides.server.threads_count.get_or_insert_with(thread_count);
        let service_config = synthesize(&overrides);
        info!(
            host = self.config.host.as_str(),
            test = test_case.name(),
            threads = service_config.server.server.threads_count,
            "starting remote validation"
        );

        let result = self.orchestrator().run(test_case, &service_config).await?;
        self.factories
            .result_processor
            .process(test_case, &result)
            .await?;

        if !result.is_pass() {
            return Err(HarnessError::TestFailed {
                name: test_case.name().to_owned(),
                diagnostics: result.diagnostics().to_owned(),
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use bsh_core::types::TestStatus;

    use super::*;
    use crate::testing::{FakeSessionFactory, RecordingResultProcessor, Reply, fixed_factories};

    const DOCUMENT: &str = "[server]\nfixed = true\n";

    fn config() -> RemoteConfig {
        RemoteConfig {
            host: "validation-01".to_owned(),
            readiness_poll_ms: 10,
            shutdown_grace_secs: 1,
            ..RemoteConfig::default()
        }
    }

    #[tokio::test]
    async fn passing_run_is_published_and_torn_down() {
        let factory = FakeSessionFactory::default();
        let results = RecordingResultProcessor::default();
        let runner = TestRunner::new(
            config(),
            fixed_factories(factory.clone(), DOCUMENT, results.clone()),
        );

        let result = runner
            .run_test(&TestCase::named("checkpoint-validation"), &ConfigOverrides::default())
            .await
            .unwrap();

        assert!(result.is_pass());
        assert_eq!(
            results.seen(),
            [("checkpoint-validation".to_owned(), TestStatus::Pass)]
        );
        assert_eq!(factory.open_sessions(), 0);
        let commands = factory.commands();
        assert_eq!(commands.iter().filter(|c| c.starts_with("rm -rf")).count(), 1);
        assert_eq!(commands.iter().filter(|c| c.starts_with("kill -TERM")).count(), 1);
    }

    #[tokio::test]
    async fn fixed_document_is_uploaded_verbatim() {
        let factory = FakeSessionFactory::default();
        let runner = TestRunner::new(
            config(),
            fixed_factories(factory.clone(), DOCUMENT, RecordingResultProcessor::default()),
        );
        runner
            .run_test(&TestCase::named("checkpoint-validation"), &ConfigOverrides::default())
            .await
            .unwrap();

        let launched = &factory.channels()[0];
        let config_path = launched
            .split_whitespace()
            .skip_while(|w| *w != "--config")
            .nth(1)
            .expect("config path on the command line");
        assert_eq!(factory.file(config_path).as_deref(), Some(DOCUMENT.as_bytes()));
    }

    #[tokio::test]
    async fn failed_scenario_is_published_then_returned_as_error() {
        let factory = FakeSessionFactory::default()
            .reply("cd /tmp/bsh", Reply::status(3, "checkpoint diverged"));
        let results = RecordingResultProcessor::default();
        let runner = TestRunner::new(
            config(),
            fixed_factories(factory.clone(), DOCUMENT, results.clone()),
        );

        let err = runner
            .run_test(&TestCase::named("checkpoint-validation"), &ConfigOverrides::default())
            .await
            .unwrap_err();

        match err {
            HarnessError::TestFailed { name, diagnostics } => {
                assert_eq!(name, "checkpoint-validation");
                assert!(diagnostics.contains("checkpoint diverged"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(results.seen()[0].1, TestStatus::Fail);
        assert_eq!(factory.open_sessions(), 0);
    }

    #[tokio::test]
    async fn missing_host_is_rejected_before_connecting() {
        let factory = FakeSessionFactory::default();
        let runner = TestRunner::new(
            RemoteConfig::default(),
            fixed_factories(factory.clone(), DOCUMENT, RecordingResultProcessor::default()),
        );
        let err = runner
            .run_test(&TestCase::named("checkpoint-validation"), &ConfigOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
        assert!(factory.commands().is_empty());
    }
}

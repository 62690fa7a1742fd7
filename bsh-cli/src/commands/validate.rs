//! `bsh validate` command handler

use tracing::{error, info};

use bsh_core::capability::ModuleFactories;
use bsh_core::config::RemoteConfig;
use bsh_core::service_config::ConfigOverrides;
use bsh_core::types::{TestCase, TestResult};
use bsh_remote::{TestRunner, production_factories};

use crate::cli::ValidateArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, RunReport};

/// Execute the `validate` command with the production capabilities.
///
/// A config file that failed to load, or overrides that fail to parse, end
/// the run like any other failure: one `Test failed` line and exit code 1.
pub async fn execute(
    args: ValidateArgs,
    loaded: Result<&RemoteConfig, &CliError>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let (config, overrides) = match setup(&args, loaded) {
        Ok(setup) => setup,
        Err(e) => return Err(report_failure(e)),
    };
    let test_case = TestCase::named(args.test_case);

    let result = run_validation(config, &test_case, &overrides, production_factories()).await?;
    writer.render(&RunReport::new(&test_case, &result))?;
    Ok(())
}

fn setup(
    args: &ValidateArgs,
    loaded: Result<&RemoteConfig, &CliError>,
) -> Result<(RemoteConfig, ConfigOverrides), String> {
    let mut config = loaded.map_err(ToString::to_string)?.clone();
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    let overrides = args.overrides.to_overrides().map_err(|e| e.to_string())?;
    Ok((config, overrides))
}

fn report_failure(reason: impl std::fmt::Display) -> CliError {
    error!("Test failed: {reason}");
    CliError::TestFailed(reason.to_string())
}

/// Run one remote validation and report it the way CI expects: exactly one
/// `Test finished successfully` or `Test failed: <error>` line.
pub async fn run_validation(
    config: RemoteConfig,
    test_case: &TestCase,
    overrides: &ConfigOverrides,
    factories: ModuleFactories,
) -> Result<TestResult, CliError> {
    let runner = TestRunner::new(config, factories);
    match runner.run_test(test_case, overrides).await {
        Ok(result) => {
            info!("Test finished successfully");
            Ok(result)
        }
        Err(e) => Err(report_failure(e)),
    }
}

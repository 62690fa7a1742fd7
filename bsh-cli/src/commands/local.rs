//! `bsh local` command handler

use tracing::info;

use bsh_core::config::LocalConfig;
use bsh_core::service_config::synthesize;
use bsh_core::types::{TestCase, builtin_test_cases, find_test_case};
use bsh_local::LocalHarness;

use crate::cli::LocalArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, RunReport};

/// Execute the `local` command.
///
/// A failed scenario renders its report and then returns
/// [`CliError::TestFailed`].
pub async fn execute(
    args: LocalArgs,
    config: &LocalConfig,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let config = effective_config(&args, config);
    config.validate()?;

    let test_case = resolve_test_case(&args, &config)?;
    let overrides = args.overrides.to_overrides()?;
    let service_config = synthesize(&overrides);
    info!(
        test = test_case.name(),
        binary = %config.service_binary.display(),
        threads = service_config.server.server.threads_count,
        overlays = service_config.storage_overlays.len(),
        "running local test"
    );

    let mut harness = LocalHarness::new(config);
    let result = harness.run(&test_case, &service_config).await?;
    writer.render(&RunReport::new(&test_case, &result))?;

    if !result.is_pass() {
        return Err(CliError::TestFailed(format!(
            "{} did not pass",
            test_case.name()
        )));
    }
    Ok(())
}

fn effective_config(args: &LocalArgs, config: &LocalConfig) -> LocalConfig {
    let mut config = config.clone();
    if let Some(binary) = &args.service_binary {
        config.service_binary = binary.clone();
    }
    if let Some(binary) = &args.scenario_binary {
        config.scenario_binary = binary.clone();
    }
    if let Some(dir) = &args.artifacts_dir {
        config.artifacts_dir = dir.clone();
    }
    config
}

fn resolve_test_case(args: &LocalArgs, config: &LocalConfig) -> Result<TestCase, CliError> {
    if let Some(path) = &args.scenario {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scenario".to_owned());
        return Ok(TestCase::with_path(name, path.clone()));
    }

    find_test_case(&config.scenario_root, &args.test_case).ok_or_else(|| {
        let known: Vec<String> = builtin_test_cases(&config.scenario_root)
            .iter()
            .map(|case| case.name().to_owned())
            .collect();
        CliError::Command(format!(
            "unknown test case: {} (expected one of: {})",
            args.test_case,
            known.join(", ")
        ))
    })
}

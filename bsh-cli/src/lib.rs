//! bsh command-line interface.
//!
//! The binary in `main.rs` parses arguments, loads `bsh.toml`, installs the
//! tracing subscriber and hands off to [`run`].

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod output;

use std::path::{Path, PathBuf};

use bsh_core::config::{GeneralConfig, HarnessConfig};

use crate::cli::{Cli, Commands};
use crate::error::CliError;
use crate::output::OutputWriter;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "bsh.toml";

/// Locate the config file: an explicit path always wins and must exist,
/// otherwise `./bsh.toml` is used if present.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        }
    }
}

/// Load the harness configuration.
///
/// Without a file, built-in defaults plus `BSH_*` environment overrides are
/// used.
pub async fn load_config(path: Option<&Path>) -> Result<HarnessConfig, CliError> {
    let config = match path {
        Some(path) => HarnessConfig::load(path).await?,
        None => {
            let mut config = HarnessConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

/// `[general]` with the `--log-level` / `--log-format` flags applied.
pub fn effective_general(cli: &Cli, general: &GeneralConfig) -> GeneralConfig {
    let mut general = general.clone();
    if let Some(level) = &cli.log_level {
        general.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        general.log_format = format.clone();
    }
    general
}

/// Dispatch a parsed command line.
///
/// `loaded` is passed through unresolved so `config validate` can report a
/// broken file and `validate` can fail with its usual summary line. `local`
/// fails on it directly.
pub async fn run(
    cli: Cli,
    source: &str,
    loaded: Result<HarnessConfig, CliError>,
) -> Result<(), CliError> {
    let writer = OutputWriter::new(cli.output);

    match cli.command {
        Commands::Config(args) => {
            commands::config::execute(args, source, loaded.as_ref(), &writer)
        }
        Commands::Local(args) => {
            let config = loaded?;
            commands::local::execute(args, &config.local, &writer).await
        }
        Commands::Validate(args) => {
            let remote = loaded.as_ref().map(|config| &config.remote);
            commands::validate::execute(args, remote, &writer).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn explicit_config_path_is_kept_even_if_missing() {
        let path = config_path(Some(Path::new("/nonexistent/bsh.toml")));
        assert_eq!(path, Some(PathBuf::from("/nonexistent/bsh.toml")));
    }

    #[test]
    fn log_flags_override_general_section() {
        let cli = Cli::try_parse_from(["bsh", "--log-format", "pretty", "config", "validate"])
            .unwrap();
        let general = effective_general(&cli, &GeneralConfig::default());
        assert_eq!(general.log_format, "pretty");
        assert_eq!(general.log_level, GeneralConfig::default().log_level);
    }

    #[tokio::test]
    async fn explicit_missing_file_is_a_config_error() {
        let err = load_config(Some(Path::new("/nonexistent/bsh.toml")))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}

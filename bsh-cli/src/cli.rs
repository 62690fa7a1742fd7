//! CLI argument parsing using clap derive API
//!
//! Purely declarative: no I/O happens here.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// bsh -- blockstore scenario harness.
///
/// Use `bsh <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "bsh", version, about, long_about = None)]
pub struct Cli {
    /// Path to bsh.toml. Without it, ./bsh.toml is used when present,
    /// built-in defaults otherwise.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Boot the service locally and run a scenario against it.
    Local(LocalArgs),

    /// Validate the service deployed on the configured remote host.
    Validate(ValidateArgs),

    /// Manage configuration.
    Config(ConfigArgs),
}

// ---- shared ----

/// Service configuration overrides.
#[derive(Args, Debug, Default, Clone)]
pub struct OverrideArgs {
    /// Storage service overrides as JSON, e.g. '{"throttling_enabled": false}'.
    /// Omitted: the default test patch.
    #[arg(long, value_name = "JSON")]
    pub storage_override: Option<String>,

    /// Storage overlay as JSON. Repeat to apply several, in order.
    #[arg(long = "storage-overlay", value_name = "JSON")]
    pub storage_overlays: Vec<String>,

    /// Server and scenario thread count (default: BSH_THREAD_COUNT or
    /// available parallelism).
    #[arg(long)]
    pub threads: Option<u32>,
}

// ---- local ----

/// Run one scenario against a locally started service.
#[derive(Args, Debug)]
pub struct LocalArgs {
    /// Built-in test case to run.
    #[arg(long, default_value = "partition-reboots", conflicts_with = "scenario")]
    pub test_case: String,

    /// Scenario descriptor file, instead of a built-in test case.
    #[arg(long)]
    pub scenario: Option<PathBuf>,

    /// Override `local.service_binary`.
    #[arg(long)]
    pub service_binary: Option<PathBuf>,

    /// Override `local.scenario_binary`.
    #[arg(long)]
    pub scenario_binary: Option<PathBuf>,

    /// Keep per-run directories here (overrides `local.artifacts_dir`).
    #[arg(long)]
    pub artifacts_dir: Option<String>,

    #[command(flatten)]
    pub overrides: OverrideArgs,
}

// ---- validate ----

/// Run the validation scenario on the remote host.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Validation test case name, passed to the scenario command.
    #[arg(long, default_value = "checkpoint-validation")]
    pub test_case: String,

    /// Override `remote.host`.
    #[arg(long)]
    pub host: Option<String>,

    #[command(flatten)]
    pub overrides: OverrideArgs,
}

// ---- config ----

/// Manage bsh configuration.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors.
    Validate,
    /// Show the effective configuration (file + env overrides + defaults).
    Show {
        /// Show only one section (general, local, remote).
        #[arg(long)]
        section: Option<String>,
    },
}

use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;

use bsh_cli::cli::Cli;
use bsh_cli::commands::config::source_label;
use bsh_cli::error::CliError;
use bsh_cli::{config_path, effective_general, load_config, logging, run};
use bsh_core::config::GeneralConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let path = config_path(cli.config.as_deref());
    let source = source_label(path.as_deref());
    let loaded = load_config(path.as_deref()).await;

    let general = match &loaded {
        Ok(config) => effective_general(&cli, &config.general),
        Err(_) => effective_general(&cli, &GeneralConfig::default()),
    };
    if let Err(e) = logging::init_tracing(&general) {
        eprintln!("{} {e:#}", "error:".red().bold());
        return ExitCode::from(2);
    }

    tracing::debug!(config = %source, "bsh starting");

    match run(cli, &source, loaded).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn report(e: &CliError) {
    eprintln!("{} {e}", "error:".red().bold());
}

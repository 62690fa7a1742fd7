//! Process-wide tracing setup for `bsh`.
//!
//! Everything is written to stderr. Stdout carries only the rendered run
//! report, which CI pipes into other tools.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use bsh_core::config::GeneralConfig;

/// Install the global subscriber described by `[general]`.
///
/// `log_format` selects `json` lines (the CI default) or multi-line
/// `pretty` records for a terminal. A `RUST_LOG` directive wins over
/// `log_level`. An unrecognised format fails before anything is installed.
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.log_format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        "pretty" => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
        other => return Err(anyhow!("log format must be json or pretty, got '{other}'")),
    };
    installed.map_err(|e| anyhow!("cannot install {} log subscriber: {e}", config.log_format))
}

//! `bsh config` command handler

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use bsh_core::config::HarnessConfig;

use crate::cli::{ConfigAction, ConfigArgs};
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `config` command.
///
/// `loaded` is the outcome of loading `source`; validation reports it
/// instead of failing early.
pub fn execute(
    args: ConfigArgs,
    source: &str,
    loaded: Result<&HarnessConfig, &CliError>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    match args.action {
        ConfigAction::Validate => execute_validate(source, loaded, writer),
        ConfigAction::Show { section } => {
            let config = loaded.map_err(|e| CliError::Config(e.to_string()))?;
            execute_show(source, config, section, writer)
        }
    }
}

/// Validate the loaded config. Remote settings are checked only when a
/// remote host is configured.
fn execute_validate(
    source: &str,
    loaded: Result<&HarnessConfig, &CliError>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    info!(source, "validating configuration");

    let errors: Vec<String> = match loaded {
        Ok(config) if !config.remote.host.is_empty() => config
            .remote
            .validate()
            .err()
            .map(|e| e.to_string())
            .into_iter()
            .collect(),
        Ok(_) => Vec::new(),
        Err(e) => vec![e.to_string()],
    };
    let report = ConfigValidationReport {
        source: source.to_owned(),
        valid: errors.is_empty(),
        errors,
    };

    writer.render(&report)?;

    if !report.valid {
        return Err(CliError::Config("configuration is invalid".to_owned()));
    }
    Ok(())
}

fn execute_show(
    source: &str,
    config: &HarnessConfig,
    section: Option<String>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let config_toml = match section.as_deref() {
        None => toml::to_string_pretty(config),
        Some("general") => toml::to_string_pretty(&config.general),
        Some("local") => toml::to_string_pretty(&config.local),
        Some("remote") => toml::to_string_pretty(&config.remote),
        Some(other) => {
            return Err(CliError::Command(format!(
                "unknown section: {other} (expected: general, local, remote)"
            )));
        }
    }
    .map_err(|e| CliError::Command(format!("failed to serialize config: {e}")))?;

    writer.render(&ConfigReport {
        source: source.to_owned(),
        section,
        config_toml,
    })
}

/// Effective configuration, rendered as TOML in text mode.
#[derive(Serialize)]
pub struct ConfigReport {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub config_toml: String,
}

impl Render for ConfigReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        match &self.section {
            Some(section) => writeln!(
                w,
                "Configuration {} (source: {})",
                format!("[{section}]").bold(),
                self.source
            )?,
            None => writeln!(w, "Configuration (source: {})", self.source.bold())?,
        }
        writeln!(w)?;
        write!(w, "{}", self.config_toml)
    }
}

/// Configuration validation report.
#[derive(Serialize)]
pub struct ConfigValidationReport {
    pub source: String,
    pub valid: bool,
    /// Empty when valid.
    pub errors: Vec<String>,
}

impl Render for ConfigValidationReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        if self.valid {
            writeln!(w, "{} {}", "valid".green().bold(), self.source)
        } else {
            writeln!(w, "{} {}", "invalid".red().bold(), self.source)?;
            for error in &self.errors {
                writeln!(w, "  - {error}")?;
            }
            Ok(())
        }
    }
}

/// Describe where the config came from.
pub fn source_label(path: Option<&Path>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "(defaults)".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::OutputFormat;

    fn render<T: Render + Serialize>(payload: &T) -> String {
        colored::control::set_override(false);
        let mut buf = Vec::new();
        OutputWriter::new(OutputFormat::Text)
            .render_to(payload, &mut buf)
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn invalid_report_lists_errors() {
        let text = render(&ConfigValidationReport {
            source: "bsh.toml".to_owned(),
            valid: false,
            errors: vec!["remote.host: must not be empty".to_owned()],
        });
        assert!(text.starts_with("invalid bsh.toml"));
        assert!(text.contains("  - remote.host"));
    }

    #[test]
    fn show_unknown_section_is_a_command_error() {
        let writer = OutputWriter::new(OutputFormat::Json);
        let err = execute_show(
            "bsh.toml",
            &HarnessConfig::default(),
            Some("ebpf".to_owned()),
            &writer,
        )
        .unwrap_err();
        assert!(matches!(err, CliError::Command(_)));
    }

    #[test]
    fn validate_reports_remote_errors_only_when_host_is_set() {
        let writer = OutputWriter::new(OutputFormat::Json);
        let mut config = HarnessConfig::default();
        assert!(execute_validate("bsh.toml", Ok(&config), &writer).is_ok());

        config.remote.host = "validation-01".to_owned();
        config.remote.remote_root = "relative".to_owned();
        let err = execute_validate("bsh.toml", Ok(&config), &writer).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn source_label_without_file() {
        assert_eq!(source_label(None), "(defaults)");
        assert_eq!(source_label(Some(Path::new("ci/bsh.toml"))), "ci/bsh.toml");
    }
}

//! Output formatting abstraction for text vs JSON rendering
//!
//! All subcommand output flows through [`OutputWriter`] which handles format switching.

use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;

use bsh_core::types::{TestCase, TestResult, TestStatus};

use crate::cli::OutputFormat;
use crate::error::CliError;

/// Writes CLI payloads to stdout in the selected format.
pub struct OutputWriter {
    format: OutputFormat,
}

impl OutputWriter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Render a payload to stdout.
    pub fn render<T: Render + Serialize>(&self, payload: &T) -> Result<(), CliError> {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        self.render_to(payload, &mut handle)
    }

    /// Render a payload to `w`.
    pub fn render_to<T: Render + Serialize>(
        &self,
        payload: &T,
        w: &mut dyn Write,
    ) -> Result<(), CliError> {
        match self.format {
            OutputFormat::Text => payload.render_text(w)?,
            OutputFormat::Json => {
                serde_json::to_writer_pretty(&mut *w, payload)?;
                writeln!(w)?;
            }
        }
        Ok(())
    }
}

/// Human-readable text rendering, implemented alongside `Serialize`.
pub trait Render {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()>;
}

/// Outcome of one harness run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub test: String,
    pub scenario: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub diagnostics: String,
    pub artifacts: Vec<PathBuf>,
}

impl RunReport {
    pub fn new(test_case: &TestCase, result: &TestResult) -> Self {
        Self {
            test: test_case.name().to_owned(),
            scenario: test_case.scenario().to_string(),
            status: result.status(),
            diagnostics: result.diagnostics().to_owned(),
            artifacts: result.artifact_paths().to_vec(),
        }
    }
}

impl Render for RunReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        let status = match self.status {
            TestStatus::Pass => "PASS".green().bold(),
            TestStatus::Fail => "FAIL".red().bold(),
        };
        writeln!(w, "{status} {} ({})", self.test.bold(), self.scenario)?;
        for artifact in &self.artifacts {
            writeln!(w, "  artifact: {}", artifact.display())?;
        }
        if !self.diagnostics.is_empty() {
            writeln!(w)?;
            writeln!(w, "{}", self.diagnostics)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> RunReport {
        RunReport::new(
            &TestCase::with_path("partition-reboots", "loadtest/local-v2/partition-reboots.txt"),
            &TestResult::fail("block 42: checksum mismatch", vec![PathBuf::from("/tmp/nbs.log")]),
        )
    }

    #[test]
    fn text_report_lists_status_artifacts_and_diagnostics() {
        colored::control::set_override(false);
        let mut buf = Vec::new();
        OutputWriter::new(OutputFormat::Text)
            .render_to(&report(), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("FAIL partition-reboots"));
        assert!(text.contains("artifact: /tmp/nbs.log"));
        assert!(text.contains("checksum mismatch"));
    }

    #[test]
    fn json_report_is_parseable() {
        let mut buf = Vec::new();
        OutputWriter::new(OutputFormat::Json)
            .render_to(&report(), &mut buf)
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["status"], "fail");
        assert_eq!(value["test"], "partition-reboots");
    }
}

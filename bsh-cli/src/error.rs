//! CLI-specific error types and exit code mapping

use bsh_core::error::HarnessError;

/// CLI-specific error type.
///
/// The `exit_code()` method maps errors to process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// A subcommand-specific operation failed.
    #[error("{0}")]
    Command(String),

    /// A test ran and did not pass, or could not be run at all.
    #[error("test failed: {0}")]
    TestFailed(String),

    /// JSON serialisation failed during output rendering.
    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    /// IO error (file read, stdout write, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped harness error.
    #[error("{0}")]
    Harness(#[from] HarnessError),
}

impl CliError {
    /// Map the error to a process exit code.
    ///
    /// | Code | Meaning                        |
    /// |------|--------------------------------|
    /// | 0    | Success                        |
    /// | 1    | Command, test or harness error |
    /// | 2    | Configuration error            |
    /// | 10   | IO error                       |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Io(_) => 10,
            Self::Harness(HarnessError::Config(_)) => 2,
            Self::Harness(HarnessError::Io(_)) => 10,
            Self::Command(_) | Self::TestFailed(_) | Self::JsonSerialize(_) | Self::Harness(_) => 1,
        }
    }
}

//! CLI error type and exit code mapping

use reconhive_core::error::ReconError;
use reconhive_core::lifecycle::ScanOutcome;

/// Every way a command can end unsuccessfully.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Preset loading or validation failure
    #[error("configuration error: {0}")]
    Config(String),

    /// A subcommand-specific operation failed
    #[error("{0}")]
    Command(String),

    /// The scan was cancelled by the user
    #[error("You killed {scan}")]
    Aborted { scan: String },

    /// Interrupted before a scan existed
    #[error("Interrupted")]
    Interrupted,

    /// The scan stopped on an unrecoverable error
    #[error("scan failed: {0}")]
    Fatal(String),

    /// One or more tool dependencies could not be installed
    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped error from reconhive-core
    #[error("{0}")]
    Core(#[from] ReconError),
}

impl CliError {
    /// Maps the error to a process exit code.
    ///
    /// | Code | Meaning                         |
    /// |------|---------------------------------|
    /// | 0    | Success, with or without findings |
    /// | 1    | Aborted or general error         |
    /// | 2    | Configuration error              |
    /// | 3    | Fatal scan error                 |
    /// | 10   | IO error                         |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Fatal(_) => 3,
            Self::Io(_) => 10,
            Self::Core(ReconError::Io(_)) => 10,
            Self::Core(e) => match ScanOutcome::from_error(e) {
                ScanOutcome::ConfigurationError => 2,
                ScanOutcome::Aborted => 1,
                _ => 3,
            },
            Self::Aborted { .. }
            | Self::Interrupted
            | Self::Command(_)
            | Self::Dependency(_)
            | Self::JsonSerialize(_) => 1,
        }
    }
}

//! CLI error types.

use std::path::PathBuf;

use thiserror::Error;
use tidewire_channel::ChannelError;

use crate::logging::LoggingError;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors that can occur in the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Settings file could not be used.
    #[error("configuration error in {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    /// Settings could not be rendered.
    #[error("failed to serialize config: {0}")]
    Serialize(String),

    /// Logging setup failed.
    #[error(transparent)]
    Logging(#[from] LoggingError),

    /// Channel, connection or remote error.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

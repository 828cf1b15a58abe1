//! Tracing subscriber setup.
//!
//! The library crates only emit `tracing` events; installing a subscriber
//! is the binary's job. `RUST_LOG` overrides the configured filter.
//!
//! ```ignore
//! use tidewire_cli::logging::{init_logging, LogConfig, LogFormat};
//!
//! init_logging(&LogConfig::default().with_format(LogFormat::Json))?;
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Failed to set global subscriber
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    /// Failed to parse env filter directive
    #[error("failed to parse log filter: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::ParseError),
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-readable
    Pretty,
    /// Single line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Level for tidewire crates when neither `RUST_LOG` nor `filter` is set.
    pub default_level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Explicit filter directive, e.g. `tidewire_channel=debug`.
    pub filter: Option<String>,
    /// Include file and line.
    pub include_location: bool,
    /// Log span open/close (shows dispatch timings).
    pub include_span_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            format: LogFormat::Compact,
            filter: None,
            include_location: false,
            include_span_events: false,
        }
    }
}

impl LogConfig {
    /// Debug preset used by `--debug`.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            default_level: Level::DEBUG,
            include_location: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Filter used when `RUST_LOG` is unset.
    pub fn default_directive(&self) -> String {
        match &self.filter {
            Some(filter) => filter.clone(),
            None => {
                let level = self.default_level.as_str().to_lowercase();
                format!("tidewire={level},tidewire_protocol={level},tidewire_channel={level},tidewire_cli={level}")
            }
        }
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a subscriber is already installed or the filter does not parse.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.default_directive())?,
    };

    let span_events = if config.include_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_span_events(span_events)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(env_filter).with(layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_covers_all_crates() {
        let directive = LogConfig::default().default_directive();
        assert_eq!(
            directive,
            "tidewire=info,tidewire_protocol=info,tidewire_channel=info,tidewire_cli=info"
        );
        assert!(EnvFilter::try_new(&directive).is_ok());
    }

    #[test]
    fn debug_preset() {
        let config = LogConfig::debug();
        assert_eq!(config.default_level, Level::DEBUG);
        assert!(config.include_location);
        assert!(config.default_directive().contains("tidewire_channel=debug"));
    }

    #[test]
    fn explicit_filter_wins() {
        let config = LogConfig::default()
            .with_filter("tidewire_channel=trace")
            .with_format(LogFormat::Json);
        assert_eq!(config.default_directive(), "tidewire_channel=trace");
        assert_eq!(config.format, LogFormat::Json);
    }
}

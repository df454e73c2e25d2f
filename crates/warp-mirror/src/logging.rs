//! Structured logging setup
//!
//! The manager itself only emits `tracing` events. Applications that have
//! no subscriber of their own can install one here; `RUST_LOG` takes
//! precedence over the configured level.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logging setup errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// Unknown level name
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// A global subscriber could not be installed
    #[error("Failed to install subscriber: {0}")]
    Init(String),
}

/// Log levels compatible with tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Every copy and lookup
    Trace,
    /// Registry changes
    Debug,
    /// Device initialization
    #[default]
    Info,
    /// Recoverable oddities
    Warn,
    /// Detected errors
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    #[must_use]
    pub const fn to_tracing_level(&self) -> Level {
        match self {
            Self::Trace => Level::TRACE,
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warn => Level::WARN,
            Self::Error => Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Output format for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human-readable output
    Pretty,
    /// Single-line output
    #[default]
    Compact,
    /// JSON lines
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum level when `RUST_LOG` is unset
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Include the module path
    pub include_target: bool,
    /// Include file and line
    pub include_file_line: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            include_target: true,
            include_file_line: false,
        }
    }
}

/// Install a global stderr subscriber for `config`
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(config.include_target)
        .with_file(config.include_file_line)
        .with_line_number(config.include_file_line);

    let result = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| LoggingError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Trace.to_string(), "trace");
        assert_eq!(LogLevel::Error.to_tracing_level(), Level::ERROR);
    }

    #[test]
    fn test_init_once() {
        let config = LogConfig {
            level: LogLevel::Debug,
            ..LogConfig::default()
        };
        assert!(init_logging(&config).is_ok());
        // A second global subscriber is refused
        assert!(matches!(init_logging(&config), Err(LoggingError::Init(_))));
    }
}

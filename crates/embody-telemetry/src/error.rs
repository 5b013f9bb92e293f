//! Telemetry error types.

use thiserror::Error;

/// Errors raised while building or installing the log subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The level or format in the configuration is not recognised.
    #[error("invalid logging configuration: {0}")]
    ConfigError(String),

    /// A per-target directive did not parse.
    #[error("invalid directive '{directive}': {reason}")]
    InvalidDirective {
        /// The directive as written.
        directive: String,
        /// Parser message.
        reason: String,
    },

    /// A global subscriber is already installed.
    #[error("logging already initialized: {0}")]
    InitError(String),

    /// The log directory could not be created.
    #[error("log directory: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

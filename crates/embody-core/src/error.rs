//! Parse errors for core types.

use thiserror::Error;

/// Errors raised when parsing core types from strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Unknown trust level name.
    #[error("unknown trust level: {0}")]
    UnknownTrustLevel(String),

    /// Unknown agent role name.
    #[error("unknown agent role: {0}")]
    UnknownRole(String),

    /// Malformed session token.
    #[error("malformed session token")]
    MalformedToken,
}

/// Result type for core parsing.
pub type CoreResult<T> = Result<T, CoreError>;

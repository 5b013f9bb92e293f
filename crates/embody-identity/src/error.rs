//! Identity registry errors.

use embody_core::AgentId;

/// Errors that can occur during identity operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// The agent is already registered with a different key.
    #[error("agent already registered with a different key: {0}")]
    DuplicateAgent(AgentId),

    /// No identity on file.
    #[error("identity not found: {0}")]
    NotFound(AgentId),

    /// The identity has been revoked and cannot be used or re-registered.
    #[error("identity revoked: {0}")]
    Revoked(AgentId),

    /// The rotation proof was not signed by the current key.
    #[error("invalid key rotation proof for {0}")]
    InvalidRotationProof(AgentId),

    /// Internal identity error
    #[error("internal identity error: {0}")]
    Internal(String),
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;

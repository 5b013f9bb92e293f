//! Discovery error types.

use embody_core::{AgentId, BodyId};
use thiserror::Error;

/// Errors from the capability index.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The body definition is unusable.
    #[error("invalid body {body_id}: {reason}")]
    InvalidBody {
        /// Body being published.
        body_id: BodyId,
        /// What is wrong with it.
        reason: String,
    },

    /// A host tried to re-publish a body owned by another host.
    #[error("body {body_id} is owned by {owner}, not {requester}")]
    NotOwner {
        /// Contested body.
        body_id: BodyId,
        /// Current owner.
        owner: AgentId,
        /// Host that attempted the update.
        requester: AgentId,
    },

    /// Lock poisoned.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

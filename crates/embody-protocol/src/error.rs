//! Protocol and signature error types.

use embody_core::AgentId;
use thiserror::Error;

use crate::messages::MessageType;

/// The envelope could not be parsed. Raised before any business logic runs.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload exceeds the accepted envelope size.
    #[error("envelope too large: {size} bytes (max {max})")]
    TooLarge {
        /// Received size.
        size: usize,
        /// Accepted maximum.
        max: usize,
    },

    /// Not JSON, or missing/mistyped envelope fields.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The `type` field names no known message.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The body does not match the schema of its type.
    #[error("invalid {message_type} body: {reason}")]
    InvalidBody {
        /// Declared message type.
        message_type: MessageType,
        /// Decoder message.
        reason: String,
    },

    /// Encoding an outgoing message failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for envelope parsing and building.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// The envelope parsed but failed authentication. Fatal for the request and
/// never retried by the receiver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// No usable key on file for the sender (unknown or revoked).
    #[error("unknown agent: {agent}")]
    UnknownAgent {
        /// Claimed sender.
        agent: AgentId,
    },

    /// Sender timestamp is outside the accepted window.
    #[error("clock skew of {skew_ms} ms exceeds window of {window_ms} ms")]
    ClockSkew {
        /// `now - ts` in milliseconds.
        skew_ms: i64,
        /// Accepted window in milliseconds.
        window_ms: i64,
    },

    /// Missing signature or cryptographic check failed.
    #[error("bad envelope signature")]
    BadSignature,

    /// `(agent, nonce)` was already accepted within the replay window.
    #[error("replayed nonce from {agent}")]
    ReplayedNonce {
        /// Sender.
        agent: AgentId,
    },

    /// The replay cache could not be consulted; the envelope is refused.
    #[error("replay cache unavailable: {0}")]
    Internal(String),
}

impl SignatureError {
    /// Short code for logs and error replies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownAgent { .. } => "UNKNOWN_AGENT",
            Self::ClockSkew { .. } => "CLOCK_SKEW",
            Self::BadSignature => "BAD_SIGNATURE",
            Self::ReplayedNonce { .. } => "REPLAYED_NONCE",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

/// Result type for envelope authentication.
pub type SignatureResult<T> = Result<T, SignatureError>;

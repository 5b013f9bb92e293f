//! Broker error types.

use embody_audit::AuditError;
use embody_config::ConfigError;
use embody_core::{AgentId, BodyId};
use embody_crypto::CryptoError;
use embody_discovery::DiscoveryError;
use embody_identity::IdentityError;
use embody_protocol::{MessageType, ProtocolError, SignatureError};
use embody_session::SessionError;
use thiserror::Error;

/// Errors returned while handling an envelope.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The envelope did not parse.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The envelope failed authentication.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// Registration was refused.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// A body could not be published or looked up.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// A session operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The audit log refused an entry.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Broker key could not be loaded.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Broker configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The sender may not do this.
    #[error("agent {agent} is not allowed to {action}")]
    Forbidden {
        /// Sender.
        agent: AgentId,
        /// What was attempted.
        action: String,
    },

    /// No body with this ID is indexed.
    #[error("unknown body: {0}")]
    UnknownBody(BodyId),

    /// A published body declares a tool nobody can execute.
    #[error("body {body_id} declares tool '{tool}' without a handler")]
    MissingHandler {
        /// Body being published.
        body_id: BodyId,
        /// Tool without a handler.
        tool: String,
    },

    /// The broker only sends this message type.
    #[error("unexpected {0} message")]
    Unexpected(MessageType),
}

impl BrokerError {
    /// Short code for error replies and log lines.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "MALFORMED",
            Self::Signature(e) => e.code(),
            Self::Identity(IdentityError::DuplicateAgent(_)) => "DUPLICATE_AGENT",
            Self::Identity(_) => "IDENTITY",
            Self::Discovery(_) => "INVALID_BODY",
            Self::Session(SessionError::AuditUnavailable(_)) | Self::Audit(_) => {
                "AUDIT_UNAVAILABLE"
            },
            Self::Session(e) if e.is_unauthenticated() => "SESSION_INVALID",
            Self::Session(_) => "SESSION",
            Self::Crypto(_) | Self::Config(_) => "INTERNAL",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::UnknownBody(_) => "BODY_NOT_FOUND",
            Self::MissingHandler { .. } => "MISSING_HANDLER",
            Self::Unexpected(_) => "UNEXPECTED_MESSAGE",
        }
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

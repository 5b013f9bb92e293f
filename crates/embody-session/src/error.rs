//! Session manager error types.

use embody_core::{AgentId, RequestId, SessionState};
use embody_policy::PermissionError;
use thiserror::Error;

/// Errors from session operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// No session for this token.
    #[error("unknown session")]
    UnknownSession,

    /// The session passed its expiry time.
    #[error("session expired")]
    SessionExpired,

    /// The session was revoked as a security action.
    #[error("session revoked")]
    SessionRevoked,

    /// The session was closed gracefully.
    #[error("session terminated")]
    SessionTerminated,

    /// The validator refused the action.
    #[error("{error}")]
    Permission {
        /// Validator outcome.
        error: PermissionError,
        /// Violation count after this action.
        violation_count: u32,
    },

    /// The audit log refused the entry, so the action is refused too.
    #[error("audit log unavailable: {0}")]
    AuditUnavailable(String),

    /// A request with this ID is already pending.
    #[error("request already pending: {0}")]
    DuplicateRequest(RequestId),

    /// The agent is neither guest nor host of the session.
    #[error("agent {0} is not a participant of this session")]
    NotParticipant(AgentId),

    /// Internal session error
    #[error("internal session error: {0}")]
    Internal(String),
}

impl SessionError {
    /// The error reported for an operation on a session already in `state`.
    #[must_use]
    pub fn for_ended(state: SessionState) -> Self {
        match state {
            SessionState::Expired => Self::SessionExpired,
            SessionState::Revoked => Self::SessionRevoked,
            _ => Self::SessionTerminated,
        }
    }

    /// True when the failure means the token no longer authenticates
    /// anything (unknown, expired, revoked, terminated or invalid state).
    #[must_use]
    pub fn is_unauthenticated(&self) -> bool {
        match self {
            Self::UnknownSession
            | Self::SessionExpired
            | Self::SessionRevoked
            | Self::SessionTerminated => true,
            Self::Permission { error, .. } => !error.is_violation(),
            _ => false,
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

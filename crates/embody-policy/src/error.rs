//! Policy and permission error types.

use embody_core::SessionState;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a single tool call was refused.
///
/// Every variant except [`PermissionError::SessionInvalid`] counts as a
/// violation against the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermissionError {
    /// The session is not active or its expiry time has passed.
    #[error("session is not usable (state: {state})")]
    SessionInvalid {
        /// State observed at validation time.
        state: SessionState,
    },

    /// No granted permission covers the tool.
    #[error("tool '{tool}' is not permitted in this session")]
    ToolNotPermitted {
        /// The requested tool.
        tool: String,
    },

    /// A path parameter is outside the allowed scope.
    #[error("path '{path}' denied: {reason}")]
    PathDenied {
        /// The canonical path that was checked.
        path: String,
        /// Which rule refused it.
        reason: String,
    },

    /// A command parameter is denied or not allow-listed.
    #[error("command '{command}' denied: {reason}")]
    CommandDenied {
        /// The command line as received.
        command: String,
        /// Which rule refused it.
        reason: String,
    },

    /// Projected usage would exceed a policy limit.
    #[error("resource limit exceeded: {resource} would reach {projected} (limit {limit})")]
    ResourceLimitExceeded {
        /// Resource name (`cpu_percent`, `memory_mb`, ...).
        resource: &'static str,
        /// Configured limit.
        limit: u64,
        /// Usage after applying the action's estimate.
        projected: u64,
    },
}

impl PermissionError {
    /// Machine-readable code, used as the audit `violationType`.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionInvalid { .. } => "session_invalid",
            Self::ToolNotPermitted { .. } => "tool_not_permitted",
            Self::PathDenied { .. } => "path_denied",
            Self::CommandDenied { .. } => "command_denied",
            Self::ResourceLimitExceeded { .. } => "resource_limit_exceeded",
        }
    }

    /// Whether this outcome increments the session's violation counter.
    #[must_use]
    pub fn is_violation(&self) -> bool {
        !matches!(self, Self::SessionInvalid { .. })
    }
}

/// Result type for permission checks.
pub type PermissionResult<T> = Result<T, PermissionError>;

/// Machine-readable reason attached to an `embodimentDenied` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    /// No body with the requested ID is indexed.
    BodyNotFound,
    /// The body already serves `maxConcurrentGuests` sessions.
    SessionLimitExceeded,
    /// The guest's trust level is below `trustLevelRequired`.
    InsufficientTrust,
    /// The owning host is unregistered or revoked.
    HostPolicyViolation,
}

impl DenialReason {
    /// Wire code, e.g. `BODY_NOT_FOUND`.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::BodyNotFound => "BODY_NOT_FOUND",
            Self::SessionLimitExceeded => "SESSION_LIMIT_EXCEEDED",
            Self::InsufficientTrust => "INSUFFICIENT_TRUST",
            Self::HostPolicyViolation => "HOST_POLICY_VIOLATION",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors raised when a policy itself is malformed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// A path pattern does not compile as a glob.
    #[error("invalid path glob '{pattern}': {reason}")]
    InvalidGlob {
        /// The offending pattern.
        pattern: String,
        /// Compiler message.
        reason: String,
    },

    /// A command pattern is empty.
    #[error("empty command pattern in {list}")]
    EmptyCommandPattern {
        /// `allowedCommands` or `deniedCommands`.
        list: &'static str,
    },
}

/// Result type for policy construction.
pub type PolicyResult<T> = Result<T, PolicyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denial_reason_wire_codes() {
        let json = serde_json::to_string(&DenialReason::SessionLimitExceeded).unwrap();
        assert_eq!(json, "\"SESSION_LIMIT_EXCEEDED\"");
        let back: DenialReason = serde_json::from_str("\"HOST_POLICY_VIOLATION\"").unwrap();
        assert_eq!(back, DenialReason::HostPolicyViolation);
        assert_eq!(DenialReason::BodyNotFound.to_string(), "BODY_NOT_FOUND");
    }

    #[test]
    fn test_session_invalid_is_not_a_violation() {
        let err = PermissionError::SessionInvalid {
            state: SessionState::Revoked,
        };
        assert!(!err.is_violation());
        assert_eq!(err.code(), "session_invalid");

        let err = PermissionError::ToolNotPermitted {
            tool: "net.fetch".into(),
        };
        assert!(err.is_violation());
    }
}

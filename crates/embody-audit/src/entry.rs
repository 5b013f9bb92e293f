//! Audit entry types and actions.
//!
//! Every security-relevant broker operation is recorded as an audit entry.
//! Entries form a single chain: each carries a sequence number and the hash
//! of its predecessor, and is signed by the service key.

use std::fmt;

use chrono::SecondsFormat;
use embody_core::{AgentId, AgentRole, BodyId, SessionState, Timestamp};
use embody_crypto::{ContentHash, KeyPair, PublicKey, Signature};
use embody_protocol::canonical_json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AuditError, AuditResult};

const SIGNING_VERSION: u8 = 0x01;
const HASH_DOMAIN: &str = "embody audit entry v1";

/// Unique identifier of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditEntryId(pub Uuid);

impl AuditEntryId {
    /// Generate a new random ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AuditEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AuditEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "audit:{}", self.0)
    }
}

/// A single audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Unique entry identifier.
    pub id: AuditEntryId,
    /// Position in the chain, starting at 0.
    pub sequence: u64,
    /// When this entry was created.
    pub timestamp: Timestamp,
    /// Truncated session token reference, when the action belongs to a session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_ref: Option<String>,
    /// Agent that caused the action.
    pub actor_id: AgentId,
    /// The action being audited.
    pub action: AuditAction,
    /// Sanitized parameters.
    #[serde(default)]
    pub parameters: Value,
    /// Outcome of the action.
    pub outcome: AuditOutcome,
    /// Violation category for denied tool calls and revocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation_type: Option<String>,
    /// Hash of the previous entry (chain linking).
    pub previous_hash: ContentHash,
    /// Service public key that signed this entry.
    pub service_key: PublicKey,
    /// Signature over entry contents.
    pub signature: Signature,
}

/// Fields of an entry before it is placed in the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    /// Truncated session reference.
    pub session_ref: Option<String>,
    /// Acting agent.
    pub actor_id: AgentId,
    /// What happened.
    pub action: AuditAction,
    /// Parameters (sanitized by the log before storing).
    pub parameters: Value,
    /// Result.
    pub outcome: AuditOutcome,
    /// Violation category, if any.
    pub violation_type: Option<String>,
}

impl AuditRecord {
    /// A record with no session, parameters or violation.
    #[must_use]
    pub fn new(actor_id: AgentId, action: AuditAction, outcome: AuditOutcome) -> Self {
        Self {
            session_ref: None,
            actor_id,
            action,
            parameters: Value::Null,
            outcome,
            violation_type: None,
        }
    }
}

impl AuditEntry {
    /// Create and sign an entry at the given chain position.
    #[must_use]
    pub fn create(
        record: AuditRecord,
        sequence: u64,
        previous_hash: ContentHash,
        service_key: &KeyPair,
    ) -> Self {
        let mut entry = Self {
            id: AuditEntryId::new(),
            sequence,
            timestamp: Timestamp::now(),
            session_ref: record.session_ref,
            actor_id: record.actor_id,
            action: record.action,
            parameters: record.parameters,
            outcome: record.outcome,
            violation_type: record.violation_type,
            previous_hash,
            service_key: service_key.export_public_key(),
            signature: Signature::from_bytes([0u8; 64]), // Placeholder
        };

        let signing_data = entry.signing_data();
        entry.signature = service_key.sign(&signing_data);
        entry
    }

    /// Get the data used for signing.
    #[must_use]
    pub fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);
        data.push(SIGNING_VERSION);
        data.extend_from_slice(self.id.0.as_bytes());
        data.extend_from_slice(&self.sequence.to_le_bytes());
        write_lp(
            &mut data,
            self.timestamp
                .0
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        match &self.session_ref {
            Some(session) => {
                data.push(1);
                write_lp(&mut data, session.as_bytes());
            },
            None => data.push(0),
        }
        write_lp(&mut data, self.actor_id.as_str().as_bytes());
        write_lp(&mut data, &json_bytes(&self.action));
        write_lp(&mut data, &canonical_json(&self.parameters));
        write_lp(&mut data, &json_bytes(&self.outcome));
        match &self.violation_type {
            Some(violation) => {
                data.push(1);
                write_lp(&mut data, violation.as_bytes());
            },
            None => data.push(0),
        }
        data.extend_from_slice(self.previous_hash.as_bytes());
        data.extend_from_slice(self.service_key.as_bytes());
        data
    }

    /// Compute the content hash of this entry.
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::hash_with_domain(HASH_DOMAIN, &self.signing_data())
    }

    /// Verify the entry's signature.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::InvalidSignature`] if the signature does not match
    /// the entry contents.
    pub fn verify_signature(&self) -> AuditResult<()> {
        self.service_key
            .verify(&self.signing_data(), &self.signature)
            .map_err(|_| AuditError::InvalidSignature {
                entry_id: self.id.to_string(),
            })
    }

    /// Check if this entry follows another (chain linking).
    #[must_use]
    pub fn follows(&self, previous: &AuditEntry) -> bool {
        self.previous_hash == previous.content_hash()
            && self.sequence == previous.sequence.saturating_add(1)
    }
}

fn write_lp(data: &mut Vec<u8>, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(bytes);
}

fn json_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_value(value)
        .map(|v| canonical_json(&v))
        .unwrap_or_default()
}

/// Actions that can be audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditAction {
    /// An agent registered with the broker.
    AgentRegistered {
        /// Registered role.
        role: AgentRole,
    },

    /// An agent was revoked.
    AgentRevoked {
        /// Revoked agent.
        agent_id: AgentId,
    },

    /// A host published or re-published a body.
    BodyPublished {
        /// Body identifier.
        body_id: BodyId,
        /// Version after indexing.
        version: u64,
    },

    /// A body was withdrawn from the index.
    BodyWithdrawn {
        /// Body identifier.
        body_id: BodyId,
    },

    /// An embodiment request was granted.
    EmbodimentGranted {
        /// Granted body.
        body_id: BodyId,
        /// Serving host.
        host_agent_id: AgentId,
        /// Expiry in Unix milliseconds.
        expires_at: i64,
    },

    /// An embodiment request was denied.
    EmbodimentDenied {
        /// Requested body.
        body_id: BodyId,
    },

    /// A tool call was validated.
    ToolCall {
        /// Tool name.
        tool: String,
    },

    /// A session reached a terminal state.
    SessionEnded {
        /// Terminal state.
        state: SessionState,
        /// Why it ended.
        reason: String,
    },
}

impl AuditAction {
    /// Short action type for indexing and log lines.
    #[must_use]
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::AgentRegistered { .. } => "agent_registered",
            Self::AgentRevoked { .. } => "agent_revoked",
            Self::BodyPublished { .. } => "body_published",
            Self::BodyWithdrawn { .. } => "body_withdrawn",
            Self::EmbodimentGranted { .. } => "embodiment_granted",
            Self::EmbodimentDenied { .. } => "embodiment_denied",
            Self::ToolCall { .. } => "tool_call",
            Self::SessionEnded { .. } => "session_ended",
        }
    }

    /// Get a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::AgentRegistered { role } => format!("Registered as {role}"),
            Self::AgentRevoked { agent_id } => format!("Revoked agent {agent_id}"),
            Self::BodyPublished { body_id, version } => {
                format!("Published body {body_id} v{version}")
            },
            Self::BodyWithdrawn { body_id } => format!("Withdrew body {body_id}"),
            Self::EmbodimentGranted {
                body_id,
                host_agent_id,
                ..
            } => format!("Granted {body_id} on {host_agent_id}"),
            Self::EmbodimentDenied { body_id } => format!("Denied {body_id}"),
            Self::ToolCall { tool } => format!("Called tool {tool}"),
            Self::SessionEnded { state, reason } => format!("Session {state}: {reason}"),
        }
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Action was allowed.
    Allowed {
        /// Optional details.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    /// Action was refused by policy.
    Denied {
        /// Machine-readable code.
        code: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Action failed for a non-policy reason.
    Failed {
        /// Error message.
        error: String,
    },
}

impl AuditOutcome {
    /// Create an allowed outcome.
    #[must_use]
    pub fn allowed() -> Self {
        Self::Allowed { details: None }
    }

    /// Create an allowed outcome with details.
    #[must_use]
    pub fn allowed_with(details: impl Into<String>) -> Self {
        Self::Allowed {
            details: Some(details.into()),
        }
    }

    /// Create a denied outcome.
    #[must_use]
    pub fn denied(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Denied {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// Create a failure outcome.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    /// True for [`AuditOutcome::Allowed`].
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

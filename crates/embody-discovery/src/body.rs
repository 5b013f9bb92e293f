//! Body and tool definitions published by hosts.

use std::collections::HashSet;

use embody_core::{AgentId, BodyId, TrustLevel};
use embody_policy::SecurityPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DiscoveryError, DiscoveryResult};

/// How a tool's permissions are derived from the body's policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Takes path parameters; paired with every allowed path.
    File,
    /// Takes a command line; paired with every allowed command.
    Command,
    /// Anything else; granted as `tool:*`.
    #[default]
    General,
}

/// A tool a body exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    /// Dotted tool name, e.g. `file.read`.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Permission derivation class.
    #[serde(default)]
    pub kind: ToolKind,
    /// JSON schema of the parameters. Opaque to the core.
    #[serde(default)]
    pub parameters: Value,
}

impl ToolSpec {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind,
            parameters: Value::Null,
        }
    }
}

/// A sandboxed capability set offered by one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyDefinition {
    /// Unique body identifier.
    pub body_id: BodyId,
    /// Owning host.
    pub host_agent_id: AgentId,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Free-form environment tag, e.g. `linux-container`.
    pub environment_type: String,
    /// Tools exposed by the body.
    pub tools: Vec<ToolSpec>,
    /// Boundary applied to every session on this body.
    #[serde(default)]
    pub security_policy: SecurityPolicy,
    /// Concurrent active sessions allowed.
    pub max_concurrent_guests: u32,
    /// Session length in seconds when the guest does not ask for one.
    pub default_session_duration: u64,
    /// Upper bound on requested session length in seconds.
    pub max_session_duration: u64,
    /// Minimum guest trust.
    #[serde(default)]
    pub trust_level_required: TrustLevel,
    /// Bumped by the index on every re-publication.
    #[serde(default)]
    pub version: u64,
}

impl BodyDefinition {
    /// Reject definitions that could never produce a usable session.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidBody`] describing the first problem.
    pub fn validate(&self) -> DiscoveryResult<()> {
        let invalid = |reason: String| DiscoveryError::InvalidBody {
            body_id: self.body_id.clone(),
            reason,
        };

        if self.body_id.as_str().is_empty() {
            return Err(invalid("empty body id".into()));
        }
        if self.tools.is_empty() {
            return Err(invalid("body exposes no tools".into()));
        }
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if tool.name.is_empty() || tool.name.contains(':') || tool.name.contains('*') {
                return Err(invalid(format!("invalid tool name '{}'", tool.name)));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(invalid(format!("duplicate tool '{}'", tool.name)));
            }
        }
        if self.max_concurrent_guests == 0 {
            return Err(invalid("maxConcurrentGuests must be at least 1".into()));
        }
        if self.max_session_duration == 0 {
            return Err(invalid("maxSessionDuration must be at least 1".into()));
        }
        if self.default_session_duration > self.max_session_duration {
            return Err(invalid(
                "defaultSessionDuration exceeds maxSessionDuration".into(),
            ));
        }
        self.security_policy
            .validate()
            .map_err(|e| invalid(e.to_string()))
    }

    /// Names of all tools, in declaration order.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }
}

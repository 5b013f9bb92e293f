//! The ten message bodies of the embodiment protocol.

use std::fmt;
use std::str::FromStr;

use embody_core::{AgentId, AgentRole, BodyId, RequestId, SessionToken};
use embody_crypto::PublicKey;
use embody_discovery::{BodyDefinition, DiscoveredBody, DiscoveryQuery};
use embody_policy::{DenialReason, Permission, ResourceUsage, SecurityPolicy};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};

/// Wire value of the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Host or guest announces its key (hosts also publish bodies).
    RegisterAgent,
    /// A broker announces itself to a peer.
    RegisterBroker,
    /// Guest asks for bodies by capability.
    DiscoverBodies,
    /// Ranked discovery reply.
    BodiesDiscovered,
    /// Guest asks for a session on a body.
    RequestEmbodiment,
    /// Session granted, carries the token.
    EmbodimentGranted,
    /// Session refused, carries a reason code.
    EmbodimentDenied,
    /// Guest invokes a tool under a session.
    ToolCall,
    /// Outcome of a tool call.
    ToolResult,
    /// Lifecycle change of a request or session.
    EmbodimentUpdate,
}

impl MessageType {
    /// Every message type.
    pub const ALL: [Self; 10] = [
        Self::RegisterAgent,
        Self::RegisterBroker,
        Self::DiscoverBodies,
        Self::BodiesDiscovered,
        Self::RequestEmbodiment,
        Self::EmbodimentGranted,
        Self::EmbodimentDenied,
        Self::ToolCall,
        Self::ToolResult,
        Self::EmbodimentUpdate,
    ];

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegisterAgent => "registerAgent",
            Self::RegisterBroker => "registerBroker",
            Self::DiscoverBodies => "discoverBodies",
            Self::BodiesDiscovered => "bodiesDiscovered",
            Self::RequestEmbodiment => "requestEmbodiment",
            Self::EmbodimentGranted => "embodimentGranted",
            Self::EmbodimentDenied => "embodimentDenied",
            Self::ToolCall => "toolCall",
            Self::ToolResult => "toolResult",
            Self::EmbodimentUpdate => "embodimentUpdate",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownMessageType(s.to_string()))
    }
}

/// `registerAgent` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgent {
    /// Key that will sign every later envelope from this agent.
    pub public_key: PublicKey,
    /// Role claimed by the agent.
    pub role: AgentRole,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Where the agent can be reached (hosts: MCP base URL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Bodies a host publishes with its registration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bodies: Vec<BodyDefinition>,
}

/// `registerBroker` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBroker {
    /// Identifier of the announcing broker.
    pub broker_id: AgentId,
    /// Broker signing key.
    pub public_key: PublicKey,
    /// Broker endpoint URL.
    pub endpoint: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// `discoverBodies` body.
pub type DiscoverBodies = DiscoveryQuery;

/// `bodiesDiscovered` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodiesDiscovered {
    /// Ranked hits, best first.
    pub bodies: Vec<DiscoveredBody>,
}

/// `requestEmbodiment` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEmbodiment {
    /// Correlates the request with its grant/denial/update.
    pub request_id: RequestId,
    /// Wanted body.
    pub body_id: BodyId,
    /// Wanted duration in seconds; the body default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    /// Free-text purpose for the audit trail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

/// `embodimentGranted` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbodimentGranted {
    /// Request being answered.
    pub request_id: RequestId,
    /// Bearer credential for tool calls. Only ever sent to the guest.
    pub session_token: SessionToken,
    /// Granted body.
    pub body_id: BodyId,
    /// Host serving the body.
    pub host_agent_id: AgentId,
    /// Permissions frozen at grant time.
    pub permissions: Vec<Permission>,
    /// Policy snapshot the session runs under.
    pub security_policy: SecurityPolicy,
    /// Expiry in Unix milliseconds.
    pub expires_at: i64,
    /// Session-scoped tool endpoint path.
    pub mcp_endpoint: String,
}

/// `embodimentDenied` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbodimentDenied {
    /// Request being answered.
    pub request_id: RequestId,
    /// Requested body.
    pub body_id: BodyId,
    /// Machine-readable reason.
    pub reason: DenialReason,
    /// Human-readable detail.
    pub message: String,
    /// Other bodies offering the same tools.
    #[serde(default)]
    pub alternatives: Vec<DiscoveredBody>,
}

/// `toolCall` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Session credential.
    pub session_token: SessionToken,
    /// Caller-chosen correlation ID.
    pub call_id: String,
    /// Tool name.
    pub tool: String,
    /// Tool parameters.
    #[serde(default)]
    pub parameters: Value,
    /// Estimated resource cost of the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_usage: Option<ResourceUsage>,
}

/// Result of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ToolOutcome {
    /// The tool ran.
    Ok {
        /// Opaque tool output.
        result: Value,
    },
    /// The validator refused the call.
    Denied {
        /// Permission error code (`path_denied`, ...).
        code: String,
        /// Human-readable detail.
        message: String,
        /// Session violation count after this call.
        violation_count: u32,
    },
    /// The tool backend failed.
    Error {
        /// Backend error message.
        message: String,
    },
}

/// `toolResult` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// Session credential echoed back.
    pub session_token: SessionToken,
    /// Correlation ID from the call.
    pub call_id: String,
    /// What happened.
    pub outcome: ToolOutcome,
}

/// Lifecycle event carried by `embodimentUpdate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UpdateEvent {
    /// Graceful close (guest exit or host/broker shutdown).
    Terminate {
        /// Why the session ended.
        reason: String,
    },
    /// Security close.
    Revoke {
        /// Violation that triggered the revocation.
        violation_type: String,
        /// Human-readable detail.
        reason: String,
    },
    /// Session reached its expiry time.
    Expired,
    /// Guest abandons a pending request.
    Abandon,
    /// A body was withdrawn by its host.
    BodyWithdrawn {
        /// Withdrawn body.
        body_id: BodyId,
    },
    /// Informational notice.
    Notice {
        /// Message text.
        message: String,
    },
}

/// `embodimentUpdate` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbodimentUpdate {
    /// Affected session, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<SessionToken>,
    /// Affected request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// What happened.
    pub event: UpdateEvent,
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `registerAgent`
    RegisterAgent(RegisterAgent),
    /// `registerBroker`
    RegisterBroker(RegisterBroker),
    /// `discoverBodies`
    DiscoverBodies(DiscoverBodies),
    /// `bodiesDiscovered`
    BodiesDiscovered(BodiesDiscovered),
    /// `requestEmbodiment`
    RequestEmbodiment(RequestEmbodiment),
    /// `embodimentGranted`
    EmbodimentGranted(EmbodimentGranted),
    /// `embodimentDenied`
    EmbodimentDenied(EmbodimentDenied),
    /// `toolCall`
    ToolCall(ToolCall),
    /// `toolResult`
    ToolResult(ToolResult),
    /// `embodimentUpdate`
    EmbodimentUpdate(EmbodimentUpdate),
}

impl Message {
    /// The wire type of this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::RegisterAgent(_) => MessageType::RegisterAgent,
            Self::RegisterBroker(_) => MessageType::RegisterBroker,
            Self::DiscoverBodies(_) => MessageType::DiscoverBodies,
            Self::BodiesDiscovered(_) => MessageType::BodiesDiscovered,
            Self::RequestEmbodiment(_) => MessageType::RequestEmbodiment,
            Self::EmbodimentGranted(_) => MessageType::EmbodimentGranted,
            Self::EmbodimentDenied(_) => MessageType::EmbodimentDenied,
            Self::ToolCall(_) => MessageType::ToolCall,
            Self::ToolResult(_) => MessageType::ToolResult,
            Self::EmbodimentUpdate(_) => MessageType::EmbodimentUpdate,
        }
    }

    /// Encode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if encoding fails.
    pub fn to_body(&self) -> ProtocolResult<Value> {
        let encoded = match self {
            Self::RegisterAgent(b) => serde_json::to_value(b),
            Self::RegisterBroker(b) => serde_json::to_value(b),
            Self::DiscoverBodies(b) => serde_json::to_value(b),
            Self::BodiesDiscovered(b) => serde_json::to_value(b),
            Self::RequestEmbodiment(b) => serde_json::to_value(b),
            Self::EmbodimentGranted(b) => serde_json::to_value(b),
            Self::EmbodimentDenied(b) => serde_json::to_value(b),
            Self::ToolCall(b) => serde_json::to_value(b),
            Self::ToolResult(b) => serde_json::to_value(b),
            Self::EmbodimentUpdate(b) => serde_json::to_value(b),
        };
        encoded.map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode a body of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidBody`] if the JSON does not fit the schema.
    pub fn from_body(message_type: MessageType, body: &Value) -> ProtocolResult<Self> {
        Ok(match message_type {
            MessageType::RegisterAgent => Self::RegisterAgent(decode(message_type, body)?),
            MessageType::RegisterBroker => Self::RegisterBroker(decode(message_type, body)?),
            MessageType::DiscoverBodies => Self::DiscoverBodies(decode(message_type, body)?),
            MessageType::BodiesDiscovered => Self::BodiesDiscovered(decode(message_type, body)?),
            MessageType::RequestEmbodiment => {
                Self::RequestEmbodiment(decode(message_type, body)?)
            },
            MessageType::EmbodimentGranted => {
                Self::EmbodimentGranted(decode(message_type, body)?)
            },
            MessageType::EmbodimentDenied => Self::EmbodimentDenied(decode(message_type, body)?),
            MessageType::ToolCall => Self::ToolCall(decode(message_type, body)?),
            MessageType::ToolResult => Self::ToolResult(decode(message_type, body)?),
            MessageType::EmbodimentUpdate => Self::EmbodimentUpdate(decode(message_type, body)?),
        })
    }
}

fn decode<T: DeserializeOwned>(message_type: MessageType, body: &Value) -> ProtocolResult<T> {
    T::deserialize(body).map_err(|e| ProtocolError::InvalidBody {
        message_type,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use embody_crypto::KeyPair;
    use serde_json::json;

    #[test]
    fn test_message_type_names() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
            assert_eq!(serde_json::to_value(t).unwrap(), json!(t.as_str()));
        }
        assert!(matches!(
            "launchMissiles".parse::<MessageType>(),
            Err(ProtocolError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn test_tool_outcome_shape() {
        let outcome = ToolOutcome::Denied {
            code: "command_denied".into(),
            message: "nope".into(),
            violation_count: 1,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "denied");
        assert_eq!(json["violationCount"], 1);
    }

    #[test]
    fn test_update_event_shape() {
        let update = EmbodimentUpdate {
            session_token: None,
            request_id: Some(RequestId::new("r1")),
            event: UpdateEvent::Revoke {
                violation_type: "path_denied".into(),
                reason: "threshold".into(),
            },
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["event"]["kind"], "revoke");
        assert_eq!(json["event"]["violationType"], "path_denied");
        assert!(json.get("sessionToken").is_none());
    }

    #[test]
    fn test_body_schema_mismatch() {
        let err = Message::from_body(MessageType::RequestEmbodiment, &json!({"bodyId": 7}))
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidBody {
                message_type: MessageType::RequestEmbodiment,
                ..
            }
        ));
    }

    #[test]
    fn test_register_agent_roundtrip() {
        let msg = Message::RegisterAgent(RegisterAgent {
            public_key: KeyPair::generate().export_public_key(),
            role: AgentRole::Guest,
            display_name: Some("curious guest".into()),
            endpoint: None,
            bodies: Vec::new(),
        });
        let body = msg.to_body().unwrap();
        assert!(body["publicKey"].is_string());
        let back = Message::from_body(MessageType::RegisterAgent, &body).unwrap();
        assert_eq!(back, msg);
    }
}

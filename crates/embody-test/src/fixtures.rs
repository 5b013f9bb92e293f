//! Fixtures for agents, bodies and a ready-to-use broker.

use std::sync::Arc;

use embody_audit::AuditLog;
use embody_broker::{BrokerSettings, EmbodimentService};
use embody_core::{AgentId, AgentRole, BodyId, RequestId, SessionToken, TrustLevel};
use embody_crypto::KeyPair;
use embody_discovery::{BodyDefinition, DiscoveryQuery, ToolKind, ToolSpec};
use embody_policy::{ResourceUsage, SecurityPolicy};
use embody_protocol::{
    EmbodimentUpdate, Envelope, Message, RegisterAgent, RequestEmbodiment, ToolCall, UpdateEvent,
};
use serde_json::Value;

/// Broker ID used by [`test_broker`].
pub const TEST_BROKER_ID: &str = "broker-test";

/// Install a test subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("embody_broker=debug,embody_session=debug")
        .try_init();
}

/// A broker with default settings and an in-memory audit log.
///
/// # Panics
///
/// Panics if the broker cannot register its own identity.
#[must_use]
pub fn test_broker() -> EmbodimentService {
    test_broker_with(BrokerSettings::default())
}

/// A broker with custom settings and an in-memory audit log.
///
/// # Panics
///
/// Panics if the broker cannot register its own identity.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_broker_with(settings: BrokerSettings) -> EmbodimentService {
    EmbodimentService::new(
        AgentId::new(TEST_BROKER_ID),
        KeyPair::generate(),
        Arc::new(AuditLog::in_memory(KeyPair::generate())),
        settings,
    )
    .expect("test broker")
}

/// An agent with its own signing key.
pub struct TestAgent {
    /// Agent ID.
    pub id: AgentId,
    /// Signing key.
    pub key: KeyPair,
}

impl std::fmt::Debug for TestAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestAgent").field("id", &self.id).finish_non_exhaustive()
    }
}

impl TestAgent {
    /// New agent with a fresh key.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: AgentId::new(id),
            key: KeyPair::generate(),
        }
    }

    /// Seal a message as this agent.
    ///
    /// # Panics
    ///
    /// Panics if the body cannot be encoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn seal(&self, message: &Message) -> Envelope {
        Envelope::seal(message, self.id.clone(), &self.key).expect("seal")
    }

    /// Seal and encode for the wire.
    ///
    /// # Panics
    ///
    /// Panics if the envelope cannot be encoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn wire(&self, message: &Message) -> Vec<u8> {
        self.seal(message).to_vec().expect("encode")
    }

    /// Register directly in the broker's registry with a chosen trust level.
    ///
    /// # Panics
    ///
    /// Panics if the agent is already registered with another key.
    #[allow(clippy::expect_used)]
    pub fn enroll(&self, broker: &EmbodimentService, role: AgentRole, trust: TrustLevel) {
        broker
            .identities()
            .register(self.id.clone(), self.key.export_public_key(), trust, role)
            .expect("enroll");
    }

    /// `registerAgent` announcing `bodies`.
    #[must_use]
    pub fn registration(&self, role: AgentRole, bodies: Vec<BodyDefinition>) -> Message {
        Message::RegisterAgent(RegisterAgent {
            public_key: self.key.export_public_key(),
            role,
            display_name: Some(self.id.to_string()),
            endpoint: None,
            bodies,
        })
    }

    /// `discoverBodies` for the given capability patterns.
    #[must_use]
    pub fn discovery(&self, patterns: &[&str]) -> Message {
        Message::DiscoverBodies(DiscoveryQuery::for_capabilities(patterns.iter().copied()))
    }

    /// `requestEmbodiment` with a fresh request ID.
    #[must_use]
    pub fn request(&self, body_id: &str, duration_secs: Option<u64>) -> Message {
        Message::RequestEmbodiment(RequestEmbodiment {
            request_id: RequestId::generate(),
            body_id: BodyId::new(body_id),
            duration_secs,
            purpose: Some("test".into()),
        })
    }

    /// `toolCall` under a session.
    #[must_use]
    pub fn tool_call(&self, token: &SessionToken, tool: &str, parameters: Value) -> Message {
        Message::ToolCall(ToolCall {
            session_token: token.clone(),
            call_id: RequestId::generate().to_string(),
            tool: tool.to_string(),
            parameters,
            estimated_usage: None::<ResourceUsage>,
        })
    }

    /// `embodimentUpdate` closing a session.
    #[must_use]
    pub fn terminate(&self, token: &SessionToken, reason: &str) -> Message {
        Message::EmbodimentUpdate(EmbodimentUpdate {
            session_token: Some(token.clone()),
            request_id: None,
            event: UpdateEvent::Terminate {
                reason: reason.to_string(),
            },
        })
    }
}

/// A policy for a development sandbox: `/workspace` is open except for
/// `.git` internals, `git`, `ls`, `cat` and `cargo` may run, `sudo` never.
#[must_use]
pub fn dev_policy() -> SecurityPolicy {
    SecurityPolicy {
        allowed_paths: vec!["/workspace/**".into()],
        denied_paths: vec!["/workspace/.git/**".into(), "**/.env".into()],
        allowed_commands: vec!["git".into(), "ls".into(), "cat".into(), "cargo".into()],
        denied_commands: vec!["sudo".into(), "rm -rf".into()],
        ..SecurityPolicy::default()
    }
}

/// A body exposing `file.read`, `file.write` and `shell.exec` under
/// [`dev_policy`].
#[must_use]
pub fn dev_box(body_id: &str, host: &AgentId) -> BodyDefinition {
    body_with_tools(
        body_id,
        host,
        vec![
            ToolSpec::new("file.read", ToolKind::File),
            ToolSpec::new("file.write", ToolKind::File),
            ToolSpec::new("shell.exec", ToolKind::Command),
        ],
    )
}

/// A body with the given tools under [`dev_policy`], two guest slots and
/// a ten minute default session.
#[must_use]
pub fn body_with_tools(body_id: &str, host: &AgentId, tools: Vec<ToolSpec>) -> BodyDefinition {
    BodyDefinition {
        body_id: BodyId::new(body_id),
        host_agent_id: host.clone(),
        description: format!("{body_id} test body"),
        environment_type: "linux-container".into(),
        tools,
        security_policy: dev_policy(),
        max_concurrent_guests: 2,
        default_session_duration: 600,
        max_session_duration: 3600,
        trust_level_required: TrustLevel::Untrusted,
        version: 0,
    }
}

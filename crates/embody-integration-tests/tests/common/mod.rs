//! Shared harness: a broker with one host, one guest and one published body.

use std::sync::Arc;

use embody_broker::{BrokerResult, BrokerSettings, EmbodimentService};
use embody_core::{AgentRole, SessionToken, Timestamp, TrustLevel};
use embody_discovery::BodyDefinition;
use embody_protocol::{EmbodimentGranted, Message, ToolOutcome};
use embody_test::{MockToolBackend, TestAgent, dev_box, init_test_logging, test_broker_with};
use serde_json::Value;

/// Body published by the harness host.
#[allow(dead_code)]
pub const BODY_ID: &str = "dev-box";

/// A running federation in miniature.
#[allow(dead_code)]
pub struct Federation {
    /// The broker under test.
    pub broker: Arc<EmbodimentService>,
    /// Host that published [`BODY_ID`].
    pub host: TestAgent,
    /// Registered guest.
    pub guest: TestAgent,
    /// Tool backend bound to every tool of the body.
    pub backend: MockToolBackend,
    /// The published body.
    pub body: BodyDefinition,
}

#[allow(dead_code)]
impl Federation {
    /// Harness with default broker settings.
    pub async fn new() -> Self {
        Self::with_settings(BrokerSettings::default(), MockToolBackend::new()).await
    }

    /// Harness with a custom tool backend.
    pub async fn with_backend(backend: MockToolBackend) -> Self {
        Self::with_settings(BrokerSettings::default(), backend).await
    }

    /// Harness with custom settings and backend. Host and guest register
    /// through signed envelopes like any remote agent would.
    pub async fn with_settings(settings: BrokerSettings, backend: MockToolBackend) -> Self {
        init_test_logging();
        let broker = Arc::new(test_broker_with(settings));
        let host = TestAgent::new("host-1");
        let guest = TestAgent::new("guest-1");
        let body = dev_box(BODY_ID, &host.id);
        backend.install(broker.tools(), &body);

        let federation = Self {
            broker,
            host,
            guest,
            backend,
            body,
        };
        federation
            .send(
                &federation.host,
                &federation
                    .host
                    .registration(AgentRole::Host, vec![federation.body.clone()]),
            )
            .await
            .expect("host registers");
        federation
            .send(
                &federation.guest,
                &federation.guest.registration(AgentRole::Guest, Vec::new()),
            )
            .await
            .expect("guest registers");
        federation
    }

    /// Send a message as `agent` and decode the broker's reply, checking
    /// that the reply is signed by the broker.
    pub async fn send(&self, agent: &TestAgent, message: &Message) -> BrokerResult<Message> {
        let bytes = agent.wire(message);
        let reply = self.broker.handle_bytes(&bytes, Timestamp::now()).await?;
        reply
            .verify_signature(&self.broker.public_key())
            .expect("reply signed by the broker");
        assert_eq!(reply.agent, *self.broker.broker_id());
        Ok(reply.message().expect("reply decodes"))
    }

    /// Ask for the harness body as the harness guest; panic unless granted.
    pub async fn grant(&self) -> EmbodimentGranted {
        self.grant_for(&self.guest).await
    }

    /// Ask for the harness body as `guest`; panic unless granted.
    pub async fn grant_for(&self, guest: &TestAgent) -> EmbodimentGranted {
        match self
            .send(guest, &guest.request(BODY_ID, None))
            .await
            .expect("request handled")
        {
            Message::EmbodimentGranted(granted) => granted,
            other => panic!("expected a grant, got {other:?}"),
        }
    }

    /// Call a tool as the harness guest and return the outcome.
    pub async fn call(&self, token: &SessionToken, tool: &str, parameters: Value) -> BrokerResult<ToolOutcome> {
        match self
            .send(&self.guest, &self.guest.tool_call(token, tool, parameters))
            .await?
        {
            Message::ToolResult(result) => Ok(result.outcome),
            other => panic!("expected a tool result, got {other:?}"),
        }
    }

    /// Register a second host publishing a copy of the dev box under
    /// `body_id`, bound to the shared backend.
    pub async fn add_host(&self, host_id: &str, body_id: &str, required: TrustLevel) -> TestAgent {
        let host = TestAgent::new(host_id);
        let mut body = dev_box(body_id, &host.id);
        body.trust_level_required = required;
        self.backend.install(self.broker.tools(), &body);
        self.send(&host, &host.registration(AgentRole::Host, vec![body]))
            .await
            .expect("second host registers");
        host
    }

    /// Register another guest directly.
    pub fn extra_guest(&self, id: &str) -> TestAgent {
        let agent = TestAgent::new(id);
        agent.enroll(&self.broker, AgentRole::Guest, TrustLevel::Untrusted);
        agent
    }
}

/// Assert a denied outcome with the given code and return its violation count.
#[allow(dead_code)]
pub fn expect_denied(outcome: &ToolOutcome, code: &str) -> u32 {
    match outcome {
        ToolOutcome::Denied {
            code: got,
            violation_count,
            ..
        } => {
            assert_eq!(got, code, "unexpected denial code");
            *violation_count
        },
        other => panic!("expected denial {code}, got {other:?}"),
    }
}

//! The broker service: authenticate an envelope, dispatch it by message
//! type and seal the reply.

use std::sync::Arc;

use embody_audit::{AuditAction, AuditLog, Sanitizer};
use embody_config::{AuditBackend, Config, ConfigError};
use embody_core::{AgentId, AgentRole, BodyId, SessionState, SessionToken, Timestamp, TrustLevel};
use embody_crypto::{KeyPair, PublicKey};
use embody_discovery::{CapabilityIndex, DiscoveryQuery};
use embody_identity::{AgentIdentity, IdentityRegistry};
use embody_policy::{ResourceUsage, ToolAction};
use embody_protocol::{
    BodiesDiscovered, DEFAULT_CLOCK_SKEW_MS, DEFAULT_REPLAY_CAPACITY, EmbodimentUpdate, Envelope,
    EnvelopeVerifier, KeyResolver, MAX_ENVELOPE_BYTES, Message, MessageType, ProtocolError,
    RegisterAgent, RegisterBroker, ReplayGuard, RequestEmbodiment, SignatureError, ToolCall,
    ToolOutcome, ToolResult, UpdateEvent,
};
use embody_session::{GrantDecision, SessionConfig, SessionError, SessionInfo, SessionManager, SessionSweeper};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::notify::{Notification, Notifier};
use crate::tools::ToolRegistry;

/// Default nonce retention: twice the default skew window.
pub const DEFAULT_REPLAY_WINDOW_MS: i64 = 600_000;

/// Tunables of the broker service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Accepted distance between envelope and receipt time.
    pub clock_skew_ms: i64,
    /// How long nonces are remembered.
    pub replay_window_ms: i64,
    /// Nonces remembered before the oldest are evicted.
    pub replay_capacity: usize,
    /// Largest accepted encoded envelope.
    pub max_envelope_bytes: usize,
    /// Discovery results when a query names no limit.
    pub default_results: usize,
    /// Upper bound on discovery results.
    pub max_results: usize,
    /// Trust assigned to agents that register themselves.
    pub registration_trust: TrustLevel,
    /// Session manager tuning.
    pub sessions: SessionConfig,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            clock_skew_ms: DEFAULT_CLOCK_SKEW_MS,
            replay_window_ms: DEFAULT_REPLAY_WINDOW_MS,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            max_envelope_bytes: MAX_ENVELOPE_BYTES,
            default_results: embody_discovery::DEFAULT_MAX_RESULTS,
            max_results: 50,
            registration_trust: TrustLevel::Untrusted,
            sessions: SessionConfig::default(),
        }
    }
}

impl BrokerSettings {
    /// Settings taken from a loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let millis = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        let s = &config.sessions;
        Self {
            clock_skew_ms: millis(config.protocol.clock_skew_ms),
            replay_window_ms: millis(config.protocol.replay_window_ms),
            replay_capacity: config.protocol.replay_capacity,
            max_envelope_bytes: config.protocol.max_envelope_bytes,
            default_results: config.discovery.default_results,
            max_results: config.discovery.max_results,
            registration_trust: TrustLevel::Untrusted,
            sessions: SessionConfig {
                violation_threshold: s.violation_threshold,
                sweep_interval: s.sweep_interval(),
                pending_ttl: std::time::Duration::from_secs(s.pending_ttl_secs),
                retention: std::time::Duration::from_secs(s.retention_secs),
                max_alternatives: s.max_alternatives,
            },
        }
    }
}

/// Brokers embodiment between hosts and guests.
///
/// Every inbound envelope is authenticated before its body is acted on. The
/// one exception to key lookup is a first registration, which must be
/// signed by the key it registers.
pub struct EmbodimentService {
    broker_id: AgentId,
    key: KeyPair,
    settings: BrokerSettings,
    identities: Arc<IdentityRegistry>,
    index: Arc<CapabilityIndex>,
    audit: Arc<AuditLog>,
    sessions: Arc<SessionManager>,
    tools: Arc<ToolRegistry>,
    replay: Arc<ReplayGuard>,
    verifier: EnvelopeVerifier,
    notifier: Notifier,
}

impl std::fmt::Debug for EmbodimentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbodimentService")
            .field("broker_id", &self.broker_id)
            .field("key", &self.key.key_id_hex())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl EmbodimentService {
    /// Create a service with fresh registries. The broker registers itself
    /// as a trusted identity so its own envelopes verify.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Identity`] if the self-registration fails.
    pub fn new(
        broker_id: AgentId,
        key: KeyPair,
        audit: Arc<AuditLog>,
        settings: BrokerSettings,
    ) -> BrokerResult<Self> {
        let identities = Arc::new(IdentityRegistry::new());
        identities.register_identity(AgentIdentity::new(
            broker_id.clone(),
            key.export_public_key(),
            TrustLevel::Trusted,
            AgentRole::Broker,
        ))?;

        let index = Arc::new(CapabilityIndex::with_limits(
            settings.default_results,
            settings.max_results,
        ));
        let replay = Arc::new(ReplayGuard::with_capacity(
            settings.replay_window_ms,
            settings.replay_capacity,
        ));
        let resolver: Arc<dyn KeyResolver> = Arc::clone(&identities) as Arc<dyn KeyResolver>;
        let verifier = EnvelopeVerifier::with_window(resolver, settings.clock_skew_ms)
            .with_replay_guard(Arc::clone(&replay));
        let sessions = Arc::new(
            SessionManager::new(
                Arc::clone(&identities),
                Arc::clone(&index),
                Arc::clone(&audit),
                broker_id.clone(),
            )
            .with_config(settings.sessions.clone()),
        );

        info!(broker = %broker_id, key = %key.key_id_hex(), "Embodiment service ready");

        Ok(Self {
            broker_id,
            key,
            settings,
            identities,
            index,
            audit,
            sessions,
            tools: Arc::new(ToolRegistry::new()),
            replay,
            verifier,
            notifier: Notifier::default(),
        })
    }

    /// Build a service from configuration: load or generate the key, open
    /// the configured audit backend and apply the tunables.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or the audit file cannot be opened.
    pub fn from_config(config: &Config) -> BrokerResult<Self> {
        let key = match &config.service.key_path {
            Some(path) => KeyPair::load_or_generate(path)?,
            None => KeyPair::generate(),
        };
        let audit_key = KeyPair::from_secret_key(key.secret_key_bytes().as_slice())?;
        let audit = match (config.audit.backend, &config.audit.path) {
            (AuditBackend::Memory, _) => AuditLog::in_memory(audit_key),
            (AuditBackend::Jsonl, Some(path)) => AuditLog::open(path, audit_key)?,
            (AuditBackend::Jsonl, None) => {
                return Err(ConfigError::ValidationError {
                    field: "audit.path".into(),
                    message: "required when backend is \"jsonl\"".into(),
                }
                .into());
            },
        }
        .with_sanitizer(Sanitizer::new(config.audit.preview_len));

        Self::new(
            AgentId::new(config.service.agent_id.clone()),
            key,
            Arc::new(audit),
            BrokerSettings::from_config(config),
        )
    }

    /// Use a shared tool registry.
    #[must_use]
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    /// Replace the notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// This broker's agent ID.
    #[must_use]
    pub fn broker_id(&self) -> &AgentId {
        &self.broker_id
    }

    /// Key that signs every reply.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.key.export_public_key()
    }

    /// Active tunables.
    #[must_use]
    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Identity registry.
    #[must_use]
    pub fn identities(&self) -> &Arc<IdentityRegistry> {
        &self.identities
    }

    /// Capability index.
    #[must_use]
    pub fn index(&self) -> &Arc<CapabilityIndex> {
        &self.index
    }

    /// Session manager.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Audit log.
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Tool dispatch table.
    #[must_use]
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Receive lifecycle notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Notification>> {
        self.notifier.subscribe()
    }

    /// Start the background expiry sweep. Must be called inside a tokio
    /// runtime.
    #[must_use]
    pub fn start_sweeper(&self) -> SessionSweeper {
        SessionSweeper::spawn(
            Arc::clone(&self.sessions),
            self.sessions.config().sweep_interval,
        )
    }

    /// A signed `registerBroker` announcement for peers.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Protocol`] if the envelope cannot be encoded.
    pub fn announcement(
        &self,
        endpoint: impl Into<String>,
        display_name: Option<String>,
        now: Timestamp,
    ) -> BrokerResult<Envelope> {
        self.seal(
            &Message::RegisterBroker(RegisterBroker {
                broker_id: self.broker_id.clone(),
                public_key: self.public_key(),
                endpoint: endpoint.into(),
                display_name,
            }),
            now,
        )
    }

    // ---- Inbound --------------------------------------------------------

    /// Parse, authenticate and handle a wire envelope.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Protocol`] for anything that does not parse,
    /// and otherwise the errors of [`EmbodimentService::handle`].
    pub async fn handle_bytes(&self, bytes: &[u8], now: Timestamp) -> BrokerResult<Envelope> {
        if bytes.len() > self.settings.max_envelope_bytes {
            return Err(ProtocolError::TooLarge {
                size: bytes.len(),
                max: self.settings.max_envelope_bytes,
            }
            .into());
        }
        let envelope = Envelope::from_slice(bytes)?;
        self.handle(&envelope, now).await
    }

    /// Authenticate and handle an envelope. Returns the signed reply.
    ///
    /// # Errors
    ///
    /// Authentication failures are [`BrokerError::Signature`] and are
    /// never retried. Other errors describe why the request was refused.
    pub async fn handle(&self, envelope: &Envelope, now: Timestamp) -> BrokerResult<Envelope> {
        let message = envelope.message()?;
        self.authenticate(envelope, &message, now)?;

        let sender = &envelope.agent;
        debug!(agent = %sender, message_type = %envelope.message_type, "Dispatching envelope");

        let reply = match message {
            Message::RegisterAgent(registration) => self.register_agent(sender, registration)?,
            Message::RegisterBroker(announcement) => self.register_broker(sender, announcement)?,
            Message::DiscoverBodies(query) => self.discover(sender, &query)?,
            Message::RequestEmbodiment(request) => {
                self.request_embodiment(sender, &request, now)?
            },
            Message::ToolCall(call) => self.tool_call(sender, call, now).await?,
            Message::EmbodimentUpdate(update) => self.update(sender, update, now)?,
            other => return Err(BrokerError::Unexpected(other.message_type())),
        };
        self.seal(&reply, now)
    }

    fn authenticate(&self, envelope: &Envelope, message: &Message, now: Timestamp) -> BrokerResult<()> {
        let offered = match message {
            Message::RegisterAgent(r) => Some(r.public_key),
            Message::RegisterBroker(r) => Some(r.public_key),
            _ => None,
        };
        match offered {
            Some(key) if self.identities.lookup(&envelope.agent).is_none() => {
                let result = self.verify_self_signed(envelope, &key, now);
                if let Err(e) = &result {
                    warn!(
                        agent = %envelope.agent,
                        code = e.code(),
                        error = %e,
                        "Registration envelope rejected"
                    );
                }
                result.map_err(Into::into)
            },
            _ => {
                self.verifier.verify(envelope, now)?;
                Ok(())
            },
        }
    }

    /// Same checks as the verifier, against the key being registered.
    fn verify_self_signed(
        &self,
        envelope: &Envelope,
        key: &PublicKey,
        now: Timestamp,
    ) -> Result<(), SignatureError> {
        let now_ms = now.as_millis();
        let skew = now_ms.saturating_sub(envelope.ts);
        if skew.saturating_abs() > self.verifier.skew_ms() {
            return Err(SignatureError::ClockSkew {
                skew_ms: skew,
                window_ms: self.verifier.skew_ms(),
            });
        }
        envelope.verify_signature(key)?;
        self.replay
            .check_and_record(&envelope.agent, &envelope.nonce, envelope.ts, now_ms)
    }

    fn seal(&self, message: &Message, now: Timestamp) -> BrokerResult<Envelope> {
        let mut envelope = Envelope::new(message, self.broker_id.clone(), now)?;
        envelope.sign(&self.key);
        Ok(envelope)
    }

    // ---- Registration ---------------------------------------------------

    fn register_agent(&self, sender: &AgentId, registration: RegisterAgent) -> BrokerResult<Message> {
        if registration.role == AgentRole::Broker {
            return Err(forbidden(sender, "register as a broker with registerAgent"));
        }

        let mut identity = AgentIdentity::new(
            sender.clone(),
            registration.public_key,
            self.settings.registration_trust,
            registration.role,
        );
        if let Some(name) = &registration.display_name {
            identity = identity.with_display_name(name.clone());
        }
        self.identities.register_identity(identity)?;

        let published = self.publish_bodies(sender, registration.bodies)?;

        self.audit
            .record(
                sender.clone(),
                AuditAction::AgentRegistered {
                    role: registration.role,
                },
            )
            .parameters(json!({
                "displayName": registration.display_name,
                "endpoint": registration.endpoint,
                "bodies": published,
            }))
            .allowed()?;

        Ok(notice(format!("registered {sender} with {published} bodies")))
    }

    /// Validate every body before publishing any, so a bad definition
    /// leaves the index untouched.
    fn publish_bodies(
        &self,
        host: &AgentId,
        bodies: Vec<embody_discovery::BodyDefinition>,
    ) -> BrokerResult<usize> {
        if bodies.is_empty() {
            return Ok(0);
        }
        let identity = self
            .identities
            .lookup(host)
            .filter(|i| i.role == AgentRole::Host && !i.revoked)
            .ok_or_else(|| forbidden(host, "publish bodies"))?;

        for body in &bodies {
            if body.host_agent_id != *host {
                return Err(forbidden(
                    host,
                    &format!("publish body {} for {}", body.body_id, body.host_agent_id),
                ));
            }
            body.validate()?;
            self.tools.ensure_complete(body)?;
        }

        let count = bodies.len();
        for body in bodies {
            let body_id = body.body_id.clone();
            let version = self.index.index(body, identity.trust_level)?;
            self.audit
                .record(host.clone(), AuditAction::BodyPublished { body_id, version })
                .allowed()?;
        }
        Ok(count)
    }

    fn register_broker(&self, sender: &AgentId, announcement: RegisterBroker) -> BrokerResult<Message> {
        if announcement.broker_id != *sender {
            return Err(forbidden(sender, "announce another broker"));
        }
        let mut identity = AgentIdentity::new(
            sender.clone(),
            announcement.public_key,
            self.settings.registration_trust,
            AgentRole::Broker,
        );
        if let Some(name) = &announcement.display_name {
            identity = identity.with_display_name(name.clone());
        }
        self.identities.register_identity(identity)?;
        self.audit
            .record(sender.clone(), AuditAction::AgentRegistered { role: AgentRole::Broker })
            .parameters(json!({ "endpoint": announcement.endpoint }))
            .allowed()?;
        info!(peer = %sender, endpoint = %announcement.endpoint, "Peer broker registered");
        Ok(notice(format!("peer broker {sender} registered")))
    }

    /// Revoke an agent and withdraw everything it hosts. Returns the
    /// withdrawn bodies.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Identity`] if the agent is unknown.
    pub fn deregister(&self, agent: &AgentId, now: Timestamp) -> BrokerResult<Vec<BodyId>> {
        self.identities.revoke(agent)?;
        let withdrawn = self.index.unindex_host(agent)?;
        for body_id in &withdrawn {
            self.retire_body(agent, body_id, "host deregistered", now)?;
        }
        self.audit
            .record(
                self.broker_id.clone(),
                AuditAction::AgentRevoked {
                    agent_id: agent.clone(),
                },
            )
            .allowed()?;
        Ok(withdrawn)
    }

    // ---- Discovery and grants -------------------------------------------

    fn discover(&self, sender: &AgentId, query: &DiscoveryQuery) -> BrokerResult<Message> {
        let bodies = self.index.query(query)?;
        debug!(agent = %sender, hits = bodies.len(), "Discovery answered");
        Ok(Message::BodiesDiscovered(BodiesDiscovered { bodies }))
    }

    fn request_embodiment(
        &self,
        sender: &AgentId,
        request: &RequestEmbodiment,
        now: Timestamp,
    ) -> BrokerResult<Message> {
        Ok(match self.sessions.resolve_request(sender, request, now)? {
            Some(GrantDecision::Granted(granted)) => Message::EmbodimentGranted(granted),
            Some(GrantDecision::Denied(denied)) => Message::EmbodimentDenied(denied),
            None => Message::EmbodimentUpdate(EmbodimentUpdate {
                session_token: None,
                request_id: Some(request.request_id.clone()),
                event: UpdateEvent::Abandon,
            }),
        })
    }

    // ---- Tool calls -----------------------------------------------------

    async fn tool_call(&self, sender: &AgentId, call: ToolCall, now: Timestamp) -> BrokerResult<Message> {
        let info = self.sessions.session_info(&call.session_token)?;
        if info.guest_id != *sender {
            return Err(SessionError::NotParticipant(sender.clone()).into());
        }

        let outcome = self
            .execute(
                &call.session_token,
                &call.tool,
                call.parameters,
                call.estimated_usage.unwrap_or_default(),
                now,
            )
            .await?;

        Ok(Message::ToolResult(ToolResult {
            session_token: call.session_token,
            call_id: call.call_id,
            outcome,
        }))
    }

    /// Validate, audit and run one call. Violations come back as a denied
    /// outcome; an unusable session is an error.
    pub(crate) async fn execute(
        &self,
        token: &SessionToken,
        tool: &str,
        parameters: Value,
        estimated: ResourceUsage,
        now: Timestamp,
    ) -> BrokerResult<ToolOutcome> {
        let action = ToolAction {
            tool,
            parameters: &parameters,
            estimated,
        };
        match self.sessions.authorize_action(token, &action, now) {
            Ok(auth) => Ok(
                match self
                    .tools
                    .invoke(&self.index, &auth.body_id, tool, parameters)
                    .await
                {
                    Ok(result) => ToolOutcome::Ok { result },
                    Err(e) => ToolOutcome::Error {
                        message: e.to_string(),
                    },
                },
            ),
            Err(SessionError::Permission {
                error,
                violation_count,
            }) if error.is_violation() => {
                self.notify_if_revoked(token, error.code(), now);
                Ok(ToolOutcome::Denied {
                    code: error.code().to_string(),
                    message: error.to_string(),
                    violation_count,
                })
            },
            Err(e) => Err(e.into()),
        }
    }

    fn notify_if_revoked(&self, token: &SessionToken, violation_type: &str, now: Timestamp) {
        let Ok(info) = self.sessions.session_info(token) else {
            return;
        };
        if info.state != SessionState::Revoked {
            return;
        }
        self.notify(
            &info.guest_id,
            EmbodimentUpdate {
                session_token: Some(token.clone()),
                request_id: Some(info.request_id.clone()),
                event: UpdateEvent::Revoke {
                    violation_type: violation_type.to_string(),
                    reason: info.end_reason.clone().unwrap_or_default(),
                },
            },
            now,
        );
    }

    /// Apply usage observed by the host. A session over its limits is
    /// revoked and its guest notified.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Forbidden`] unless `host` serves the session.
    pub fn report_usage(
        &self,
        host: &AgentId,
        token: &SessionToken,
        observed: ResourceUsage,
        now: Timestamp,
    ) -> BrokerResult<SessionInfo> {
        let info = self.sessions.session_info(token)?;
        if info.host_id != *host {
            return Err(forbidden(host, "report usage for this session"));
        }
        let info = self.sessions.report_usage(token, observed, now)?;
        if info.state == SessionState::Revoked {
            self.notify_if_revoked(token, "resource_limit_exceeded", now);
        }
        Ok(info)
    }

    // ---- Lifecycle updates ----------------------------------------------

    fn update(&self, sender: &AgentId, update: EmbodimentUpdate, now: Timestamp) -> BrokerResult<Message> {
        match update.event {
            UpdateEvent::Abandon => {
                let request_id = update.request_id.ok_or_else(|| missing_field("requestId"))?;
                let was_pending = self.sessions.abandon_request(sender, &request_id, now)?;
                debug!(agent = %sender, request = %request_id, was_pending, "Request abandoned");
                Ok(Message::EmbodimentUpdate(EmbodimentUpdate {
                    session_token: None,
                    request_id: Some(request_id),
                    event: UpdateEvent::Abandon,
                }))
            },
            UpdateEvent::Terminate { reason } => {
                let token = update.session_token.ok_or_else(|| missing_field("sessionToken"))?;
                let info = self.sessions.terminate(&token, sender, &reason, now)?;
                let event = UpdateEvent::Terminate { reason };
                if info.guest_id != *sender {
                    self.notify(
                        &info.guest_id,
                        EmbodimentUpdate {
                            session_token: Some(token.clone()),
                            request_id: Some(info.request_id.clone()),
                            event: event.clone(),
                        },
                        now,
                    );
                }
                Ok(Message::EmbodimentUpdate(EmbodimentUpdate {
                    session_token: Some(token),
                    request_id: Some(info.request_id),
                    event,
                }))
            },
            UpdateEvent::Revoke {
                violation_type,
                reason,
            } => {
                let token = update.session_token.ok_or_else(|| missing_field("sessionToken"))?;
                let info = self.sessions.session_info(&token)?;
                if info.host_id != *sender {
                    return Err(forbidden(sender, "revoke this session"));
                }
                let info = self.sessions.revoke(&token, &violation_type, &reason, now)?;
                let event = UpdateEvent::Revoke {
                    violation_type,
                    reason,
                };
                self.notify(
                    &info.guest_id,
                    EmbodimentUpdate {
                        session_token: Some(token.clone()),
                        request_id: Some(info.request_id.clone()),
                        event: event.clone(),
                    },
                    now,
                );
                Ok(Message::EmbodimentUpdate(EmbodimentUpdate {
                    session_token: Some(token),
                    request_id: Some(info.request_id),
                    event,
                }))
            },
            UpdateEvent::BodyWithdrawn { body_id } => self.withdraw_body(sender, &body_id, now),
            UpdateEvent::Expired | UpdateEvent::Notice { .. } => {
                Err(BrokerError::Unexpected(MessageType::EmbodimentUpdate))
            },
        }
    }

    fn withdraw_body(&self, host: &AgentId, body_id: &BodyId, now: Timestamp) -> BrokerResult<Message> {
        let body = self
            .index
            .get(body_id)?
            .ok_or_else(|| BrokerError::UnknownBody(body_id.clone()))?;
        if body.host_agent_id != *host {
            return Err(forbidden(host, &format!("withdraw body {body_id}")));
        }
        self.index.unindex(body_id)?;
        let ended = self.retire_body(host, body_id, "body withdrawn", now)?;
        Ok(notice(format!("withdrew {body_id}, ended {ended} sessions")))
    }

    /// End sessions, drop handlers and audit a body that left the index.
    fn retire_body(
        &self,
        actor: &AgentId,
        body_id: &BodyId,
        reason: &str,
        now: Timestamp,
    ) -> BrokerResult<usize> {
        let ended = self.sessions.terminate_body_sessions(body_id, reason, now)?;
        self.tools.remove_body(body_id);
        for session in &ended {
            self.notify(
                &session.guest_id,
                EmbodimentUpdate {
                    session_token: None,
                    request_id: Some(session.request_id.clone()),
                    event: UpdateEvent::BodyWithdrawn {
                        body_id: body_id.clone(),
                    },
                },
                now,
            );
        }
        self.audit
            .record(
                actor.clone(),
                AuditAction::BodyWithdrawn {
                    body_id: body_id.clone(),
                },
            )
            .parameters(json!({ "reason": reason, "endedSessions": ended.len() }))
            .allowed()?;
        Ok(ended.len())
    }

    fn notify(&self, recipient: &AgentId, update: EmbodimentUpdate, now: Timestamp) {
        self.notifier
            .publish(&self.broker_id, &self.key, recipient, update, now);
    }
}

fn notice(message: String) -> Message {
    Message::EmbodimentUpdate(EmbodimentUpdate {
        session_token: None,
        request_id: None,
        event: UpdateEvent::Notice { message },
    })
}

fn forbidden(agent: &AgentId, action: &str) -> BrokerError {
    BrokerError::Forbidden {
        agent: agent.clone(),
        action: action.to_string(),
    }
}

fn missing_field(field: &str) -> BrokerError {
    ProtocolError::InvalidBody {
        message_type: MessageType::EmbodimentUpdate,
        reason: format!("missing {field}"),
    }
    .into()
}

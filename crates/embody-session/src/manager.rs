//! The session manager: grants, per-action authorization, escalation and
//! sweeping.
//!
//! Lock order is map first, then session. Code holding a session mutex never
//! touches the session map; load refreshes run after the guard is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use embody_audit::{AuditAction, AuditLog};
use embody_core::{AgentId, BodyId, RequestId, SessionState, SessionToken, Timestamp, TrustLevel};
use embody_discovery::{BodyDefinition, CapabilityIndex, DiscoveredBody, DiscoveryQuery};
use embody_identity::IdentityRegistry;
use embody_policy::{DenialReason, ResourceUsage, ToolAction, validate};
use embody_protocol::{EmbodimentDenied, EmbodimentGranted, RequestEmbodiment};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::permissions::generate_permissions;
use crate::session::{EmbodimentSession, SessionInfo};

/// Violations tolerated before the next one revokes the session.
pub const DEFAULT_VIOLATION_THRESHOLD: u32 = 5;

/// Default period of the background sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Session manager tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// A session is revoked once its violation count exceeds this.
    pub violation_threshold: u32,
    /// Period of the background sweep.
    pub sweep_interval: Duration,
    /// How long an unresolved or abandoned request is remembered.
    pub pending_ttl: Duration,
    /// How long ended sessions stay queryable before eviction.
    pub retention: Duration,
    /// Alternatives offered with a denial.
    pub max_alternatives: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            violation_threshold: DEFAULT_VIOLATION_THRESHOLD,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            pending_ttl: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
            max_alternatives: 3,
        }
    }
}

/// Answer to an embodiment request.
#[derive(Debug, Clone, PartialEq)]
pub enum GrantDecision {
    /// The guest may embody the body.
    Granted(EmbodimentGranted),
    /// The request was refused.
    Denied(EmbodimentDenied),
}

impl GrantDecision {
    /// True for a grant.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// An action that passed validation and was audited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    /// Truncated session reference.
    pub session_ref: String,
    /// Guest performing the action.
    pub guest_id: AgentId,
    /// Host that will execute it.
    pub host_id: AgentId,
    /// Body the action runs on.
    pub body_id: BodyId,
    /// Usage after accounting for the action's estimate.
    pub usage: ResourceUsage,
    /// Validated actions so far, this one included.
    pub action_count: u64,
}

/// What one sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions moved to `Expired`.
    pub expired: usize,
    /// Sessions revoked for exceeding resource limits.
    pub revoked: usize,
    /// Ended sessions dropped after the retention period.
    pub evicted: usize,
    /// Stale pending requests and tombstones forgotten.
    pub pruned_requests: usize,
}

impl SweepReport {
    /// True when the pass changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    guest: AgentId,
    opened_at: Timestamp,
    abandoned: bool,
}

type SharedSession = Arc<Mutex<EmbodimentSession>>;

/// Owns every embodiment session brokered by this service.
pub struct SessionManager {
    identities: Arc<IdentityRegistry>,
    index: Arc<CapabilityIndex>,
    audit: Arc<AuditLog>,
    broker_id: AgentId,
    config: SessionConfig,
    sessions: RwLock<HashMap<SessionToken, SharedSession>>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("broker_id", &self.broker_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager over the shared registries.
    #[must_use]
    pub fn new(
        identities: Arc<IdentityRegistry>,
        index: Arc<CapabilityIndex>,
        audit: Arc<AuditLog>,
        broker_id: AgentId,
    ) -> Self {
        Self {
            identities,
            index,
            audit,
            broker_id,
            config: SessionConfig::default(),
            sessions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the tuning.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Current tuning.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Identity of the broker running this manager.
    #[must_use]
    pub fn broker_id(&self) -> &AgentId {
        &self.broker_id
    }

    // ---- Requests -------------------------------------------------------

    /// Note that `guest` sent a request that will be resolved later.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateRequest`] if the ID is already known.
    pub fn open_request(
        &self,
        guest: &AgentId,
        request_id: &RequestId,
        now: Timestamp,
    ) -> SessionResult<()> {
        let mut pending = self.pending()?;
        if pending.contains_key(request_id) {
            return Err(SessionError::DuplicateRequest(request_id.clone()));
        }
        pending.insert(
            request_id.clone(),
            PendingRequest {
                guest: guest.clone(),
                opened_at: now,
                abandoned: false,
            },
        );
        Ok(())
    }

    /// Mark a request as abandoned by its sender.
    ///
    /// An unknown ID still leaves a tombstone so that a resolution arriving
    /// later is dropped. Returns whether the request was pending.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotParticipant`] if `guest` did not open the
    /// request.
    pub fn abandon_request(
        &self,
        guest: &AgentId,
        request_id: &RequestId,
        now: Timestamp,
    ) -> SessionResult<bool> {
        let mut pending = self.pending()?;
        if let Some(entry) = pending.get_mut(request_id) {
            if entry.guest != *guest {
                return Err(SessionError::NotParticipant(guest.clone()));
            }
            let was_pending = !entry.abandoned;
            entry.abandoned = true;
            debug!(request = %request_id, "Request abandoned");
            return Ok(was_pending);
        }
        pending.insert(
            request_id.clone(),
            PendingRequest {
                guest: guest.clone(),
                opened_at: now,
                abandoned: true,
            },
        );
        debug!(request = %request_id, "Abandon for unknown request recorded");
        Ok(false)
    }

    /// Decide a request opened with [`SessionManager::open_request`].
    ///
    /// Returns `Ok(None)` without side effects if the request was abandoned
    /// in the meantime. Requests that were never opened are decided as if
    /// sent through [`SessionManager::request_embodiment`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotParticipant`] if another agent opened the
    /// request, or any error from [`SessionManager::request_embodiment`].
    pub fn resolve_request(
        &self,
        guest: &AgentId,
        request: &RequestEmbodiment,
        now: Timestamp,
    ) -> SessionResult<Option<GrantDecision>> {
        {
            let mut pending = self.pending()?;
            match pending.get(&request.request_id) {
                Some(entry) if entry.guest != *guest => {
                    return Err(SessionError::NotParticipant(guest.clone()));
                },
                Some(entry) if entry.abandoned => {
                    pending.remove(&request.request_id);
                    debug!(request = %request.request_id, "Dropping resolution of abandoned request");
                    return Ok(None);
                },
                Some(_) => {
                    pending.remove(&request.request_id);
                },
                None => {},
            }
        }
        self.request_embodiment(guest, request, now).map(Some)
    }

    /// Decide an embodiment request.
    ///
    /// Checks run in order: body indexed, host registered and not revoked,
    /// concurrency below the body's limit, guest trust high enough. A grant
    /// is audited before the session becomes visible; if the audit log
    /// refuses the entry no session is created.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AuditUnavailable`] if the grant cannot be
    /// audited. Denials are returned as `Ok(GrantDecision::Denied)`.
    pub fn request_embodiment(
        &self,
        guest: &AgentId,
        request: &RequestEmbodiment,
        now: Timestamp,
    ) -> SessionResult<GrantDecision> {
        let guest_trust = self
            .identities
            .lookup(guest)
            .filter(|identity| !identity.revoked)
            .map_or(TrustLevel::Untrusted, |identity| identity.trust_level);

        let body = self
            .index
            .get(&request.body_id)
            .map_err(|e| SessionError::Internal(e.to_string()))?;
        let Some(body) = body else {
            return self.deny(
                guest,
                request,
                None,
                guest_trust,
                DenialReason::BodyNotFound,
                format!("body '{}' is not published", request.body_id),
            );
        };

        if !self.identities.is_active(&body.host_agent_id) {
            return self.deny(
                guest,
                request,
                Some(&body),
                guest_trust,
                DenialReason::HostPolicyViolation,
                format!("host '{}' is not in good standing", body.host_agent_id),
            );
        }

        let outcome = {
            let mut sessions = self.sessions_mut()?;
            let active = count_live(&sessions, &body.body_id, now)?;
            if active >= body.max_concurrent_guests {
                Err((
                    DenialReason::SessionLimitExceeded,
                    format!(
                        "body '{}' already serves {active} of {} guests",
                        body.body_id, body.max_concurrent_guests
                    ),
                ))
            } else if guest_trust < body.trust_level_required {
                Err((
                    DenialReason::InsufficientTrust,
                    format!(
                        "trust level {guest_trust} is below required {}",
                        body.trust_level_required
                    ),
                ))
            } else {
                let grant = self.grant(guest, request, &body, now)?;
                sessions.insert(grant.0.clone(), Arc::new(Mutex::new(grant.1)));
                Ok(grant.2)
            }
        };

        match outcome {
            Ok(granted) => {
                self.refresh_load(&body.body_id, now);
                Ok(GrantDecision::Granted(granted))
            },
            Err((reason, message)) => {
                self.deny(guest, request, Some(&body), guest_trust, reason, message)
            },
        }
    }

    /// Build and audit a grant. Called with the session map write-locked.
    fn grant(
        &self,
        guest: &AgentId,
        request: &RequestEmbodiment,
        body: &BodyDefinition,
        now: Timestamp,
    ) -> SessionResult<(SessionToken, EmbodimentSession, EmbodimentGranted)> {
        let duration = grant_duration(body, request.duration_secs);
        let session = EmbodimentSession::activate(
            request.request_id.clone(),
            guest.clone(),
            body.host_agent_id.clone(),
            body.body_id.clone(),
            body.version,
            generate_permissions(body),
            body.security_policy.clone(),
            now,
            duration,
        );

        self.audit
            .record(
                guest.clone(),
                AuditAction::EmbodimentGranted {
                    body_id: body.body_id.clone(),
                    host_agent_id: body.host_agent_id.clone(),
                    expires_at: session.expires_at.as_millis(),
                },
            )
            .session(session.token.reference())
            .parameters(json!({
                "requestId": request.request_id,
                "durationSecs": duration,
                "purpose": request.purpose,
            }))
            .allowed()
            .map_err(|e| SessionError::AuditUnavailable(e.to_string()))?;

        info!(
            session = %session.token,
            guest = %guest,
            body = %body.body_id,
            duration_secs = duration,
            "Embodiment granted"
        );

        let granted = EmbodimentGranted {
            request_id: request.request_id.clone(),
            session_token: session.token.clone(),
            body_id: body.body_id.clone(),
            host_agent_id: body.host_agent_id.clone(),
            permissions: session.permissions.clone(),
            security_policy: session.policy.clone(),
            expires_at: session.expires_at.as_millis(),
            mcp_endpoint: mcp_endpoint(&session.token),
        };
        Ok((session.token.clone(), session, granted))
    }

    fn deny(
        &self,
        guest: &AgentId,
        request: &RequestEmbodiment,
        body: Option<&BodyDefinition>,
        guest_trust: TrustLevel,
        reason: DenialReason,
        message: String,
    ) -> SessionResult<GrantDecision> {
        let alternatives = body
            .map(|b| self.alternatives(b, guest_trust))
            .unwrap_or_default();

        if let Err(e) = self
            .audit
            .record(
                guest.clone(),
                AuditAction::EmbodimentDenied {
                    body_id: request.body_id.clone(),
                },
            )
            .parameters(json!({ "requestId": request.request_id }))
            .denied(reason.code(), message.as_str())
        {
            error!(request = %request.request_id, error = %e, "Failed to audit denial");
        }

        info!(
            guest = %guest,
            body = %request.body_id,
            reason = %reason,
            alternatives = alternatives.len(),
            "Embodiment denied"
        );

        Ok(GrantDecision::Denied(EmbodimentDenied {
            request_id: request.request_id.clone(),
            body_id: request.body_id.clone(),
            reason,
            message,
            alternatives,
        }))
    }

    /// Other bodies exposing the same tools that the guest could embody.
    fn alternatives(&self, body: &BodyDefinition, guest_trust: TrustLevel) -> Vec<DiscoveredBody> {
        if self.config.max_alternatives == 0 {
            return Vec::new();
        }
        let mut query = DiscoveryQuery::for_capabilities(body.tool_names());
        query.max_results = Some(self.config.max_alternatives.saturating_add(1));

        match self.index.query(&query) {
            Ok(hits) => hits
                .into_iter()
                .filter(|hit| hit.body_id != body.body_id)
                .filter(|hit| hit.trust_level_required <= guest_trust)
                .take(self.config.max_alternatives)
                .collect(),
            Err(e) => {
                warn!(body = %body.body_id, error = %e, "Alternative lookup failed");
                Vec::new()
            },
        }
    }

    // ---- Actions --------------------------------------------------------

    /// Validate and account one tool call.
    ///
    /// An overdue session is expired first. On success the call is audited
    /// (fail closed) and the usage projection stored. A violation is
    /// counted and audited; once the count exceeds the threshold the
    /// session is revoked.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownSession`] for an unknown token,
    /// [`SessionError::Permission`] when the validator refuses, and
    /// [`SessionError::AuditUnavailable`] when an allowed call cannot be
    /// audited.
    pub fn authorize_action(
        &self,
        token: &SessionToken,
        action: &ToolAction<'_>,
        now: Timestamp,
    ) -> SessionResult<Authorization> {
        let shared = self.lookup(token)?;
        let (result, ended_body) = {
            let mut session = lock(&shared)?;
            let mut ended = false;
            if session.is_overdue(now) {
                ended = self.end(&mut session, SessionState::Expired, "session duration elapsed", None, now);
            }
            let result = self.apply_validation(&mut session, action, now, &mut ended);
            (result, ended.then(|| session.body_id.clone()))
        };
        if let Some(body_id) = ended_body {
            self.refresh_load(&body_id, now);
        }
        result
    }

    fn apply_validation(
        &self,
        session: &mut EmbodimentSession,
        action: &ToolAction<'_>,
        now: Timestamp,
        ended: &mut bool,
    ) -> SessionResult<Authorization> {
        let session_ref = session.token.reference();
        let audit_action = AuditAction::ToolCall {
            tool: action.tool.to_string(),
        };

        match validate(&session.view(), action, now) {
            Ok(projected) => {
                self.audit
                    .record(session.guest_id.clone(), audit_action)
                    .session(session_ref.as_str())
                    .parameters(action.parameters.clone())
                    .allowed()
                    .map_err(|e| SessionError::AuditUnavailable(e.to_string()))?;

                session.action_count = session.action_count.saturating_add(1);
                session.usage = projected;
                debug!(session = %session.token, tool = action.tool, "Action authorized");
                Ok(Authorization {
                    session_ref,
                    guest_id: session.guest_id.clone(),
                    host_id: session.host_id.clone(),
                    body_id: session.body_id.clone(),
                    usage: projected,
                    action_count: session.action_count,
                })
            },
            Err(error) if !error.is_violation() => {
                if let Err(e) = self
                    .audit
                    .record(session.guest_id.clone(), audit_action)
                    .session(session_ref.as_str())
                    .denied(error.code(), error.to_string())
                {
                    error!(session = %session.token, error = %e, "Failed to audit refused call");
                }
                debug!(session = %session.token, state = %session.state, "Call on unusable session");
                Err(SessionError::Permission {
                    error,
                    violation_count: session.violation_count,
                })
            },
            Err(error) => {
                session.action_count = session.action_count.saturating_add(1);
                session.violation_count = session.violation_count.saturating_add(1);
                let violation_count = session.violation_count;

                if let Err(e) = self
                    .audit
                    .record(session.guest_id.clone(), audit_action)
                    .session(session_ref.as_str())
                    .parameters(action.parameters.clone())
                    .violation(error.code())
                    .denied(error.code(), error.to_string())
                {
                    error!(session = %session.token, error = %e, "Failed to audit violation");
                }

                warn!(
                    session = %session.token,
                    tool = action.tool,
                    violation = error.code(),
                    violation_count,
                    "Policy violation"
                );

                if violation_count > self.config.violation_threshold {
                    let reason = format!(
                        "{violation_count} violations exceed threshold {}",
                        self.config.violation_threshold
                    );
                    *ended |= self.end(
                        session,
                        SessionState::Revoked,
                        &reason,
                        Some(error.code()),
                        now,
                    );
                }

                Err(SessionError::Permission {
                    error,
                    violation_count,
                })
            },
        }
    }

    // ---- Lifecycle ------------------------------------------------------

    /// Close a session gracefully. Allowed for the guest, the host and the
    /// broker.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotParticipant`] for anyone else, or the
    /// error matching the session's state if it already ended.
    pub fn terminate(
        &self,
        token: &SessionToken,
        by: &AgentId,
        reason: &str,
        now: Timestamp,
    ) -> SessionResult<SessionInfo> {
        self.finish(token, now, |manager, session| {
            if *by != session.guest_id && *by != session.host_id && *by != manager.broker_id {
                return Err(SessionError::NotParticipant(by.clone()));
            }
            manager.end(session, SessionState::Terminated, reason, None, now);
            Ok(())
        })
    }

    /// Revoke a session as a security action.
    ///
    /// # Errors
    ///
    /// Returns the error matching the session's state if it already ended.
    pub fn revoke(
        &self,
        token: &SessionToken,
        violation_type: &str,
        reason: &str,
        now: Timestamp,
    ) -> SessionResult<SessionInfo> {
        self.finish(token, now, |manager, session| {
            manager.end(session, SessionState::Revoked, reason, Some(violation_type), now);
            Ok(())
        })
    }

    /// Replace the session's usage with what the host observed. A session
    /// found over its limits is revoked; the returned snapshot shows it.
    ///
    /// # Errors
    ///
    /// Returns the error matching the session's state if it already ended.
    pub fn report_usage(
        &self,
        token: &SessionToken,
        observed: ResourceUsage,
        now: Timestamp,
    ) -> SessionResult<SessionInfo> {
        self.finish(token, now, |manager, session| {
            session.usage = observed;
            if let Err(error) = observed.check_within(&session.policy.resource_limits) {
                manager.end(
                    session,
                    SessionState::Revoked,
                    &error.to_string(),
                    Some(error.code()),
                    now,
                );
            }
            Ok(())
        })
    }

    /// Run `op` on a live session, expiring it first if overdue.
    fn finish<F>(&self, token: &SessionToken, now: Timestamp, op: F) -> SessionResult<SessionInfo>
    where
        F: FnOnce(&Self, &mut EmbodimentSession) -> SessionResult<()>,
    {
        let shared = self.lookup(token)?;
        let (result, body_id, ended) = {
            let mut session = lock(&shared)?;
            let was_active = session.state == SessionState::Active;
            let result = if session.is_overdue(now) {
                self.end(&mut session, SessionState::Expired, "session duration elapsed", None, now);
                Err(SessionError::SessionExpired)
            } else if session.state.is_terminal() {
                Err(SessionError::for_ended(session.state))
            } else {
                op(self, &mut *session).map(|()| session.info())
            };
            let ended = was_active && session.state.is_terminal();
            (result, session.body_id.clone(), ended)
        };
        if ended {
            self.refresh_load(&body_id, now);
        }
        result
    }

    /// Terminate every live session on a body, e.g. after it was withdrawn.
    /// Returns snapshots of the sessions ended.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Internal`] if a lock is poisoned.
    pub fn terminate_body_sessions(
        &self,
        body_id: &BodyId,
        reason: &str,
        now: Timestamp,
    ) -> SessionResult<Vec<SessionInfo>> {
        let mut ended = Vec::new();
        for shared in self.snapshot()? {
            let mut session = lock(&shared)?;
            if session.body_id != *body_id || session.state != SessionState::Active {
                continue;
            }
            let state = if session.is_overdue(now) {
                SessionState::Expired
            } else {
                SessionState::Terminated
            };
            if self.end(&mut session, state, reason, None, now) {
                ended.push(session.info());
            }
        }
        if !ended.is_empty() {
            self.refresh_load(body_id, now);
        }
        Ok(ended)
    }

    /// Move a session into a terminal state and audit it. Returns whether
    /// the state changed. Audit failure is logged; the transition stands.
    fn end(
        &self,
        session: &mut EmbodimentSession,
        state: SessionState,
        reason: &str,
        violation_type: Option<&str>,
        now: Timestamp,
    ) -> bool {
        if !session.transition(state, now, Some(reason.to_string())) {
            return false;
        }

        let mut entry = self
            .audit
            .record(
                session.guest_id.clone(),
                AuditAction::SessionEnded {
                    state,
                    reason: reason.to_string(),
                },
            )
            .session(session.token.reference())
            .parameters(json!({
                "actionCount": session.action_count,
                "violationCount": session.violation_count,
            }));
        if let Some(violation) = violation_type {
            entry = entry.violation(violation);
        }
        let audited = if state == SessionState::Terminated || state == SessionState::Expired {
            entry.allowed()
        } else {
            entry.denied(violation_type.unwrap_or("revoked"), reason)
        };
        if let Err(e) = audited {
            error!(session = %session.token, error = %e, "Failed to audit session end");
        }

        match state {
            SessionState::Revoked => {
                warn!(session = %session.token, guest = %session.guest_id, reason, "Session revoked");
            },
            _ => info!(session = %session.token, state = %state, reason, "Session ended"),
        }
        true
    }

    // ---- Queries --------------------------------------------------------

    /// Snapshot of one session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownSession`] for an unknown token.
    pub fn session_info(&self, token: &SessionToken) -> SessionResult<SessionInfo> {
        let shared = self.lookup(token)?;
        let session = lock(&shared)?;
        Ok(session.info())
    }

    /// Live sessions on a body.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Internal`] if a lock is poisoned.
    pub fn active_sessions(&self, body_id: &BodyId, now: Timestamp) -> SessionResult<u32> {
        let sessions = self.sessions()?;
        count_live(&sessions, body_id, now)
    }

    /// Sessions currently tracked, ended ones included until evicted.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Internal`] if the map lock is poisoned.
    pub fn len(&self) -> SessionResult<usize> {
        Ok(self.sessions()?.len())
    }

    /// Requests opened or abandoned and not yet resolved or pruned.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Internal`] if the pending table is poisoned.
    pub fn pending_requests(&self) -> SessionResult<usize> {
        Ok(self.pending()?.len())
    }

    // ---- Sweeping -------------------------------------------------------

    /// Expire overdue sessions, revoke sessions over their limits, evict
    /// sessions ended longer than the retention period ago and forget stale
    /// requests. Needs no traffic to make progress.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Internal`] if a lock is poisoned.
    pub fn sweep(&self, now: Timestamp) -> SessionResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut touched: HashSet<BodyId> = HashSet::new();
        let mut evictable: Vec<SessionToken> = Vec::new();
        let retention = self.config.retention.as_secs();

        for shared in self.snapshot()? {
            let mut session = lock(&shared)?;
            if session.is_overdue(now) {
                if self.end(&mut session, SessionState::Expired, "session duration elapsed", None, now) {
                    report.expired = report.expired.saturating_add(1);
                    touched.insert(session.body_id.clone());
                }
            } else if session.state == SessionState::Active
                && let Err(error) = session.usage.check_within(&session.policy.resource_limits)
            {
                let reason = error.to_string();
                if self.end(&mut session, SessionState::Revoked, &reason, Some(error.code()), now) {
                    report.revoked = report.revoked.saturating_add(1);
                    touched.insert(session.body_id.clone());
                }
            } else if let Some(ended_at) = session.ended_at
                && ended_at.plus_secs(retention) <= now
            {
                evictable.push(session.token.clone());
            }
        }

        if !evictable.is_empty() {
            let mut sessions = self.sessions_mut()?;
            for token in &evictable {
                if sessions.remove(token).is_some() {
                    report.evicted = report.evicted.saturating_add(1);
                }
            }
        }

        {
            let ttl = self.config.pending_ttl.as_secs();
            let mut pending = self.pending()?;
            let before = pending.len();
            pending.retain(|_, entry| entry.opened_at.plus_secs(ttl) > now);
            report.pruned_requests = before.saturating_sub(pending.len());
        }

        for body_id in &touched {
            self.refresh_load(body_id, now);
        }

        if report.is_empty() {
            debug!("Sweep found nothing to do");
        } else {
            info!(
                expired = report.expired,
                revoked = report.revoked,
                evicted = report.evicted,
                pruned_requests = report.pruned_requests,
                "Session sweep"
            );
        }
        Ok(report)
    }

    // ---- Internals ------------------------------------------------------

    /// Push the live session count of a body into the capability index.
    fn refresh_load(&self, body_id: &BodyId, now: Timestamp) {
        let active = match self.active_sessions(body_id, now) {
            Ok(n) => n,
            Err(e) => {
                warn!(body = %body_id, error = %e, "Could not count sessions");
                return;
            },
        };
        if let Err(e) = self.index.set_active_sessions(body_id, active) {
            debug!(body = %body_id, error = %e, "Load not recorded");
        }
    }

    fn lookup(&self, token: &SessionToken) -> SessionResult<SharedSession> {
        self.sessions()?
            .get(token)
            .cloned()
            .ok_or(SessionError::UnknownSession)
    }

    fn snapshot(&self) -> SessionResult<Vec<SharedSession>> {
        Ok(self.sessions()?.values().cloned().collect())
    }

    fn sessions(
        &self,
    ) -> SessionResult<std::sync::RwLockReadGuard<'_, HashMap<SessionToken, SharedSession>>> {
        self.sessions
            .read()
            .map_err(|e| SessionError::Internal(e.to_string()))
    }

    fn sessions_mut(
        &self,
    ) -> SessionResult<std::sync::RwLockWriteGuard<'_, HashMap<SessionToken, SharedSession>>> {
        self.sessions
            .write()
            .map_err(|e| SessionError::Internal(e.to_string()))
    }

    fn pending(
        &self,
    ) -> SessionResult<std::sync::MutexGuard<'_, HashMap<RequestId, PendingRequest>>> {
        self.pending
            .lock()
            .map_err(|e| SessionError::Internal(e.to_string()))
    }
}

fn lock(shared: &SharedSession) -> SessionResult<std::sync::MutexGuard<'_, EmbodimentSession>> {
    shared
        .lock()
        .map_err(|e| SessionError::Internal(e.to_string()))
}

fn count_live(
    sessions: &HashMap<SessionToken, SharedSession>,
    body_id: &BodyId,
    now: Timestamp,
) -> SessionResult<u32> {
    let mut active: u32 = 0;
    for shared in sessions.values() {
        let session = lock(shared)?;
        if session.body_id == *body_id && session.is_live(now) {
            active = active.saturating_add(1);
        }
    }
    Ok(active)
}

/// Requested or default duration, clamped to `[1, maxSessionDuration]` and
/// then to the policy's session timeout.
fn grant_duration(body: &BodyDefinition, requested: Option<u64>) -> u64 {
    let max = body.max_session_duration.max(1);
    let secs = requested
        .unwrap_or(body.default_session_duration)
        .clamp(1, max);
    match body.security_policy.timeout_cap() {
        Some(cap) => secs.min(cap),
        None => secs,
    }
}

/// Session-scoped tool endpoint path handed to the guest.
#[must_use]
pub fn mcp_endpoint(token: &SessionToken) -> String {
    format!("/sessions/{}/mcp", token.expose())
}

#[cfg(test)]
mod tests {
    use super::*;
    use embody_audit::{
        AuditEntry, AuditEntryId, AuditError, AuditResult, AuditStorage, MemoryAuditStorage,
    };
    use embody_core::AgentRole;
    use embody_crypto::KeyPair;
    use embody_discovery::{ToolKind, ToolSpec};
    use embody_policy::{PermissionError, ResourceLimits, SecurityPolicy};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        manager: SessionManager,
        identities: Arc<IdentityRegistry>,
        index: Arc<CapabilityIndex>,
        audit: Arc<AuditLog>,
    }

    fn policy() -> SecurityPolicy {
        SecurityPolicy {
            allowed_paths: vec!["/workspace/**".into()],
            denied_paths: vec!["/workspace/.env".into()],
            allowed_commands: vec!["git".into(), "ls".into()],
            ..SecurityPolicy::default()
        }
    }

    fn body(id: &str, host: &str, max_guests: u32) -> BodyDefinition {
        BodyDefinition {
            body_id: BodyId::new(id),
            host_agent_id: AgentId::new(host),
            description: "dev box".into(),
            environment_type: "linux-container".into(),
            tools: vec![
                ToolSpec::new("file.read", ToolKind::File),
                ToolSpec::new("shell.execute", ToolKind::Command),
            ],
            security_policy: policy(),
            max_concurrent_guests: max_guests,
            default_session_duration: 600,
            max_session_duration: 3600,
            trust_level_required: TrustLevel::Basic,
            version: 0,
        }
    }

    fn harness_with(audit: AuditLog) -> Harness {
        let identities = Arc::new(IdentityRegistry::new());
        let index = Arc::new(CapabilityIndex::new());
        let audit = Arc::new(audit);
        for (id, role) in [
            ("host", AgentRole::Host),
            ("guest", AgentRole::Guest),
            ("other", AgentRole::Guest),
        ] {
            identities
                .register(
                    AgentId::new(id),
                    KeyPair::generate().export_public_key(),
                    TrustLevel::Basic,
                    role,
                )
                .unwrap();
        }
        index
            .index(body("dev-box", "host", 1), TrustLevel::Basic)
            .unwrap();
        let manager = SessionManager::new(
            Arc::clone(&identities),
            Arc::clone(&index),
            Arc::clone(&audit),
            AgentId::new("broker"),
        );
        Harness {
            manager,
            identities,
            index,
            audit,
        }
    }

    fn harness() -> Harness {
        harness_with(AuditLog::in_memory(KeyPair::generate()))
    }

    fn request(id: &str, body: &str) -> RequestEmbodiment {
        RequestEmbodiment {
            request_id: RequestId::new(id),
            body_id: BodyId::new(body),
            duration_secs: None,
            purpose: Some("tests".into()),
        }
    }

    fn grant(h: &Harness, guest: &str, now: Timestamp) -> EmbodimentGranted {
        match h
            .manager
            .request_embodiment(&AgentId::new(guest), &request("r1", "dev-box"), now)
            .unwrap()
        {
            GrantDecision::Granted(g) => g,
            GrantDecision::Denied(d) => panic!("unexpected denial: {d:?}"),
        }
    }

    fn denied(decision: GrantDecision) -> EmbodimentDenied {
        match decision {
            GrantDecision::Denied(d) => d,
            GrantDecision::Granted(g) => panic!("unexpected grant: {g:?}"),
        }
    }

    fn read(path: &str) -> serde_json::Value {
        json!({ "path": path })
    }

    fn action<'a>(tool: &'a str, params: &'a serde_json::Value) -> ToolAction<'a> {
        ToolAction {
            tool,
            parameters: params,
            estimated: ResourceUsage::default(),
        }
    }

    #[test]
    fn test_grant_snapshot_and_endpoint() {
        let h = harness();
        let now = Timestamp::now();
        let g = grant(&h, "guest", now);
        assert_eq!(g.host_agent_id, AgentId::new("host"));
        assert_eq!(g.expires_at, now.plus_secs(600).as_millis());
        assert_eq!(g.mcp_endpoint, format!("/sessions/{}/mcp", g.session_token.expose()));
        let rendered: Vec<String> = g.permissions.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec!["file.read:/workspace/**", "shell.execute:git", "shell.execute:ls"]
        );

        let info = h.manager.session_info(&g.session_token).unwrap();
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(h.manager.active_sessions(&BodyId::new("dev-box"), now).unwrap(), 1);
        assert_eq!(h.audit.count().unwrap(), 1);
    }

    #[test]
    fn test_duration_clamping() {
        let mut b = body("b", "host", 1);
        assert_eq!(grant_duration(&b, Some(0)), 1);
        assert_eq!(grant_duration(&b, Some(99_999)), 3600);
        assert_eq!(grant_duration(&b, None), 600);
        b.security_policy.session_timeout = 120;
        assert_eq!(grant_duration(&b, None), 120);
        assert_eq!(grant_duration(&b, Some(30)), 30);
    }

    #[test]
    fn test_denial_reasons() {
        let h = harness();
        let now = Timestamp::now();
        let guest = AgentId::new("guest");

        let d = denied(h.manager.request_embodiment(&guest, &request("r0", "nope"), now).unwrap());
        assert_eq!(d.reason, DenialReason::BodyNotFound);

        grant(&h, "guest", now);
        let d = denied(
            h.manager
                .request_embodiment(&AgentId::new("other"), &request("r2", "dev-box"), now)
                .unwrap(),
        );
        assert_eq!(d.reason, DenialReason::SessionLimitExceeded);

        h.identities.revoke(&AgentId::new("host")).unwrap();
        let d = denied(h.manager.request_embodiment(&guest, &request("r3", "dev-box"), now).unwrap());
        assert_eq!(d.reason, DenialReason::HostPolicyViolation);
    }

    #[test]
    fn test_insufficient_trust_offers_alternatives() {
        let h = harness();
        let now = Timestamp::now();
        let mut strict = body("strict-box", "host", 4);
        strict.trust_level_required = TrustLevel::Verified;
        h.index.index(strict, TrustLevel::Basic).unwrap();
        h.index
            .index(body("spare-box", "host", 4), TrustLevel::Basic)
            .unwrap();

        let d = denied(
            h.manager
                .request_embodiment(&AgentId::new("guest"), &request("r1", "strict-box"), now)
                .unwrap(),
        );
        assert_eq!(d.reason, DenialReason::InsufficientTrust);
        let ids: Vec<&str> = d.alternatives.iter().map(|a| a.body_id.as_str()).collect();
        assert!(ids.contains(&"spare-box"));
        assert!(ids.contains(&"dev-box"));
        assert!(!ids.contains(&"strict-box"));

        // Unregistered guests are treated as untrusted.
        let d = denied(
            h.manager
                .request_embodiment(&AgentId::new("stranger"), &request("r2", "spare-box"), now)
                .unwrap(),
        );
        assert_eq!(d.reason, DenialReason::InsufficientTrust);
    }

    #[test]
    fn test_violation_escalation() {
        let h = harness();
        let now = Timestamp::now();
        let g = grant(&h, "guest", now);
        let params = read("/etc/passwd");

        for expected in 1..=5_u32 {
            let err = h
                .manager
                .authorize_action(&g.session_token, &action("file.read", &params), now)
                .unwrap_err();
            match err {
                SessionError::Permission {
                    error: PermissionError::PathDenied { path, .. },
                    violation_count,
                } => {
                    assert_eq!(path, "/etc/passwd");
                    assert_eq!(violation_count, expected);
                },
                other => panic!("unexpected error: {other:?}"),
            }
        }
        let info = h.manager.session_info(&g.session_token).unwrap();
        assert_eq!(info.state, SessionState::Active);

        let sixth = h
            .manager
            .authorize_action(&g.session_token, &action("file.read", &params), now)
            .unwrap_err();
        assert!(matches!(sixth, SessionError::Permission { violation_count: 6, .. }));
        let info = h.manager.session_info(&g.session_token).unwrap();
        assert_eq!(info.state, SessionState::Revoked);

        let ok_params = read("/workspace/src/main.rs");
        let seventh = h
            .manager
            .authorize_action(&g.session_token, &action("file.read", &ok_params), now)
            .unwrap_err();
        assert!(matches!(
            seventh,
            SessionError::Permission {
                error: PermissionError::SessionInvalid {
                    state: SessionState::Revoked
                },
                violation_count: 6,
            }
        ));
        assert!(seventh.is_unauthenticated());
        assert_eq!(h.manager.active_sessions(&BodyId::new("dev-box"), now).unwrap(), 0);
    }

    #[test]
    fn test_allowed_action_accumulates_usage() {
        let h = harness();
        let now = Timestamp::now();
        let g = grant(&h, "guest", now);
        let params = read("/workspace/a.txt");
        let mut call = action("file.read", &params);
        call.estimated.memory_mb = 400;

        let first = h.manager.authorize_action(&g.session_token, &call, now).unwrap();
        assert_eq!(first.usage.memory_mb, 400);
        assert_eq!(first.action_count, 1);
        let second = h.manager.authorize_action(&g.session_token, &call, now).unwrap();
        assert_eq!(second.usage.memory_mb, 800);

        let err = h.manager.authorize_action(&g.session_token, &call, now).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Permission {
                error: PermissionError::ResourceLimitExceeded { .. },
                violation_count: 1,
            }
        ));
        assert_eq!(h.manager.session_info(&g.session_token).unwrap().usage.memory_mb, 800);
    }

    #[test]
    fn test_lazy_expiry_on_action() {
        let h = harness();
        let now = Timestamp::now();
        let g = grant(&h, "guest", now);
        let later = now.plus_secs(601);
        let params = read("/workspace/a.txt");
        let err = h
            .manager
            .authorize_action(&g.session_token, &action("file.read", &params), later)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Permission {
                error: PermissionError::SessionInvalid {
                    state: SessionState::Expired
                },
                ..
            }
        ));
        let info = h.manager.session_info(&g.session_token).unwrap();
        assert_eq!(info.state, SessionState::Expired);
        assert_eq!(info.violation_count, 0);
    }

    #[test]
    fn test_terminate_participants_only() {
        let h = harness();
        let now = Timestamp::now();
        let g = grant(&h, "guest", now);

        let err = h
            .manager
            .terminate(&g.session_token, &AgentId::new("other"), "bye", now)
            .unwrap_err();
        assert_eq!(err, SessionError::NotParticipant(AgentId::new("other")));

        let info = h
            .manager
            .terminate(&g.session_token, &AgentId::new("host"), "maintenance", now)
            .unwrap();
        assert_eq!(info.state, SessionState::Terminated);
        assert_eq!(info.end_reason.as_deref(), Some("maintenance"));

        let again = h
            .manager
            .terminate(&g.session_token, &AgentId::new("guest"), "bye", now)
            .unwrap_err();
        assert_eq!(again, SessionError::SessionTerminated);

        // The slot is free again.
        let decision = h
            .manager
            .request_embodiment(&AgentId::new("other"), &request("r9", "dev-box"), now)
            .unwrap();
        assert!(decision.is_granted());
    }

    #[test]
    fn test_report_usage_over_limit_revokes() {
        let h = harness();
        let now = Timestamp::now();
        let g = grant(&h, "guest", now);
        let limits = ResourceLimits::default();
        let over = ResourceUsage {
            cpu_percent: limits.max_cpu_percent.saturating_add(1),
            ..ResourceUsage::default()
        };
        let info = h.manager.report_usage(&g.session_token, over, now).unwrap();
        assert_eq!(info.state, SessionState::Revoked);
        let entries = h.audit.session_entries(&info.session_ref).unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.violation_type.as_deref(), Some("resource_limit_exceeded"));
    }

    #[test]
    fn test_cancelled_request_resolution_is_noop() {
        let h = harness();
        let now = Timestamp::now();
        let guest = AgentId::new("guest");
        let req = request("r1", "dev-box");

        h.manager.open_request(&guest, &req.request_id, now).unwrap();
        assert_eq!(
            h.manager.open_request(&guest, &req.request_id, now).unwrap_err(),
            SessionError::DuplicateRequest(req.request_id.clone())
        );
        assert!(h.manager.abandon_request(&guest, &req.request_id, now).unwrap());
        assert_eq!(h.manager.resolve_request(&guest, &req, now).unwrap(), None);
        assert_eq!(h.manager.len().unwrap(), 0);
        assert_eq!(h.audit.count().unwrap(), 0);

        // Abandon that overtakes the open.
        let early = request("r2", "dev-box");
        assert!(!h.manager.abandon_request(&guest, &early.request_id, now).unwrap());
        assert_eq!(h.manager.resolve_request(&guest, &early, now).unwrap(), None);

        let fresh = request("r3", "dev-box");
        h.manager.open_request(&guest, &fresh.request_id, now).unwrap();
        let decision = h.manager.resolve_request(&guest, &fresh, now).unwrap();
        assert!(decision.is_some_and(|d| d.is_granted()));
        assert_eq!(h.manager.pending_requests().unwrap(), 0);
    }

    #[test]
    fn test_sweep_expires_and_evicts() {
        let h = harness();
        let now = Timestamp::now();
        let g = grant(&h, "guest", now);
        h.manager
            .abandon_request(&AgentId::new("guest"), &RequestId::new("stale"), now)
            .unwrap();

        let report = h.manager.sweep(now.plus_secs(601)).unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.pruned_requests, 1);
        assert_eq!(
            h.manager.session_info(&g.session_token).unwrap().state,
            SessionState::Expired
        );

        let idle = h.manager.sweep(now.plus_secs(602)).unwrap();
        assert!(idle.is_empty());

        let report = h.manager.sweep(now.plus_secs(4201)).unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(
            h.manager.session_info(&g.session_token).unwrap_err(),
            SessionError::UnknownSession
        );
    }

    #[test]
    fn test_withdrawn_body_sessions_terminated() {
        let h = harness();
        let now = Timestamp::now();
        let g = grant(&h, "guest", now);
        let ended = h
            .manager
            .terminate_body_sessions(&BodyId::new("dev-box"), "body withdrawn", now)
            .unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].state, SessionState::Terminated);
        assert_eq!(
            h.manager.session_info(&g.session_token).unwrap().state,
            SessionState::Terminated
        );
    }

    struct BreakableStorage {
        inner: MemoryAuditStorage,
        broken: Arc<AtomicBool>,
    }

    impl AuditStorage for BreakableStorage {
        fn store(&self, entry: &AuditEntry) -> AuditResult<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(AuditError::StorageError("disk full".into()));
            }
            self.inner.store(entry)
        }
        fn get(&self, id: &AuditEntryId) -> AuditResult<Option<AuditEntry>> {
            self.inner.get(id)
        }
        fn last(&self) -> AuditResult<Option<AuditEntry>> {
            self.inner.last()
        }
        fn entries(&self) -> AuditResult<Vec<AuditEntry>> {
            self.inner.entries()
        }
        fn session_entries(&self, session_ref: &str) -> AuditResult<Vec<AuditEntry>> {
            self.inner.session_entries(session_ref)
        }
        fn count(&self) -> AuditResult<usize> {
            self.inner.count()
        }
        fn list_sessions(&self) -> AuditResult<Vec<String>> {
            self.inner.list_sessions()
        }
        fn flush(&self) -> AuditResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_audit_failure_fails_closed() {
        let broken = Arc::new(AtomicBool::new(false));
        let storage = BreakableStorage {
            inner: MemoryAuditStorage::new(),
            broken: Arc::clone(&broken),
        };
        let h = harness_with(AuditLog::with_storage(Box::new(storage), KeyPair::generate()));
        let now = Timestamp::now();
        let g = grant(&h, "guest", now);

        broken.store(true, Ordering::SeqCst);
        let params = read("/workspace/a.txt");
        let err = h
            .manager
            .authorize_action(&g.session_token, &action("file.read", &params), now)
            .unwrap_err();
        assert!(matches!(err, SessionError::AuditUnavailable(_)));
        assert_eq!(h.manager.session_info(&g.session_token).unwrap().action_count, 0);

        // Denials are still answered while the log is down.
        let decision = h
            .manager
            .request_embodiment(&AgentId::new("other"), &request("r2", "missing"), now)
            .map(|d| d.is_granted());
        assert_eq!(decision, Ok(false));

        // Grants are not.
        h.index
            .index(body("spare-box", "host", 4), TrustLevel::Basic)
            .unwrap();
        let err = h
            .manager
            .request_embodiment(&AgentId::new("other"), &request("r3", "spare-box"), now)
            .unwrap_err();
        assert!(matches!(err, SessionError::AuditUnavailable(_)));
        assert_eq!(h.manager.len().unwrap(), 1);
        assert_eq!(h.manager.active_sessions(&BodyId::new("spare-box"), now).unwrap(), 0);
    }
}

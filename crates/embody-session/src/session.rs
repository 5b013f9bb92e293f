//! A single embodiment session and its read-only snapshot.

use embody_core::{AgentId, BodyId, RequestId, SessionState, SessionToken, Timestamp};
use embody_policy::{PathRules, Permission, ResourceUsage, SecurityPolicy, SessionView};
use serde::Serialize;
use tracing::debug;

/// Live state of one granted embodiment.
///
/// Permissions and policy are frozen at grant time; a later policy change on
/// the body never reaches an existing session.
#[derive(Debug, Clone)]
pub struct EmbodimentSession {
    /// Bearer credential.
    pub token: SessionToken,
    /// Request that produced this session.
    pub request_id: RequestId,
    /// Embodying agent.
    pub guest_id: AgentId,
    /// Host serving the body.
    pub host_id: AgentId,
    /// Embodied body.
    pub body_id: BodyId,
    /// Body version the snapshot was taken from.
    pub body_version: u64,
    /// Lifecycle state.
    pub state: SessionState,
    /// Granted `tool:constraint` permissions.
    pub permissions: Vec<Permission>,
    /// Policy snapshot.
    pub policy: SecurityPolicy,
    /// Path globs of the snapshot, compiled at grant.
    paths: PathRules,
    /// Grant time.
    pub started_at: Timestamp,
    /// Absolute expiry.
    pub expires_at: Timestamp,
    /// Accumulated resource usage.
    pub usage: ResourceUsage,
    /// Validated actions, allowed or not.
    pub action_count: u64,
    /// Policy violations.
    pub violation_count: u32,
    /// Why the session ended.
    pub end_reason: Option<String>,
    /// When the session ended.
    pub ended_at: Option<Timestamp>,
}

impl EmbodimentSession {
    /// Build a session that has just been granted and is now active.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub(crate) fn activate(
        request_id: RequestId,
        guest_id: AgentId,
        host_id: AgentId,
        body_id: BodyId,
        body_version: u64,
        permissions: Vec<Permission>,
        policy: SecurityPolicy,
        now: Timestamp,
        duration_secs: u64,
    ) -> Self {
        let mut session = Self {
            token: SessionToken::generate(),
            request_id,
            guest_id,
            host_id,
            body_id,
            body_version,
            state: SessionState::Requested,
            permissions,
            paths: policy.path_rules(),
            policy,
            started_at: now,
            expires_at: now.plus_secs(duration_secs),
            usage: ResourceUsage::default(),
            action_count: 0,
            violation_count: 0,
            end_reason: None,
            ended_at: None,
        };
        session.transition(SessionState::Granted, now, None);
        session.transition(SessionState::Active, now, None);
        session
    }

    /// Move to `next` if the state machine allows it. Returns whether the
    /// state changed.
    pub(crate) fn transition(
        &mut self,
        next: SessionState,
        now: Timestamp,
        reason: Option<String>,
    ) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        debug!(session = %self.token, from = %self.state, to = %next, "Session transition");
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(now);
            self.end_reason = reason;
        }
        true
    }

    /// Active and not yet past expiry.
    #[must_use]
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.state == SessionState::Active && now < self.expires_at
    }

    /// Active but past expiry: the next observer must move it to `Expired`.
    #[must_use]
    pub fn is_overdue(&self, now: Timestamp) -> bool {
        self.state == SessionState::Active && now >= self.expires_at
    }

    /// View for the permission validator.
    #[must_use]
    pub fn view(&self) -> SessionView<'_> {
        SessionView {
            state: self.state,
            expires_at: self.expires_at,
            permissions: &self.permissions,
            policy: &self.policy,
            paths: &self.paths,
            usage: self.usage,
        }
    }

    /// Owned snapshot without the raw token.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_ref: self.token.reference(),
            request_id: self.request_id.clone(),
            guest_id: self.guest_id.clone(),
            host_id: self.host_id.clone(),
            body_id: self.body_id.clone(),
            body_version: self.body_version,
            state: self.state,
            permissions: self.permissions.clone(),
            started_at: self.started_at,
            expires_at: self.expires_at,
            usage: self.usage,
            action_count: self.action_count,
            violation_count: self.violation_count,
            end_reason: self.end_reason.clone(),
        }
    }
}

/// Point-in-time copy of a session, safe to log or serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Truncated token reference.
    pub session_ref: String,
    /// Originating request.
    pub request_id: RequestId,
    /// Guest.
    pub guest_id: AgentId,
    /// Host.
    pub host_id: AgentId,
    /// Body.
    pub body_id: BodyId,
    /// Body version at grant.
    pub body_version: u64,
    /// State when the snapshot was taken.
    pub state: SessionState,
    /// Granted permissions.
    pub permissions: Vec<Permission>,
    /// Grant time.
    pub started_at: Timestamp,
    /// Expiry.
    pub expires_at: Timestamp,
    /// Usage so far.
    pub usage: ResourceUsage,
    /// Validated actions.
    pub action_count: u64,
    /// Violations.
    pub violation_count: u32,
    /// End reason, once ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

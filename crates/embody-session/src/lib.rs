//! Embody Session - Embodiment session lifecycle.
//!
//! This crate provides:
//! - The session state machine (`Requested → Granted → Active → Expired |
//!   Terminated | Revoked`, or `Requested → Denied`)
//! - Grant and denial decisions with alternative bodies
//! - Permission generation from a body's tools and policy
//! - Per-action authorization with violation escalation
//! - A cancellable background sweeper
//!
//! Every grant, tool call and terminal transition is written to the audit
//! log. Grants and allowed calls fail closed: if the audit entry cannot be
//! stored, the operation is refused.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use embody_audit::AuditLog;
//! use embody_core::{AgentId, AgentRole, BodyId, RequestId, Timestamp, TrustLevel};
//! use embody_crypto::KeyPair;
//! use embody_discovery::{BodyDefinition, CapabilityIndex, ToolKind, ToolSpec};
//! use embody_identity::IdentityRegistry;
//! use embody_policy::SecurityPolicy;
//! use embody_protocol::RequestEmbodiment;
//! use embody_session::SessionManager;
//!
//! let identities = Arc::new(IdentityRegistry::new());
//! identities
//!     .register(AgentId::new("host"), KeyPair::generate().export_public_key(),
//!               TrustLevel::Verified, AgentRole::Host)
//!     .unwrap();
//! let index = Arc::new(CapabilityIndex::new());
//! index
//!     .index(
//!         BodyDefinition {
//!             body_id: BodyId::new("dev-box"),
//!             host_agent_id: AgentId::new("host"),
//!             description: "Linux dev container".into(),
//!             environment_type: "linux-container".into(),
//!             tools: vec![ToolSpec::new("http.get", ToolKind::General)],
//!             security_policy: SecurityPolicy::default(),
//!             max_concurrent_guests: 1,
//!             default_session_duration: 600,
//!             max_session_duration: 3600,
//!             trust_level_required: TrustLevel::Untrusted,
//!             version: 0,
//!         },
//!         TrustLevel::Verified,
//!     )
//!     .unwrap();
//!
//! let manager = SessionManager::new(
//!     identities,
//!     index,
//!     Arc::new(AuditLog::in_memory(KeyPair::generate())),
//!     AgentId::new("broker"),
//! );
//! let request = RequestEmbodiment {
//!     request_id: RequestId::new("req-1"),
//!     body_id: BodyId::new("dev-box"),
//!     duration_secs: None,
//!     purpose: None,
//! };
//! let decision = manager
//!     .request_embodiment(&AgentId::new("guest"), &request, Timestamp::now())
//!     .unwrap();
//! assert!(decision.is_granted());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod manager;
mod permissions;
mod session;
mod sweeper;

pub use error::{SessionError, SessionResult};
pub use manager::{
    Authorization, DEFAULT_SWEEP_INTERVAL, DEFAULT_VIOLATION_THRESHOLD, GrantDecision,
    SessionConfig, SessionManager, SweepReport, mcp_endpoint,
};
pub use permissions::generate_permissions;
pub use session::{EmbodimentSession, SessionInfo};
pub use sweeper::SessionSweeper;

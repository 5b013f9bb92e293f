//! Embody Policy - Delegated control boundaries for embodiment sessions.
//!
//! This crate provides:
//! - [`SecurityPolicy`] with allow/deny path globs and command rules
//! - [`PathRules`], a policy's path globs compiled once per session
//! - [`ResourceLimits`] and [`ResourceUsage`] accounting
//! - [`Permission`] strings of the form `tool:constraint`
//! - [`validate`], the pure per-action permission check
//! - [`DenialReason`] codes for refused embodiment requests
//!
//! # Example
//!
//! ```
//! use embody_core::{SessionState, Timestamp};
//! use embody_policy::{validate, Permission, ResourceUsage, SecurityPolicy, SessionView, ToolAction};
//! use serde_json::json;
//!
//! let policy = SecurityPolicy::default();
//! let paths = policy.path_rules();
//! let permissions = vec![Permission::new("file.read", "/workspace/**")];
//! let now = Timestamp::now();
//! let session = SessionView {
//!     state: SessionState::Active,
//!     expires_at: now.plus_secs(300),
//!     permissions: &permissions,
//!     policy: &policy,
//!     paths: &paths,
//!     usage: ResourceUsage::default(),
//! };
//!
//! let params = json!({"path": "/workspace/../etc/passwd"});
//! let action = ToolAction { tool: "file.read", parameters: &params, estimated: ResourceUsage::default() };
//! assert!(validate(&session, &action, now).is_err());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod path;
mod permission;
mod policy;
mod validator;

pub use error::{DenialReason, PermissionError, PermissionResult, PolicyError, PolicyResult};
pub use path::canonicalize_path;
pub use permission::Permission;
pub use policy::{PathRules, ResourceLimits, ResourceUsage, SecurityPolicy};
pub use validator::{COMMAND_KEYS, PATH_KEYS, SessionView, ToolAction, validate};

//! Embody Broker - The embodiment broker service.
//!
//! This crate provides:
//! - [`EmbodimentService`], which authenticates envelopes and dispatches
//!   registration, discovery, embodiment requests, tool calls and
//!   lifecycle updates
//! - [`ToolRegistry`], the table binding declared tools to [`ToolHandler`]s
//! - [`McpEndpoint`], the session-scoped `/sessions/{token}/mcp` endpoint
//! - [`Notifier`], which broadcasts signed lifecycle updates
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use embody_audit::AuditLog;
//! use embody_broker::{BrokerSettings, EmbodimentService};
//! use embody_core::AgentId;
//! use embody_crypto::KeyPair;
//!
//! let service = EmbodimentService::new(
//!     AgentId::new("broker"),
//!     KeyPair::generate(),
//!     Arc::new(AuditLog::in_memory(KeyPair::generate())),
//!     BrokerSettings::default(),
//! )
//! .unwrap();
//! assert!(service.identities().is_active(&AgentId::new("broker")));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod mcp;
mod notify;
mod service;
mod tools;

pub use error::{BrokerError, BrokerResult};
pub use mcp::{McpEndpoint, McpResponse, parse_session_path};
pub use notify::{DEFAULT_NOTIFY_CAPACITY, Notification, Notifier};
pub use service::{BrokerSettings, DEFAULT_REPLAY_WINDOW_MS, EmbodimentService};
pub use tools::{ToolError, ToolHandler, ToolRegistry};

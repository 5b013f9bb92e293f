//! Embody Discovery - Finding bodies by capability.
//!
//! This crate provides:
//! - [`BodyDefinition`] and [`ToolSpec`], the host-published description of a body
//! - [`CapabilityIndex`], an incrementally maintained inverted index
//! - Ranked queries weighing capability overlap, host reputation, latency and load
//!
//! # Example
//!
//! ```
//! use embody_core::{AgentId, BodyId, TrustLevel};
//! use embody_discovery::{BodyDefinition, CapabilityIndex, DiscoveryQuery, ToolKind, ToolSpec};
//! use embody_policy::SecurityPolicy;
//!
//! let index = CapabilityIndex::new();
//! index.index(
//!     BodyDefinition {
//!         body_id: BodyId::new("dev-box"),
//!         host_agent_id: AgentId::new("host-1"),
//!         description: "Linux dev container".into(),
//!         environment_type: "linux-container".into(),
//!         tools: vec![ToolSpec::new("file.read", ToolKind::File)],
//!         security_policy: SecurityPolicy::default(),
//!         max_concurrent_guests: 2,
//!         default_session_duration: 600,
//!         max_session_duration: 3600,
//!         trust_level_required: TrustLevel::Basic,
//!         version: 0,
//!     },
//!     TrustLevel::Verified,
//! ).unwrap();
//!
//! let hits = index.query(&DiscoveryQuery::for_capabilities(["file.*"])).unwrap();
//! assert_eq!(hits[0].body_id.as_str(), "dev-box");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod body;
mod error;
mod index;

pub use body::{BodyDefinition, ToolKind, ToolSpec};
pub use embody_core::CapabilityPattern;
pub use error::{DiscoveryError, DiscoveryResult};
pub use index::{CapabilityIndex, DEFAULT_MAX_RESULTS, DiscoveredBody, DiscoveryQuery};

//! Embody Core - Foundation types for the hosted embodiment protocol.
//!
//! This crate provides:
//! - Agent, body and request identifiers
//! - Session tokens that never print in full
//! - Timestamps with millisecond wire encoding
//! - Trust levels, agent roles and session states
//! - Capability patterns with trailing-wildcard matching
//! - UTF-8 safe truncation used by log sanitizers

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod pattern;
pub mod types;
pub mod utils;

pub use error::{CoreError, CoreResult};
pub use pattern::CapabilityPattern;
pub use types::{
    AgentId, AgentRole, BodyId, RequestId, SessionState, SessionToken, Timestamp, TrustLevel,
};
pub use utils::truncate_to_boundary;

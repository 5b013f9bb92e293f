//! Embody Identity - Who is allowed to speak on the federation.
//!
//! This crate provides:
//! - [`AgentIdentity`] records binding an agent ID to one Ed25519 key
//! - [`IdentityRegistry`] with register, lookup, revoke and signed key rotation
//! - A [`KeyResolver`](embody_protocol::KeyResolver) implementation for envelope verification
//!
//! # Example
//!
//! ```
//! use embody_core::{AgentId, AgentRole, TrustLevel};
//! use embody_crypto::KeyPair;
//! use embody_identity::IdentityRegistry;
//! use embody_protocol::KeyResolver;
//!
//! let registry = IdentityRegistry::new();
//! let key = KeyPair::generate();
//! registry
//!     .register(AgentId::new("host-1"), key.export_public_key(), TrustLevel::Verified, AgentRole::Host)
//!     .unwrap();
//! assert!(registry.resolve_key(&AgentId::new("host-1")).is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod registry;

pub use error::{IdentityError, IdentityResult};
pub use registry::{AgentIdentity, IdentityRegistry, rotation_message};

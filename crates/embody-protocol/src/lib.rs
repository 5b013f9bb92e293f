//! Embody Protocol - Signed envelopes for federated embodiment.
//!
//! This crate provides:
//! - [`Envelope`], the JSON wrapper every inter-agent message travels in
//! - The ten typed message bodies behind [`Message`]
//! - Canonical signing bytes and Ed25519 signing/verification
//! - [`EnvelopeVerifier`] with clock-skew checks and a [`ReplayGuard`]
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use embody_core::{AgentId, BodyId, RequestId, Timestamp};
//! use embody_crypto::{KeyPair, PublicKey};
//! use embody_protocol::{Envelope, EnvelopeVerifier, KeyResolver, Message, RequestEmbodiment};
//!
//! struct OneKey(PublicKey);
//!
//! impl KeyResolver for OneKey {
//!     fn resolve_key(&self, _agent: &AgentId) -> Option<PublicKey> {
//!         Some(self.0)
//!     }
//! }
//!
//! let key = KeyPair::generate();
//! let msg = Message::RequestEmbodiment(RequestEmbodiment {
//!     request_id: RequestId::generate(),
//!     body_id: BodyId::new("dev-box"),
//!     duration_secs: None,
//!     purpose: None,
//! });
//! let envelope = Envelope::seal(&msg, AgentId::new("guest"), &key).unwrap();
//!
//! let verifier = EnvelopeVerifier::new(Arc::new(OneKey(key.export_public_key())));
//! assert!(verifier.verify(&envelope, Timestamp::now()).is_ok());
//! assert!(verifier.verify(&envelope, Timestamp::now()).is_err()); // replay
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod canonical;
mod envelope;
mod error;
mod messages;
mod replay;
mod verifier;

pub use canonical::canonical_json;
pub use envelope::{Envelope, MAX_ENVELOPE_BYTES, MAX_NONCE_LEN, sign};
pub use error::{ProtocolError, ProtocolResult, SignatureError, SignatureResult};
pub use messages::{
    BodiesDiscovered, DiscoverBodies, EmbodimentDenied, EmbodimentGranted, EmbodimentUpdate,
    Message, MessageType, RegisterAgent, RegisterBroker, RequestEmbodiment, ToolCall, ToolOutcome,
    ToolResult, UpdateEvent,
};
pub use replay::{DEFAULT_REPLAY_CAPACITY, ReplayGuard};
pub use verifier::{DEFAULT_CLOCK_SKEW_MS, EnvelopeVerifier, KeyResolver};

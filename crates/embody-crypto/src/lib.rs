//! Embody Crypto - Signing and hashing primitives for the federation protocol.
//!
//! This crate provides:
//! - Ed25519 key pairs with zeroized secret material
//! - Base64 wire encoding for public keys and signatures
//! - BLAKE3 content hashing for the audit chain
//!
//! # Example
//!
//! ```
//! use embody_crypto::{ContentHash, KeyPair};
//!
//! let keypair = KeyPair::generate();
//! let signature = keypair.sign(b"envelope bytes");
//! assert!(keypair.export_public_key().verify(b"envelope bytes", &signature).is_ok());
//!
//! let hash = ContentHash::hash(b"audit entry");
//! assert_eq!(hash.to_hex().len(), 64);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod hash;
mod keypair;
mod signature;

pub use error::{CryptoError, CryptoResult};
pub use hash::ContentHash;
pub use keypair::{KeyPair, PublicKey};
pub use signature::Signature;

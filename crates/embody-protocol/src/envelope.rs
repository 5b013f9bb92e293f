//! The signed envelope carried by every inter-agent message.
//!
//! Signing bytes are built field by field with length prefixes so that no
//! two distinct envelopes can produce the same bytes:
//!
//! ```text
//! 0x01 | lp(type) | lp(agent) | ts (i64 LE) | lp(nonce) | lp(canonical_json(body))
//! ```

use embody_core::{AgentId, Timestamp};
use embody_crypto::{KeyPair, PublicKey, Signature};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{canonical_json, write_length_prefixed};
use crate::error::{ProtocolError, ProtocolResult, SignatureError, SignatureResult};
use crate::messages::{Message, MessageType};

/// Largest envelope accepted off the wire.
pub const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;

/// Longest nonce accepted.
pub const MAX_NONCE_LEN: usize = 128;

const SIGNING_VERSION: u8 = 0x01;

/// A protocol message plus sender, freshness data and signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Sender.
    pub agent: AgentId,
    /// Sender clock, Unix milliseconds.
    pub ts: i64,
    /// Random per-envelope value.
    pub nonce: String,
    /// Ed25519 signature over [`Envelope::signing_data`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<Signature>,
    /// Message body.
    pub body: Value,
}

impl Envelope {
    /// Build an unsigned envelope with a fresh nonce.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if the body cannot be encoded.
    pub fn new(message: &Message, agent: AgentId, ts: Timestamp) -> ProtocolResult<Self> {
        Ok(Self {
            message_type: message.message_type(),
            agent,
            ts: ts.as_millis(),
            nonce: fresh_nonce(),
            sig: None,
            body: message.to_body()?,
        })
    }

    /// Build and sign an envelope stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if the body cannot be encoded.
    pub fn seal(message: &Message, agent: AgentId, key: &KeyPair) -> ProtocolResult<Self> {
        let mut envelope = Self::new(message, agent, Timestamp::now())?;
        envelope.sign(key);
        Ok(envelope)
    }

    /// Sign (or re-sign) in place.
    pub fn sign(&mut self, key: &KeyPair) {
        self.sig = Some(key.sign(&self.signing_data()));
    }

    /// The exact bytes covered by the signature.
    #[must_use]
    pub fn signing_data(&self) -> Vec<u8> {
        let body = canonical_json(&self.body);
        let mut data = Vec::with_capacity(body.len().saturating_add(128));
        data.push(SIGNING_VERSION);
        write_length_prefixed(&mut data, self.message_type.as_str().as_bytes());
        write_length_prefixed(&mut data, self.agent.as_str().as_bytes());
        data.extend_from_slice(&self.ts.to_le_bytes());
        write_length_prefixed(&mut data, self.nonce.as_bytes());
        write_length_prefixed(&mut data, &body);
        data
    }

    /// Check the signature against a known key. Freshness and replay are
    /// the verifier's job.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::BadSignature`] if the signature is missing or invalid.
    pub fn verify_signature(&self, key: &PublicKey) -> SignatureResult<()> {
        let sig = self.sig.as_ref().ok_or(SignatureError::BadSignature)?;
        key.verify(&self.signing_data(), sig)
            .map_err(|_| SignatureError::BadSignature)
    }

    /// Decode the body into its typed message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidBody`] if the body does not fit its type.
    pub fn message(&self) -> ProtocolResult<Message> {
        Message::from_body(self.message_type, &self.body)
    }

    /// Sender timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_millis(self.ts)
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if encoding fails.
    pub fn to_vec(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse an envelope off the wire. Rejects oversized input, unknown
    /// types and bodies that do not decode for their type, so that nothing
    /// malformed reaches a handler.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] describing the first problem found.
    pub fn from_slice(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(ProtocolError::TooLarge {
                size: bytes.len(),
                max: MAX_ENVELOPE_BYTES,
            });
        }

        let raw: Value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Some(fields) = raw.as_object() else {
            return Err(ProtocolError::Malformed("envelope is not an object".into()));
        };
        let type_name = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing type".into()))?;
        let _: MessageType = type_name.parse()?;

        let envelope: Self =
            serde_json::from_value(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        if envelope.nonce.is_empty() || envelope.nonce.len() > MAX_NONCE_LEN {
            return Err(ProtocolError::Malformed(format!(
                "nonce must be 1..={MAX_NONCE_LEN} bytes"
            )));
        }

        envelope.message()?;
        Ok(envelope)
    }
}

/// Sign an envelope in place. Same as [`Envelope::sign`].
pub fn sign(envelope: &mut Envelope, key: &KeyPair) {
    envelope.sign(key);
}

fn fresh_nonce() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

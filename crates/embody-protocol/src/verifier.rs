//! Envelope authentication: key lookup, freshness, signature, replay.

use std::sync::Arc;

use embody_core::{AgentId, Timestamp};
use embody_crypto::PublicKey;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::{SignatureError, SignatureResult};
use crate::replay::ReplayGuard;

/// Default accepted clock skew: five minutes.
pub const DEFAULT_CLOCK_SKEW_MS: i64 = 300_000;

/// Supplies the current public key of an agent.
pub trait KeyResolver: Send + Sync {
    /// Key on file for `agent`, or `None` if the agent is unknown or revoked.
    fn resolve_key(&self, agent: &AgentId) -> Option<PublicKey>;
}

/// Authenticates incoming envelopes.
///
/// Checks run in a fixed order and the nonce is only recorded once every
/// other check has passed, so a forged envelope cannot burn a nonce.
pub struct EnvelopeVerifier {
    resolver: Arc<dyn KeyResolver>,
    replay: Arc<ReplayGuard>,
    skew_ms: i64,
}

impl EnvelopeVerifier {
    /// Create a verifier with the default skew window and its own replay cache.
    #[must_use]
    pub fn new(resolver: Arc<dyn KeyResolver>) -> Self {
        Self::with_window(resolver, DEFAULT_CLOCK_SKEW_MS)
    }

    /// Create a verifier with a custom skew window.
    #[must_use]
    pub fn with_window(resolver: Arc<dyn KeyResolver>, skew_ms: i64) -> Self {
        let skew_ms = skew_ms.max(0);
        Self {
            resolver,
            replay: Arc::new(ReplayGuard::new(skew_ms)),
            skew_ms,
        }
    }

    /// Share an existing replay cache.
    #[must_use]
    pub fn with_replay_guard(mut self, replay: Arc<ReplayGuard>) -> Self {
        self.replay = replay;
        self
    }

    /// Accepted skew in milliseconds.
    #[must_use]
    pub fn skew_ms(&self) -> i64 {
        self.skew_ms
    }

    /// Authenticate an envelope at time `now`.
    ///
    /// # Errors
    ///
    /// In check order: [`SignatureError::UnknownAgent`],
    /// [`SignatureError::ClockSkew`], [`SignatureError::BadSignature`],
    /// [`SignatureError::ReplayedNonce`].
    pub fn verify(&self, envelope: &Envelope, now: Timestamp) -> SignatureResult<PublicKey> {
        let result = self.check(envelope, now);
        match &result {
            Ok(_) => debug!(
                agent = %envelope.agent,
                message_type = %envelope.message_type,
                "Envelope verified"
            ),
            Err(e) => warn!(
                agent = %envelope.agent,
                message_type = %envelope.message_type,
                code = e.code(),
                error = %e,
                "Envelope rejected"
            ),
        }
        result
    }

    fn check(&self, envelope: &Envelope, now: Timestamp) -> SignatureResult<PublicKey> {
        let key = self.resolver.resolve_key(&envelope.agent).ok_or_else(|| {
            SignatureError::UnknownAgent {
                agent: envelope.agent.clone(),
            }
        })?;

        let now_ms = now.as_millis();
        let skew = now_ms.saturating_sub(envelope.ts);
        if skew.saturating_abs() > self.skew_ms {
            return Err(SignatureError::ClockSkew {
                skew_ms: skew,
                window_ms: self.skew_ms,
            });
        }

        envelope.verify_signature(&key)?;

        self.replay
            .check_and_record(&envelope.agent, &envelope.nonce, envelope.ts, now_ms)?;
        Ok(key)
    }
}

impl std::fmt::Debug for EnvelopeVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeVerifier")
            .field("skew_ms", &self.skew_ms)
            .field("replay", &self.replay)
            .finish_non_exhaustive()
    }
}

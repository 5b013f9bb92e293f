//! Replay protection: `(agent, nonce)` pairs seen inside the freshness window.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use embody_core::AgentId;

use crate::error::{SignatureError, SignatureResult};

/// Default number of remembered nonces.
pub const DEFAULT_REPLAY_CAPACITY: usize = 100_000;

#[derive(Default)]
struct ReplayCache {
    /// agent -> nonce -> expiry (ms).
    seen: HashMap<AgentId, HashMap<String, i64>>,
    /// Insertion order, oldest first, for pruning and eviction.
    order: VecDeque<(i64, AgentId, String)>,
}

impl ReplayCache {
    fn remove(&mut self, agent: &AgentId, nonce: &str) {
        if let Some(nonces) = self.seen.get_mut(agent) {
            nonces.remove(nonce);
            if nonces.is_empty() {
                self.seen.remove(agent);
            }
        }
    }

    fn prune(&mut self, now_ms: i64) {
        while let Some((expires, _, _)) = self.order.front() {
            if *expires > now_ms {
                break;
            }
            if let Some((_, agent, nonce)) = self.order.pop_front() {
                self.remove(&agent, &nonce);
            }
        }
    }

    fn contains(&self, agent: &AgentId, nonce: &str, now_ms: i64) -> bool {
        self.seen
            .get(agent)
            .and_then(|n| n.get(nonce))
            .is_some_and(|expires| *expires > now_ms)
    }
}

/// Remembers accepted nonces through `ts + window` inclusive, matching the
/// inclusive skew check.
///
/// The cache is bounded: when full, the oldest entry is evicted before its
/// expiry. Size the capacity above the expected envelope rate times the
/// window.
pub struct ReplayGuard {
    window_ms: i64,
    capacity: usize,
    inner: RwLock<ReplayCache>,
}

impl ReplayGuard {
    /// Create a guard for the given window.
    #[must_use]
    pub fn new(window_ms: i64) -> Self {
        Self::with_capacity(window_ms, DEFAULT_REPLAY_CAPACITY)
    }

    /// Create a guard with an explicit capacity bound.
    #[must_use]
    pub fn with_capacity(window_ms: i64, capacity: usize) -> Self {
        Self {
            window_ms: window_ms.max(0),
            capacity: capacity.max(1),
            inner: RwLock::new(ReplayCache::default()),
        }
    }

    /// Has this nonce been accepted and not yet expired?
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Internal`] if the cache lock is poisoned.
    pub fn contains(&self, agent: &AgentId, nonce: &str, now_ms: i64) -> SignatureResult<bool> {
        let cache = self
            .inner
            .read()
            .map_err(|e| SignatureError::Internal(e.to_string()))?;
        Ok(cache.contains(agent, nonce, now_ms))
    }

    /// Record a nonce, failing if it is already present.
    ///
    /// Check and insert happen under one write lock, so two concurrent
    /// deliveries of the same envelope cannot both pass.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::ReplayedNonce`] on a repeat and
    /// [`SignatureError::Internal`] if the lock is poisoned.
    pub fn check_and_record(
        &self,
        agent: &AgentId,
        nonce: &str,
        ts_ms: i64,
        now_ms: i64,
    ) -> SignatureResult<()> {
        let mut cache = self
            .inner
            .write()
            .map_err(|e| SignatureError::Internal(e.to_string()))?;

        cache.prune(now_ms);
        if cache.contains(agent, nonce, now_ms) {
            return Err(SignatureError::ReplayedNonce {
                agent: agent.clone(),
            });
        }

        while cache.order.len() >= self.capacity {
            let Some((_, old_agent, old_nonce)) = cache.order.pop_front() else {
                break;
            };
            cache.remove(&old_agent, &old_nonce);
        }

        // The skew check accepts |now - ts| == window, so the nonce must
        // still be present at ts + window.
        let expires = ts_ms
            .saturating_add(self.window_ms)
            .saturating_add(1)
            .max(now_ms.saturating_add(1));
        cache
            .seen
            .entry(agent.clone())
            .or_default()
            .insert(nonce.to_string(), expires);
        cache
            .order
            .push_back((expires, agent.clone(), nonce.to_string()));
        Ok(())
    }

    /// Number of remembered nonces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map_or(0, |c| c.order.len())
    }

    /// True when no nonce is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ReplayGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayGuard")
            .field("window_ms", &self.window_ms)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

//! In-memory identity registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use embody_core::{AgentId, AgentRole, Timestamp, TrustLevel};
use embody_crypto::{PublicKey, Signature};
use embody_protocol::KeyResolver;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{IdentityError, IdentityResult};

const ROTATION_DOMAIN: &[u8] = b"embody-rotate-v1";

/// A registered agent. The key never changes for the lifetime of a record;
/// rotation retires the record and creates a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    /// Agent identifier.
    pub agent_id: AgentId,
    /// Envelope signing key.
    pub public_key: PublicKey,
    /// Trust assigned by the broker operator.
    pub trust_level: TrustLevel,
    /// Role the agent registered as.
    pub role: AgentRole,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// When this record was created.
    pub registered_at: Timestamp,
    /// Revoked identities resolve to no key.
    #[serde(default)]
    pub revoked: bool,
}

impl AgentIdentity {
    /// Create a fresh, unrevoked identity.
    #[must_use]
    pub fn new(
        agent_id: AgentId,
        public_key: PublicKey,
        trust_level: TrustLevel,
        role: AgentRole,
    ) -> Self {
        Self {
            agent_id,
            public_key,
            trust_level,
            role,
            display_name: None,
            registered_at: Timestamp::now(),
            revoked: false,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Bytes the current key signs to authorize a rotation to `new_key`.
#[must_use]
pub fn rotation_message(agent: &AgentId, new_key: &PublicKey) -> Vec<u8> {
    let agent = agent.as_str().as_bytes();
    let len = u32::try_from(agent.len()).unwrap_or(u32::MAX);
    let mut data = Vec::with_capacity(
        ROTATION_DOMAIN
            .len()
            .saturating_add(agent.len())
            .saturating_add(36),
    );
    data.extend_from_slice(ROTATION_DOMAIN);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(agent);
    data.extend_from_slice(new_key.as_bytes());
    data
}

#[derive(Debug, Default)]
struct RegistryState {
    current: HashMap<AgentId, AgentIdentity>,
    retired: HashMap<AgentId, Vec<AgentIdentity>>,
}

/// Registry of federation agents and their keys.
///
/// Read-mostly: envelope verification resolves keys under the read lock.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    state: RwLock<RegistryState>,
}

impl IdentityRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in an Arc for sharing.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Register an agent.
    ///
    /// Registering the same key again is a no-op.
    ///
    /// # Errors
    ///
    /// [`IdentityError::DuplicateAgent`] if a different key is on file,
    /// [`IdentityError::Revoked`] if the agent was revoked.
    pub fn register(
        &self,
        agent_id: AgentId,
        public_key: PublicKey,
        trust_level: TrustLevel,
        role: AgentRole,
    ) -> IdentityResult<()> {
        self.register_identity(AgentIdentity::new(agent_id, public_key, trust_level, role))
    }

    /// Register a fully built identity record.
    ///
    /// # Errors
    ///
    /// Same as [`IdentityRegistry::register`].
    pub fn register_identity(&self, identity: AgentIdentity) -> IdentityResult<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| IdentityError::Internal(format!("Failed to write identities: {e}")))?;

        if let Some(existing) = state.current.get(&identity.agent_id) {
            if existing.revoked {
                return Err(IdentityError::Revoked(identity.agent_id));
            }
            if existing.public_key == identity.public_key {
                return Ok(());
            }
            warn!(
                agent = %identity.agent_id,
                existing_key = %existing.public_key.key_id_hex(),
                offered_key = %identity.public_key.key_id_hex(),
                "Registration with a different key rejected"
            );
            return Err(IdentityError::DuplicateAgent(identity.agent_id));
        }

        info!(
            agent = %identity.agent_id,
            role = %identity.role,
            trust = %identity.trust_level,
            key = %identity.public_key.key_id_hex(),
            "Agent registered"
        );
        state.current.insert(identity.agent_id.clone(), identity);
        Ok(())
    }

    /// Current record for an agent, revoked or not.
    #[must_use]
    pub fn lookup(&self, agent_id: &AgentId) -> Option<AgentIdentity> {
        let state = self.state.read().ok()?;
        state.current.get(agent_id).cloned()
    }

    /// True if the agent is registered and not revoked.
    #[must_use]
    pub fn is_active(&self, agent_id: &AgentId) -> bool {
        self.lookup(agent_id).is_some_and(|id| !id.revoked)
    }

    /// Revoke an agent. Revoking twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotFound`] if the agent was never registered.
    pub fn revoke(&self, agent_id: &AgentId) -> IdentityResult<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| IdentityError::Internal(format!("Failed to write identities: {e}")))?;
        let identity = state
            .current
            .get_mut(agent_id)
            .ok_or_else(|| IdentityError::NotFound(agent_id.clone()))?;
        if !identity.revoked {
            identity.revoked = true;
            warn!(agent = %agent_id, "Agent revoked");
        }
        Ok(())
    }

    /// Change the trust level of a registered agent.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotFound`] if the agent is not registered.
    pub fn set_trust(&self, agent_id: &AgentId, trust_level: TrustLevel) -> IdentityResult<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| IdentityError::Internal(format!("Failed to write identities: {e}")))?;
        let identity = state
            .current
            .get_mut(agent_id)
            .ok_or_else(|| IdentityError::NotFound(agent_id.clone()))?;
        identity.trust_level = trust_level;
        info!(agent = %agent_id, trust = %trust_level, "Trust level changed");
        Ok(())
    }

    /// Rotate to a new key. `proof` is the current key's signature over
    /// [`rotation_message`]. The old record is kept in the history.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotFound`], [`IdentityError::Revoked`] or
    /// [`IdentityError::InvalidRotationProof`].
    pub fn rotate(
        &self,
        agent_id: &AgentId,
        new_key: PublicKey,
        proof: &Signature,
    ) -> IdentityResult<AgentIdentity> {
        let mut state = self
            .state
            .write()
            .map_err(|e| IdentityError::Internal(format!("Failed to write identities: {e}")))?;
        let current = state
            .current
            .get(agent_id)
            .ok_or_else(|| IdentityError::NotFound(agent_id.clone()))?;
        if current.revoked {
            return Err(IdentityError::Revoked(agent_id.clone()));
        }
        current
            .public_key
            .verify(&rotation_message(agent_id, &new_key), proof)
            .map_err(|_| IdentityError::InvalidRotationProof(agent_id.clone()))?;

        let mut next = current.clone();
        next.public_key = new_key;
        next.registered_at = Timestamp::now();

        if let Some(old) = state.current.insert(agent_id.clone(), next.clone()) {
            info!(
                agent = %agent_id,
                old_key = %old.public_key.key_id_hex(),
                new_key = %new_key.key_id_hex(),
                "Agent key rotated"
            );
            state.retired.entry(agent_id.clone()).or_default().push(old);
        }
        Ok(next)
    }

    /// Superseded records for an agent, oldest first.
    #[must_use]
    pub fn history(&self, agent_id: &AgentId) -> Vec<AgentIdentity> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.retired.get(agent_id).cloned())
            .unwrap_or_default()
    }

    /// Number of current records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().map_or(0, |s| s.current.len())
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyResolver for IdentityRegistry {
    fn resolve_key(&self, agent: &AgentId) -> Option<PublicKey> {
        self.lookup(agent)
            .filter(|id| !id.revoked)
            .map(|id| id.public_key)
    }
}

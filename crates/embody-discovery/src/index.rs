//! Inverted capability index with ranked queries.
//!
//! Tool names map to the bodies exposing them in an ordered map, so exact
//! patterns are a point lookup and `prefix*` patterns are a range scan.
//! The index is updated incrementally on every publish/withdraw; queries
//! never rebuild it and return owned snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use embody_core::{AgentId, BodyId, CapabilityPattern, TrustLevel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::body::BodyDefinition;
use crate::error::{DiscoveryError, DiscoveryResult};

/// Ranking weights.
const WEIGHT_OVERLAP: f64 = 0.4;
const WEIGHT_REPUTATION: f64 = 0.2;
const WEIGHT_LATENCY: f64 = 0.2;
const WEIGHT_LOAD: f64 = 0.2;

/// Latency term for bodies with no samples yet.
const UNKNOWN_LATENCY_SCORE: f64 = 0.5;

/// Smoothing factor of the latency moving average.
const LATENCY_EWMA_ALPHA: f64 = 0.3;

/// Result count when a query does not specify one.
pub const DEFAULT_MAX_RESULTS: usize = 10;

/// A discovery query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryQuery {
    /// Wanted capabilities. Empty matches every body.
    #[serde(default)]
    pub capabilities: Vec<CapabilityPattern>,
    /// Restrict to one environment type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_type: Option<String>,
    /// Minimum host trust.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_trust_level: Option<TrustLevel>,
    /// Result cap; the index default applies when absent or zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

impl DiscoveryQuery {
    /// Query for the given capability patterns.
    #[must_use]
    pub fn for_capabilities<I, P>(patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<CapabilityPattern>,
    {
        Self {
            capabilities: patterns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// A ranked query hit. A snapshot; later index changes do not affect it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredBody {
    /// Body identifier.
    pub body_id: BodyId,
    /// Owning host.
    pub host_agent_id: AgentId,
    /// Human-readable description.
    pub description: String,
    /// Environment tag.
    pub environment_type: String,
    /// Tool names exposed by the body.
    pub tools: Vec<String>,
    /// Trust level of the owning host.
    pub host_trust_level: TrustLevel,
    /// Minimum guest trust.
    pub trust_level_required: TrustLevel,
    /// Concurrency limit.
    pub max_concurrent_guests: u32,
    /// Active sessions when the snapshot was taken.
    pub active_sessions: u32,
    /// Smoothed response latency, if any samples exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    /// Body version.
    pub version: u64,
    /// Ranking score in `[0, 1]`.
    pub score: f64,
}

struct IndexedBody {
    definition: Arc<BodyDefinition>,
    host_trust: TrustLevel,
    registered_seq: u64,
    avg_latency_ms: Option<f64>,
    active_sessions: u32,
}

#[derive(Default)]
struct IndexState {
    bodies: HashMap<BodyId, IndexedBody>,
    by_tool: BTreeMap<String, BTreeSet<BodyId>>,
    next_seq: u64,
}

impl IndexState {
    fn link(&mut self, definition: &BodyDefinition) {
        for tool in definition.tool_names() {
            self.by_tool
                .entry(tool.to_string())
                .or_default()
                .insert(definition.body_id.clone());
        }
    }

    fn unlink(&mut self, definition: &BodyDefinition) {
        for tool in definition.tool_names() {
            if let Some(set) = self.by_tool.get_mut(tool) {
                set.remove(&definition.body_id);
                if set.is_empty() {
                    self.by_tool.remove(tool);
                }
            }
        }
    }

    fn bodies_matching(&self, pattern: &CapabilityPattern) -> HashSet<&BodyId> {
        match pattern {
            CapabilityPattern::Exact(name) => self
                .by_tool
                .get(name)
                .map(|set| set.iter().collect())
                .unwrap_or_default(),
            CapabilityPattern::Prefix(prefix) => self
                .by_tool
                .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
                .take_while(|(tool, _)| tool.starts_with(prefix.as_str()))
                .flat_map(|(_, set)| set.iter())
                .collect(),
        }
    }
}

/// Concurrent capability index. Read-mostly; writers take a short write lock.
pub struct CapabilityIndex {
    state: RwLock<IndexState>,
    default_results: usize,
    max_results: usize,
}

impl Default for CapabilityIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityIndex {
    /// Create an empty index with default result limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_RESULTS, 100)
    }

    /// Create an empty index with explicit result limits.
    #[must_use]
    pub fn with_limits(default_results: usize, max_results: usize) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            default_results: default_results.max(1),
            max_results: max_results.max(1),
        }
    }

    /// Publish or re-publish a body. Returns the stored version.
    ///
    /// Re-publishing keeps latency and load statistics, bumps the version and
    /// counts as a fresh registration for tie-breaking.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidBody`] for unusable definitions and
    /// [`DiscoveryError::NotOwner`] if another host owns the body ID.
    pub fn index(&self, mut body: BodyDefinition, host_trust: TrustLevel) -> DiscoveryResult<u64> {
        body.validate()?;

        let mut state = self
            .state
            .write()
            .map_err(|e| DiscoveryError::Internal(e.to_string()))?;

        let (version, avg_latency_ms, active_sessions) = match state.bodies.get(&body.body_id) {
            Some(existing) => {
                let owner = &existing.definition.host_agent_id;
                if *owner != body.host_agent_id {
                    return Err(DiscoveryError::NotOwner {
                        body_id: body.body_id.clone(),
                        owner: owner.clone(),
                        requester: body.host_agent_id.clone(),
                    });
                }
                (
                    existing.definition.version.saturating_add(1),
                    existing.avg_latency_ms,
                    existing.active_sessions,
                )
            },
            None => (body.version, None, 0),
        };
        body.version = version;

        if let Some(old) = state.bodies.remove(&body.body_id) {
            state.unlink(&old.definition);
        }

        let registered_seq = state.next_seq;
        state.next_seq = state.next_seq.saturating_add(1);
        state.link(&body);

        info!(
            body = %body.body_id,
            host = %body.host_agent_id,
            version,
            tools = body.tools.len(),
            "Body indexed"
        );

        state.bodies.insert(
            body.body_id.clone(),
            IndexedBody {
                definition: Arc::new(body),
                host_trust,
                registered_seq,
                avg_latency_ms,
                active_sessions,
            },
        );
        Ok(version)
    }

    /// Withdraw a body. Returns the removed definition.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Internal`] if the lock is poisoned.
    pub fn unindex(&self, body_id: &BodyId) -> DiscoveryResult<Option<Arc<BodyDefinition>>> {
        let mut state = self
            .state
            .write()
            .map_err(|e| DiscoveryError::Internal(e.to_string()))?;

        let Some(removed) = state.bodies.remove(body_id) else {
            return Ok(None);
        };
        state.unlink(&removed.definition);
        info!(body = %body_id, "Body withdrawn");
        Ok(Some(removed.definition))
    }

    /// Withdraw every body owned by a host. Returns the removed IDs.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Internal`] if the lock is poisoned.
    pub fn unindex_host(&self, host: &AgentId) -> DiscoveryResult<Vec<BodyId>> {
        let mut state = self
            .state
            .write()
            .map_err(|e| DiscoveryError::Internal(e.to_string()))?;

        let owned: Vec<BodyId> = state
            .bodies
            .iter()
            .filter(|(_, b)| b.definition.host_agent_id == *host)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &owned {
            if let Some(removed) = state.bodies.remove(id) {
                state.unlink(&removed.definition);
            }
        }
        if !owned.is_empty() {
            info!(host = %host, count = owned.len(), "Host bodies withdrawn");
        }
        Ok(owned)
    }

    /// Look up a body definition.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Internal`] if the lock is poisoned.
    pub fn get(&self, body_id: &BodyId) -> DiscoveryResult<Option<Arc<BodyDefinition>>> {
        let state = self
            .state
            .read()
            .map_err(|e| DiscoveryError::Internal(e.to_string()))?;
        Ok(state.bodies.get(body_id).map(|b| Arc::clone(&b.definition)))
    }

    /// Fold a response-time sample into the body's moving average.
    /// Returns `false` for unknown bodies.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Internal`] if the lock is poisoned.
    pub fn record_latency(&self, body_id: &BodyId, latency_ms: f64) -> DiscoveryResult<bool> {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return Ok(false);
        }
        let mut state = self
            .state
            .write()
            .map_err(|e| DiscoveryError::Internal(e.to_string()))?;
        let Some(body) = state.bodies.get_mut(body_id) else {
            return Ok(false);
        };
        // Float math on finite, non-negative inputs.
        #[allow(clippy::arithmetic_side_effects)]
        let next = body.avg_latency_ms.map_or(latency_ms, |avg| {
            LATENCY_EWMA_ALPHA * latency_ms + (1.0 - LATENCY_EWMA_ALPHA) * avg
        });
        body.avg_latency_ms = Some(next);
        Ok(true)
    }

    /// Update the active session count used for load ranking.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Internal`] if the lock is poisoned.
    pub fn set_active_sessions(&self, body_id: &BodyId, active: u32) -> DiscoveryResult<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| DiscoveryError::Internal(e.to_string()))?;
        if let Some(body) = state.bodies.get_mut(body_id) {
            body.active_sessions = active;
        }
        Ok(())
    }

    /// Number of indexed bodies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.bodies.len()).unwrap_or(0)
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run a ranked query.
    ///
    /// Score = `0.4·overlap + 0.2·reputation + 0.2·(1 − latency/maxLatency)
    /// + 0.2·(1 − load)`; ties go to the most recently registered body.
    /// Unmeasured bodies get a neutral latency term; a lone measured body
    /// gets the full one.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Internal`] if the lock is poisoned.
    pub fn query(&self, query: &DiscoveryQuery) -> DiscoveryResult<Vec<DiscoveredBody>> {
        let limit = match query.max_results {
            Some(n) if n > 0 => n.min(self.max_results),
            _ => self.default_results,
        };

        let state = self
            .state
            .read()
            .map_err(|e| DiscoveryError::Internal(e.to_string()))?;

        let mut matched: HashMap<&BodyId, usize> = HashMap::new();
        if query.capabilities.is_empty() {
            for id in state.bodies.keys() {
                matched.insert(id, 0);
            }
        } else {
            for pattern in &query.capabilities {
                for id in state.bodies_matching(pattern) {
                    let count = matched.entry(id).or_insert(0);
                    *count = count.saturating_add(1);
                }
            }
        }

        let candidates: Vec<(&IndexedBody, usize)> = matched
            .into_iter()
            .filter_map(|(id, hits)| state.bodies.get(id).map(|b| (b, hits)))
            .filter(|(b, _)| {
                query
                    .environment_type
                    .as_deref()
                    .is_none_or(|env| b.definition.environment_type == env)
            })
            .filter(|(b, _)| query.min_trust_level.is_none_or(|floor| b.host_trust >= floor))
            .collect();

        // With a single measured candidate there is nothing to compare it against.
        let measured: Vec<f64> = candidates
            .iter()
            .filter_map(|(b, _)| b.avg_latency_ms)
            .collect();
        let max_latency =
            (measured.len() > 1).then(|| measured.iter().copied().fold(0.0_f64, f64::max));

        let mut ranked: Vec<(DiscoveredBody, u64)> = candidates
            .into_iter()
            .map(|(b, hits)| {
                let score = score(b, hits, query.capabilities.len(), max_latency);
                (snapshot(b, score), b.registered_seq)
            })
            .collect();

        ranked.sort_by(|(a, a_seq), (b, b_seq)| {
            b.score.total_cmp(&a.score).then_with(|| b_seq.cmp(a_seq))
        });
        ranked.truncate(limit);

        debug!(
            patterns = query.capabilities.len(),
            results = ranked.len(),
            "Discovery query served"
        );

        Ok(ranked.into_iter().map(|(body, _)| body).collect())
    }
}

impl std::fmt::Debug for CapabilityIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityIndex")
            .field("bodies", &self.len())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::arithmetic_side_effects, clippy::cast_precision_loss)]
fn score(body: &IndexedBody, hits: usize, patterns: usize, max_latency: Option<f64>) -> f64 {
    let overlap = if patterns == 0 {
        1.0
    } else {
        (hits as f64 / patterns as f64).min(1.0)
    };

    let latency = match (body.avg_latency_ms, max_latency) {
        (Some(avg), Some(max)) if max > 0.0 => 1.0 - (avg / max).min(1.0),
        (Some(_), _) => 1.0,
        (None, _) => UNKNOWN_LATENCY_SCORE,
    };

    let capacity = f64::from(body.definition.max_concurrent_guests.max(1));
    let load = (f64::from(body.active_sessions) / capacity).min(1.0);

    WEIGHT_OVERLAP * overlap
        + WEIGHT_REPUTATION * body.host_trust.reputation()
        + WEIGHT_LATENCY * latency
        + WEIGHT_LOAD * (1.0 - load)
}

fn snapshot(body: &IndexedBody, score: f64) -> DiscoveredBody {
    let def = &body.definition;
    DiscoveredBody {
        body_id: def.body_id.clone(),
        host_agent_id: def.host_agent_id.clone(),
        description: def.description.clone(),
        environment_type: def.environment_type.clone(),
        tools: def.tool_names().map(String::from).collect(),
        host_trust_level: body.host_trust,
        trust_level_required: def.trust_level_required,
        max_concurrent_guests: def.max_concurrent_guests,
        active_sessions: body.active_sessions,
        avg_latency_ms: body.avg_latency_ms,
        version: def.version,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{ToolKind, ToolSpec};
    use embody_policy::SecurityPolicy;

    fn body(id: &str, host: &str, tools: &[&str]) -> BodyDefinition {
        BodyDefinition {
            body_id: BodyId::new(id),
            host_agent_id: AgentId::new(host),
            description: String::new(),
            environment_type: "linux-container".into(),
            tools: tools
                .iter()
                .map(|t| ToolSpec::new(*t, ToolKind::General))
                .collect(),
            security_policy: SecurityPolicy::default(),
            max_concurrent_guests: 4,
            default_session_duration: 300,
            max_session_duration: 3600,
            trust_level_required: TrustLevel::Basic,
            version: 0,
        }
    }

    fn ids(results: &[DiscoveredBody]) -> Vec<&str> {
        results.iter().map(|b| b.body_id.as_str()).collect()
    }

    #[test]
    fn test_exact_and_prefix_match() {
        let index = CapabilityIndex::new();
        index
            .index(body("a", "h1", &["file.read", "file.write"]), TrustLevel::Basic)
            .unwrap();
        index
            .index(body("b", "h2", &["shell.execute"]), TrustLevel::Basic)
            .unwrap();

        let hits = index
            .query(&DiscoveryQuery::for_capabilities(["file.*"]))
            .unwrap();
        assert_eq!(ids(&hits), vec!["a"]);

        let hits = index
            .query(&DiscoveryQuery::for_capabilities(["shell.execute"]))
            .unwrap();
        assert_eq!(ids(&hits), vec!["b"]);

        let hits = index.query(&DiscoveryQuery::for_capabilities(["*"])).unwrap();
        assert_eq!(hits.len(), 2);

        let hits = index
            .query(&DiscoveryQuery::for_capabilities(["File.read"]))
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_lower_latency_ranks_first() {
        let index = CapabilityIndex::new();
        index.index(body("slow", "h1", &["file.read"]), TrustLevel::Basic).unwrap();
        index.index(body("fast", "h2", &["file.read"]), TrustLevel::Basic).unwrap();

        index.record_latency(&BodyId::new("slow"), 400.0).unwrap();
        index.record_latency(&BodyId::new("fast"), 40.0).unwrap();

        let hits = index
            .query(&DiscoveryQuery::for_capabilities(["file.read"]))
            .unwrap();
        assert_eq!(ids(&hits), vec!["fast", "slow"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_sole_measured_body_beats_unmeasured() {
        let index = CapabilityIndex::new();
        index.index(body("measured", "h1", &["file.read"]), TrustLevel::Basic).unwrap();
        index.index(body("unmeasured", "h2", &["file.read"]), TrustLevel::Basic).unwrap();
        index.record_latency(&BodyId::new("measured"), 250.0).unwrap();

        let hits = index
            .query(&DiscoveryQuery::for_capabilities(["file.read"]))
            .unwrap();
        assert_eq!(ids(&hits), vec!["measured", "unmeasured"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_ties_prefer_most_recent() {
        let index = CapabilityIndex::new();
        index.index(body("old", "h1", &["file.read"]), TrustLevel::Basic).unwrap();
        index.index(body("new", "h2", &["file.read"]), TrustLevel::Basic).unwrap();

        let hits = index
            .query(&DiscoveryQuery::for_capabilities(["file.read"]))
            .unwrap();
        assert_eq!(ids(&hits), vec!["new", "old"]);
    }

    #[test]
    fn test_overlap_and_trust_affect_rank() {
        let index = CapabilityIndex::new();
        index
            .index(body("partial", "h1", &["file.read"]), TrustLevel::Trusted)
            .unwrap();
        index
            .index(body("full", "h2", &["file.read", "shell.execute"]), TrustLevel::Basic)
            .unwrap();

        let hits = index
            .query(&DiscoveryQuery::for_capabilities(["file.read", "shell.execute"]))
            .unwrap();
        // full: 0.4 + 0.08 + 0.1 + 0.2; partial: 0.2 + 0.2 + 0.1 + 0.2
        assert_eq!(ids(&hits), vec!["full", "partial"]);
    }

    #[test]
    fn test_load_penalizes_busy_bodies() {
        let index = CapabilityIndex::new();
        index.index(body("busy", "h1", &["file.read"]), TrustLevel::Basic).unwrap();
        index.index(body("idle", "h2", &["file.read"]), TrustLevel::Basic).unwrap();
        index.set_active_sessions(&BodyId::new("busy"), 4).unwrap();
        // "idle" is the older registration, load alone must put it first.
        index.index(body("busy", "h1", &["file.read"]), TrustLevel::Basic).unwrap();

        let hits = index
            .query(&DiscoveryQuery::for_capabilities(["file.read"]))
            .unwrap();
        assert_eq!(ids(&hits), vec!["idle", "busy"]);
        assert_eq!(hits[1].active_sessions, 4);
    }

    #[test]
    fn test_filters_and_limit() {
        let index = CapabilityIndex::new();
        let mut wasm = body("wasm", "h1", &["file.read"]);
        wasm.environment_type = "wasm".into();
        index.index(wasm, TrustLevel::Verified).unwrap();
        index.index(body("linux", "h2", &["file.read"]), TrustLevel::Untrusted).unwrap();
        index.index(body("linux2", "h3", &["file.read"]), TrustLevel::Basic).unwrap();

        let mut q = DiscoveryQuery::for_capabilities(["file.read"]);
        q.environment_type = Some("wasm".into());
        assert_eq!(ids(&index.query(&q).unwrap()), vec!["wasm"]);

        let mut q = DiscoveryQuery::for_capabilities(["file.read"]);
        q.min_trust_level = Some(TrustLevel::Basic);
        let hits = index.query(&q).unwrap();
        assert!(!ids(&hits).contains(&"linux"));

        let mut q = DiscoveryQuery::for_capabilities(["file.read"]);
        q.max_results = Some(1);
        assert_eq!(index.query(&q).unwrap().len(), 1);
    }

    #[test]
    fn test_reindex_bumps_version_and_updates_tools() {
        let index = CapabilityIndex::new();
        assert_eq!(index.index(body("a", "h1", &["file.read"]), TrustLevel::Basic).unwrap(), 0);
        assert_eq!(index.index(body("a", "h1", &["net.fetch"]), TrustLevel::Basic).unwrap(), 1);

        assert!(index
            .query(&DiscoveryQuery::for_capabilities(["file.read"]))
            .unwrap()
            .is_empty());
        assert_eq!(
            index
                .query(&DiscoveryQuery::for_capabilities(["net.*"]))
                .unwrap()[0]
                .version,
            1
        );
    }

    #[test]
    fn test_only_owner_may_republish() {
        let index = CapabilityIndex::new();
        index.index(body("a", "h1", &["file.read"]), TrustLevel::Basic).unwrap();
        let err = index
            .index(body("a", "intruder", &["file.read"]), TrustLevel::Basic)
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::NotOwner { .. }));
    }

    #[test]
    fn test_unindex_and_unindex_host() {
        let index = CapabilityIndex::new();
        index.index(body("a", "h1", &["file.read"]), TrustLevel::Basic).unwrap();
        index.index(body("b", "h1", &["file.write"]), TrustLevel::Basic).unwrap();
        index.index(body("c", "h2", &["file.read"]), TrustLevel::Basic).unwrap();

        assert!(index.unindex(&BodyId::new("c")).unwrap().is_some());
        assert!(index.unindex(&BodyId::new("c")).unwrap().is_none());

        let mut removed = index.unindex_host(&AgentId::new("h1")).unwrap();
        removed.sort();
        assert_eq!(removed, vec![BodyId::new("a"), BodyId::new("b")]);
        assert!(index.is_empty());
        assert!(index.query(&DiscoveryQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn test_latency_moving_average() {
        let index = CapabilityIndex::new();
        index.index(body("a", "h1", &["file.read"]), TrustLevel::Basic).unwrap();
        let id = BodyId::new("a");
        index.record_latency(&id, 100.0).unwrap();
        index.record_latency(&id, 200.0).unwrap();
        let hits = index.query(&DiscoveryQuery::default()).unwrap();
        let avg = hits[0].avg_latency_ms.unwrap();
        assert!((avg - 130.0).abs() < 1e-9);

        assert!(!index.record_latency(&BodyId::new("missing"), 1.0).unwrap());
        assert!(!index.record_latency(&id, f64::NAN).unwrap());
    }
}

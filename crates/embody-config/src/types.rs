//! Configuration types for the Embody broker.
//!
//! The types here have no dependencies on other Embody crates; the broker
//! converts them into domain types at startup. Every section implements
//! [`Default`] with the same values as the embedded `defaults.toml`, so a
//! bare `[section]` header yields a working configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker identity.
    pub service: ServiceSection,
    /// Envelope verification.
    pub protocol: ProtocolSection,
    /// Session lifecycle.
    pub sessions: SessionsSection,
    /// Discovery result limits.
    pub discovery: DiscoverySection,
    /// Audit log backend.
    pub audit: AuditSection,
    /// Logging output.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// ServiceSection
// ---------------------------------------------------------------------------

/// Who the broker is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Agent ID the broker signs with.
    pub agent_id: String,
    /// Human-readable name announced in `registerBroker`.
    pub display_name: String,
    /// Ed25519 secret key file. Generated on first start when missing;
    /// an ephemeral key is used when unset.
    pub key_path: Option<PathBuf>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            agent_id: "embody-broker".to_owned(),
            display_name: "Embody broker".to_owned(),
            key_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ProtocolSection
// ---------------------------------------------------------------------------

/// Envelope acceptance limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSection {
    /// Largest accepted distance between envelope and receipt time.
    pub clock_skew_ms: u64,
    /// How long a nonce is remembered.
    pub replay_window_ms: u64,
    /// Nonces remembered before the oldest are evicted.
    pub replay_capacity: usize,
    /// Largest accepted encoded envelope.
    pub max_envelope_bytes: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            clock_skew_ms: 300_000,
            replay_window_ms: 600_000,
            replay_capacity: 100_000,
            max_envelope_bytes: 1_048_576,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionsSection
// ---------------------------------------------------------------------------

/// Session manager tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    /// Violations tolerated before the next one revokes.
    pub violation_threshold: u32,
    /// Sweep period.
    pub sweep_interval_secs: u64,
    /// How long unresolved requests are remembered.
    pub pending_ttl_secs: u64,
    /// How long ended sessions stay queryable.
    pub retention_secs: u64,
    /// Alternatives offered with a denial.
    pub max_alternatives: usize,
}

impl SessionsSection {
    /// Sweep period as a [`Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            violation_threshold: 5,
            sweep_interval_secs: 30,
            pending_ttl_secs: 300,
            retention_secs: 3600,
            max_alternatives: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// DiscoverySection
// ---------------------------------------------------------------------------

/// Discovery result limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Results returned when a query gives no `maxResults`.
    pub default_results: usize,
    /// Upper bound on `maxResults`.
    pub max_results: usize,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            default_results: 10,
            max_results: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// AuditSection
// ---------------------------------------------------------------------------

/// Where audit entries go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackend {
    /// Process memory; lost on exit.
    #[default]
    Memory,
    /// Append-only JSON-lines file.
    Jsonl,
}

/// Audit log configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    /// Storage backend.
    pub backend: AuditBackend,
    /// File for the `jsonl` backend.
    pub path: Option<PathBuf>,
    /// Longest parameter string kept verbatim, in bytes.
    pub preview_len: usize,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            backend: AuditBackend::Memory,
            path: None,
            preview_len: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"` or `"full"`.
    pub format: String,
    /// Output target: `"stdout"`, `"stderr"` or `"file"`.
    pub target: String,
    /// Directory for the `file` target.
    pub directory: Option<PathBuf>,
    /// Per-crate tracing directives (e.g. `["embody_session=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            target: "stderr".to_owned(),
            directory: None,
            directives: Vec::new(),
        }
    }
}

//! Audit log - main interface for audit logging.
//!
//! Provides a high-level API for recording and verifying audit entries.

use std::path::Path;
use std::sync::Mutex;

use embody_core::AgentId;
use embody_crypto::{ContentHash, KeyPair, PublicKey};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::entry::{AuditAction, AuditEntry, AuditEntryId, AuditOutcome, AuditRecord};
use crate::error::{AuditError, AuditResult};
use crate::sanitize::Sanitizer;
use crate::storage::{AuditStorage, JsonlAuditStorage, MemoryAuditStorage};

#[derive(Debug, Clone, Copy)]
struct ChainHead {
    sequence: u64,
    hash: ContentHash,
}

/// Audit log for recording and verifying security events.
///
/// All entries form one chain. Appends are serialized so sequence numbers
/// and previous-hash links are assigned without gaps.
pub struct AuditLog {
    /// Storage backend.
    storage: Box<dyn AuditStorage>,
    /// Service signing key.
    service_key: KeyPair,
    /// Cached chain head; `None` until the first append or lookup.
    head: Mutex<Option<ChainHead>>,
    sanitizer: Sanitizer,
}

impl AuditLog {
    /// Create a new audit log with a custom storage backend.
    #[must_use]
    pub fn with_storage(storage: Box<dyn AuditStorage>, service_key: KeyPair) -> Self {
        Self {
            storage,
            service_key,
            head: Mutex::new(None),
            sanitizer: Sanitizer::default(),
        }
    }

    /// Create a new audit log backed by a JSON-lines file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or an existing line is corrupt.
    pub fn open(path: impl AsRef<Path>, service_key: KeyPair) -> AuditResult<Self> {
        let storage = JsonlAuditStorage::open(path)?;
        Ok(Self::with_storage(Box::new(storage), service_key))
    }

    /// Create an in-memory audit log (for testing).
    #[must_use]
    pub fn in_memory(service_key: KeyPair) -> Self {
        Self::with_storage(Box::new(MemoryAuditStorage::new()), service_key)
    }

    /// Replace the parameter sanitizer.
    #[must_use]
    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Start building an entry.
    #[must_use]
    pub fn record(&self, actor_id: AgentId, action: AuditAction) -> AuditBuilder<'_> {
        AuditBuilder::new(self, actor_id, action)
    }

    /// Append a new audit entry. Parameters are sanitized first.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be stored. The chain head is only
    /// advanced once the storage accepted the entry.
    pub fn append(&self, mut record: AuditRecord) -> AuditResult<AuditEntryId> {
        record.parameters = self.sanitizer.sanitize(&record.parameters);

        let mut head = self
            .head
            .lock()
            .map_err(|e| AuditError::StorageError(e.to_string()))?;

        let previous = match *head {
            Some(h) => Some(h),
            None => self.storage.last()?.map(|e| ChainHead {
                sequence: e.sequence,
                hash: e.content_hash(),
            }),
        };
        let (sequence, previous_hash) = match previous {
            Some(h) => (h.sequence.saturating_add(1), h.hash),
            None => (0, ContentHash::zero()),
        };

        let entry = AuditEntry::create(record, sequence, previous_hash, &self.service_key);
        let entry_id = entry.id;

        debug!(
            entry_id = %entry_id,
            sequence,
            action = %entry.action.description(),
            "Appending audit entry"
        );

        if let Err(e) = self.storage.store(&entry) {
            error!(entry_id = %entry_id, error = %e, "Audit append failed");
            return Err(e);
        }

        *head = Some(ChainHead {
            sequence,
            hash: entry.content_hash(),
        });
        Ok(entry_id)
    }

    /// Get an entry by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails to retrieve the entry.
    pub fn get(&self, id: &AuditEntryId) -> AuditResult<Option<AuditEntry>> {
        self.storage.get(id)
    }

    /// All entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn entries(&self) -> AuditResult<Vec<AuditEntry>> {
        self.storage.entries()
    }

    /// Get all entries for a session reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails to retrieve entries.
    pub fn session_entries(&self, session_ref: &str) -> AuditResult<Vec<AuditEntry>> {
        self.storage.session_entries(session_ref)
    }

    /// Verify the integrity of the whole chain: genesis, sequence
    /// continuity, hash links, signatures and the signing key.
    ///
    /// # Errors
    ///
    /// Returns an error if entries cannot be retrieved from storage.
    pub fn verify_chain(&self) -> AuditResult<ChainVerificationResult> {
        let mut entries = self.storage.entries()?;
        if entries.is_empty() {
            return Ok(ChainVerificationResult {
                valid: true,
                entries_verified: 0,
                issues: Vec::new(),
            });
        }

        let expected_key = self.service_key.export_public_key();
        let mut issues = Vec::new();
        let mut entries_verified: usize = 0;

        entries.sort_by_key(|e| e.sequence);

        if let Some(first) = entries.first()
            && (first.sequence != 0 || !first.previous_hash.is_zero())
        {
            issues.push(ChainIssue::InvalidGenesis { entry_id: first.id });
        }

        for entry in &entries {
            if entry.service_key != expected_key {
                issues.push(ChainIssue::UnexpectedSigner {
                    entry_id: entry.id,
                    key: entry.service_key,
                });
            }
            if let Err(e) = entry.verify_signature() {
                error!(entry_id = %entry.id, error = %e, "Invalid signature");
                issues.push(ChainIssue::InvalidSignature { entry_id: entry.id });
            }
            entries_verified = entries_verified.saturating_add(1);
        }

        for pair in entries.windows(2) {
            let [prev, curr] = pair else { continue };
            if !curr.follows(prev) {
                warn!(
                    current = %curr.id,
                    previous = %prev.id,
                    "Chain link broken"
                );
                issues.push(ChainIssue::BrokenLink {
                    entry_id: curr.id,
                    expected_previous: prev.content_hash(),
                    actual_previous: curr.previous_hash,
                });
            }
        }

        Ok(ChainVerificationResult {
            valid: issues.is_empty(),
            entries_verified,
            issues,
        })
    }

    /// Count total entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn count(&self) -> AuditResult<usize> {
        self.storage.count()
    }

    /// Count entries for a session reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn count_session(&self, session_ref: &str) -> AuditResult<usize> {
        self.storage.count_session(session_ref)
    }

    /// List all session references.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn list_sessions(&self) -> AuditResult<Vec<String>> {
        self.storage.list_sessions()
    }

    /// Flush pending writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails to flush.
    pub fn flush(&self) -> AuditResult<()> {
        self.storage.flush()
    }

    /// Get the service public key.
    #[must_use]
    pub fn service_public_key(&self) -> PublicKey {
        self.service_key.export_public_key()
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("service_key_id", &self.service_key.key_id_hex())
            .field("sanitizer", &self.sanitizer)
            .finish_non_exhaustive()
    }
}

/// Result of chain verification.
#[derive(Debug, Clone)]
pub struct ChainVerificationResult {
    /// Whether the chain is valid.
    pub valid: bool,
    /// Number of entries verified.
    pub entries_verified: usize,
    /// Issues found (empty if valid).
    pub issues: Vec<ChainIssue>,
}

/// An issue found during chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainIssue {
    /// First entry is not sequence 0 with a zero previous hash.
    InvalidGenesis {
        /// The entry with invalid genesis.
        entry_id: AuditEntryId,
    },
    /// Entry has invalid signature.
    InvalidSignature {
        /// The entry with invalid signature.
        entry_id: AuditEntryId,
    },
    /// Entry was signed by a key other than this log's service key.
    UnexpectedSigner {
        /// The entry.
        entry_id: AuditEntryId,
        /// Key found on the entry.
        key: PublicKey,
    },
    /// Chain link or sequence is broken.
    BrokenLink {
        /// The entry with broken link.
        entry_id: AuditEntryId,
        /// Expected previous hash.
        expected_previous: ContentHash,
        /// Actual previous hash in entry.
        actual_previous: ContentHash,
    },
}

impl std::fmt::Display for ChainIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidGenesis { entry_id } => {
                write!(f, "Invalid genesis at {entry_id}")
            },
            Self::InvalidSignature { entry_id } => {
                write!(f, "Invalid signature at {entry_id}")
            },
            Self::UnexpectedSigner { entry_id, key } => {
                write!(f, "Unexpected signer {} at {entry_id}", key.key_id_hex())
            },
            Self::BrokenLink { entry_id, .. } => {
                write!(f, "Broken chain link at {entry_id}")
            },
        }
    }
}

/// Builder for audit entries with fluent API.
pub struct AuditBuilder<'a> {
    log: &'a AuditLog,
    record: AuditRecord,
}

impl<'a> AuditBuilder<'a> {
    /// Create a new audit builder.
    pub fn new(log: &'a AuditLog, actor_id: AgentId, action: AuditAction) -> Self {
        Self {
            log,
            record: AuditRecord::new(actor_id, action, AuditOutcome::allowed()),
        }
    }

    /// Attach a session reference.
    #[must_use]
    pub fn session(mut self, session_ref: impl Into<String>) -> Self {
        self.record.session_ref = Some(session_ref.into());
        self
    }

    /// Attach parameters (sanitized on append).
    #[must_use]
    pub fn parameters(mut self, parameters: Value) -> Self {
        self.record.parameters = parameters;
        self
    }

    /// Attach a violation category.
    #[must_use]
    pub fn violation(mut self, violation_type: impl Into<String>) -> Self {
        self.record.violation_type = Some(violation_type.into());
        self
    }

    /// Record an allowed outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit entry cannot be appended.
    pub fn allowed(self) -> AuditResult<AuditEntryId> {
        self.outcome(AuditOutcome::allowed())
    }

    /// Record a denial.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit entry cannot be appended.
    pub fn denied(
        self,
        code: impl Into<String>,
        reason: impl Into<String>,
    ) -> AuditResult<AuditEntryId> {
        self.outcome(AuditOutcome::denied(code, reason))
    }

    /// Record a failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit entry cannot be appended.
    pub fn failed(self, error: impl Into<String>) -> AuditResult<AuditEntryId> {
        self.outcome(AuditOutcome::failed(error))
    }

    /// Record an explicit outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit entry cannot be appended.
    pub fn outcome(mut self, outcome: AuditOutcome) -> AuditResult<AuditEntryId> {
        self.record.outcome = outcome;
        self.log.append(self.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::REDACTED;
    use embody_core::{AgentRole, BodyId};
    use serde_json::json;

    fn tool(name: &str) -> AuditAction {
        AuditAction::ToolCall { tool: name.into() }
    }

    #[test]
    fn test_append_and_retrieve() {
        let log = AuditLog::in_memory(KeyPair::generate());
        let entry_id = log
            .record(
                AgentId::new("host"),
                AuditAction::AgentRegistered {
                    role: AgentRole::Host,
                },
            )
            .allowed()
            .unwrap();

        let entry = log.get(&entry_id).unwrap().unwrap();
        assert_eq!(entry.id, entry_id);
        assert_eq!(entry.sequence, 0);
        assert!(entry.previous_hash.is_zero());
    }

    #[test]
    fn test_chain_verification() {
        let log = AuditLog::in_memory(KeyPair::generate());
        for i in 0..5 {
            log.record(AgentId::new("guest"), tool(&format!("tool_{i}")))
                .session("sess_abcd1234")
                .allowed()
                .unwrap();
        }

        let result = log.verify_chain().unwrap();
        assert!(result.valid, "{:?}", result.issues);
        assert_eq!(result.entries_verified, 5);
        assert_eq!(log.count_session("sess_abcd1234").unwrap(), 5);
    }

    #[test]
    fn test_parameters_are_sanitized() {
        let log = AuditLog::in_memory(KeyPair::generate());
        let id = log
            .record(AgentId::new("guest"), tool("http.get"))
            .parameters(json!({"url": "https://x", "apiToken": "s3cr3t"}))
            .allowed()
            .unwrap();
        let entry = log.get(&id).unwrap().unwrap();
        assert_eq!(entry.parameters["apiToken"], REDACTED);
        assert_eq!(entry.parameters["url"], "https://x");
    }

    #[test]
    fn test_chain_continues_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let key_bytes = {
            let key = KeyPair::generate();
            let bytes = *key.secret_key_bytes();
            let log = AuditLog::open(&path, key).unwrap();
            log.record(
                AgentId::new("host"),
                AuditAction::BodyPublished {
                    body_id: BodyId::new("dev-box"),
                    version: 1,
                },
            )
            .allowed()
            .unwrap();
            log.flush().unwrap();
            bytes
        };

        let log = AuditLog::open(&path, KeyPair::from_secret_key(&key_bytes).unwrap()).unwrap();
        let id = log
            .record(
                AgentId::new("host"),
                AuditAction::BodyWithdrawn {
                    body_id: BodyId::new("dev-box"),
                },
            )
            .allowed()
            .unwrap();
        assert_eq!(log.get(&id).unwrap().unwrap().sequence, 1);
        assert!(log.verify_chain().unwrap().valid);
    }

    #[test]
    fn test_foreign_signer_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(&path, KeyPair::generate()).unwrap();
            log.record(AgentId::new("guest"), tool("file.read"))
                .allowed()
                .unwrap();
        }
        let log = AuditLog::open(&path, KeyPair::generate()).unwrap();
        let result = log.verify_chain().unwrap();
        assert!(!result.valid);
        assert!(matches!(
            result.issues[0],
            ChainIssue::UnexpectedSigner { .. }
        ));
    }

    struct BrokenStorage;

    impl AuditStorage for BrokenStorage {
        fn store(&self, _entry: &AuditEntry) -> AuditResult<()> {
            Err(AuditError::StorageError("disk full".into()))
        }
        fn get(&self, _id: &AuditEntryId) -> AuditResult<Option<AuditEntry>> {
            Ok(None)
        }
        fn last(&self) -> AuditResult<Option<AuditEntry>> {
            Ok(None)
        }
        fn entries(&self) -> AuditResult<Vec<AuditEntry>> {
            Ok(Vec::new())
        }
        fn session_entries(&self, _session_ref: &str) -> AuditResult<Vec<AuditEntry>> {
            Ok(Vec::new())
        }
        fn count(&self) -> AuditResult<usize> {
            Ok(0)
        }
        fn list_sessions(&self) -> AuditResult<Vec<String>> {
            Ok(Vec::new())
        }
        fn flush(&self) -> AuditResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_storage_failure_is_returned() {
        let log = AuditLog::with_storage(Box::new(BrokenStorage), KeyPair::generate());
        let err = log
            .record(AgentId::new("guest"), tool("file.read"))
            .allowed()
            .unwrap_err();
        assert!(matches!(err, AuditError::StorageError(_)));
    }
}

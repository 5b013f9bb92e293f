//! Audit log storage trait plus in-memory and JSON-lines implementations.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::entry::{AuditEntry, AuditEntryId};
use crate::error::{AuditError, AuditResult};

/// Storage backend for audit logs.
///
/// Implementations must be thread-safe and append-only: entries are never
/// updated or removed once stored.
pub trait AuditStorage: Send + Sync {
    /// Store an audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be persisted.
    fn store(&self, entry: &AuditEntry) -> AuditResult<()>;

    /// Get an entry by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, id: &AuditEntryId) -> AuditResult<Option<AuditEntry>>;

    /// The most recently stored entry (chain head).
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn last(&self) -> AuditResult<Option<AuditEntry>>;

    /// All entries in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn entries(&self) -> AuditResult<Vec<AuditEntry>>;

    /// Entries for one session reference, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn session_entries(&self, session_ref: &str) -> AuditResult<Vec<AuditEntry>>;

    /// Count total entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn count(&self) -> AuditResult<usize>;

    /// Count entries for a session reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn count_session(&self, session_ref: &str) -> AuditResult<usize> {
        Ok(self.session_entries(session_ref)?.len())
    }

    /// All session references seen, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn list_sessions(&self) -> AuditResult<Vec<String>>;

    /// Flush pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails to flush.
    fn flush(&self) -> AuditResult<()>;
}

#[derive(Debug, Default)]
struct EntryTable {
    entries: Vec<AuditEntry>,
    by_id: HashMap<AuditEntryId, usize>,
    by_session: HashMap<String, Vec<usize>>,
}

impl EntryTable {
    fn push(&mut self, entry: AuditEntry) {
        let index = self.entries.len();
        self.by_id.insert(entry.id, index);
        if let Some(session) = &entry.session_ref {
            self.by_session.entry(session.clone()).or_default().push(index);
        }
        self.entries.push(entry);
    }

    fn session_entries(&self, session_ref: &str) -> Vec<AuditEntry> {
        self.by_session
            .get(session_ref)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|i| self.entries.get(*i).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn sessions(&self) -> Vec<String> {
        self.by_session
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// In-memory storage, for tests and ephemeral brokers.
#[derive(Debug, Default)]
pub struct MemoryAuditStorage {
    table: RwLock<EntryTable>,
}

impl MemoryAuditStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> AuditResult<std::sync::RwLockReadGuard<'_, EntryTable>> {
        self.table
            .read()
            .map_err(|e| AuditError::StorageError(e.to_string()))
    }
}

impl AuditStorage for MemoryAuditStorage {
    fn store(&self, entry: &AuditEntry) -> AuditResult<()> {
        self.table
            .write()
            .map_err(|e| AuditError::StorageError(e.to_string()))?
            .push(entry.clone());
        Ok(())
    }

    fn get(&self, id: &AuditEntryId) -> AuditResult<Option<AuditEntry>> {
        let table = self.read()?;
        Ok(table
            .by_id
            .get(id)
            .and_then(|i| table.entries.get(*i))
            .cloned())
    }

    fn last(&self) -> AuditResult<Option<AuditEntry>> {
        Ok(self.read()?.entries.last().cloned())
    }

    fn entries(&self) -> AuditResult<Vec<AuditEntry>> {
        Ok(self.read()?.entries.clone())
    }

    fn session_entries(&self, session_ref: &str) -> AuditResult<Vec<AuditEntry>> {
        Ok(self.read()?.session_entries(session_ref))
    }

    fn count(&self) -> AuditResult<usize> {
        Ok(self.read()?.entries.len())
    }

    fn count_session(&self, session_ref: &str) -> AuditResult<usize> {
        Ok(self
            .read()?
            .by_session
            .get(session_ref)
            .map_or(0, Vec::len))
    }

    fn list_sessions(&self) -> AuditResult<Vec<String>> {
        Ok(self.read()?.sessions())
    }

    fn flush(&self) -> AuditResult<()> {
        Ok(())
    }
}

/// Append-only JSON-lines file, one entry per line.
///
/// Existing entries are loaded on open so queries never touch the disk.
/// Each store writes one full line; [`AuditStorage::flush`] fsyncs.
pub struct JsonlAuditStorage {
    path: PathBuf,
    file: Mutex<File>,
    table: RwLock<EntryTable>,
}

impl JsonlAuditStorage {
    /// Open or create a log file.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::StorageError`] if the file cannot be opened and
    /// [`AuditError::CorruptLog`] if an existing line does not decode.
    pub fn open(path: impl AsRef<Path>) -> AuditResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                AuditError::StorageError(format!("create {}: {e}", parent.display()))
            })?;
        }

        let mut table = EntryTable::default();
        if path.exists() {
            let reader = File::open(&path)
                .map(BufReader::new)
                .map_err(|e| AuditError::StorageError(format!("open {}: {e}", path.display())))?;
            for (index, line) in reader.lines().enumerate() {
                let line_no = index.saturating_add(1);
                let line = line.map_err(|e| AuditError::StorageError(e.to_string()))?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: AuditEntry =
                    serde_json::from_str(&line).map_err(|e| AuditError::CorruptLog {
                        line: line_no,
                        reason: e.to_string(),
                    })?;
                table.push(entry);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AuditError::StorageError(format!("open {}: {e}", path.display())))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            table: RwLock::new(table),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> AuditResult<std::sync::RwLockReadGuard<'_, EntryTable>> {
        self.table
            .read()
            .map_err(|e| AuditError::StorageError(e.to_string()))
    }
}

impl AuditStorage for JsonlAuditStorage {
    fn store(&self, entry: &AuditEntry) -> AuditResult<()> {
        let mut line =
            serde_json::to_vec(entry).map_err(|e| AuditError::SerializationError(e.to_string()))?;
        line.push(b'\n');

        {
            let mut file = self
                .file
                .lock()
                .map_err(|e| AuditError::StorageError(e.to_string()))?;
            file.write_all(&line)
                .map_err(|e| AuditError::StorageError(format!("append: {e}")))?;
        }

        self.table
            .write()
            .map_err(|e| AuditError::StorageError(e.to_string()))?
            .push(entry.clone());
        Ok(())
    }

    fn get(&self, id: &AuditEntryId) -> AuditResult<Option<AuditEntry>> {
        let table = self.read()?;
        Ok(table
            .by_id
            .get(id)
            .and_then(|i| table.entries.get(*i))
            .cloned())
    }

    fn last(&self) -> AuditResult<Option<AuditEntry>> {
        Ok(self.read()?.entries.last().cloned())
    }

    fn entries(&self) -> AuditResult<Vec<AuditEntry>> {
        Ok(self.read()?.entries.clone())
    }

    fn session_entries(&self, session_ref: &str) -> AuditResult<Vec<AuditEntry>> {
        Ok(self.read()?.session_entries(session_ref))
    }

    fn count(&self) -> AuditResult<usize> {
        Ok(self.read()?.entries.len())
    }

    fn list_sessions(&self) -> AuditResult<Vec<String>> {
        Ok(self.read()?.sessions())
    }

    fn flush(&self) -> AuditResult<()> {
        let file = self
            .file
            .lock()
            .map_err(|e| AuditError::StorageError(e.to_string()))?;
        file.sync_data()
            .map_err(|e| AuditError::StorageError(format!("fsync: {e}")))
    }
}

impl std::fmt::Debug for JsonlAuditStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlAuditStorage")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AuditAction, AuditOutcome, AuditRecord};
    use embody_core::AgentId;
    use embody_crypto::{ContentHash, KeyPair};

    fn entry(key: &KeyPair, seq: u64, session: Option<&str>) -> AuditEntry {
        let mut record = AuditRecord::new(
            AgentId::new("guest"),
            AuditAction::ToolCall {
                tool: "file.read".into(),
            },
            AuditOutcome::allowed(),
        );
        record.session_ref = session.map(str::to_string);
        AuditEntry::create(record, seq, ContentHash::zero(), key)
    }

    #[test]
    fn test_memory_queries() {
        let key = KeyPair::generate();
        let storage = MemoryAuditStorage::new();
        let a = entry(&key, 0, Some("sess_b"));
        let b = entry(&key, 1, Some("sess_a"));
        let c = entry(&key, 2, None);
        for e in [&a, &b, &c] {
            storage.store(e).unwrap();
        }

        assert_eq!(storage.count().unwrap(), 3);
        assert_eq!(storage.count_session("sess_a").unwrap(), 1);
        assert_eq!(storage.list_sessions().unwrap(), vec!["sess_a", "sess_b"]);
        assert_eq!(storage.get(&b.id).unwrap(), Some(b));
        assert_eq!(storage.last().unwrap(), Some(c));
        assert!(storage.get(&AuditEntryId::new()).unwrap().is_none());
    }

    #[test]
    fn test_jsonl_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("log.jsonl");
        let key = KeyPair::generate();
        let first = entry(&key, 0, Some("sess_x"));
        let second = entry(&key, 1, Some("sess_x"));

        {
            let storage = JsonlAuditStorage::open(&path).unwrap();
            storage.store(&first).unwrap();
            storage.store(&second).unwrap();
            storage.flush().unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        let reopened = JsonlAuditStorage::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 2);
        assert_eq!(reopened.session_entries("sess_x").unwrap(), vec![first, second]);
    }

    #[test]
    fn test_jsonl_rejects_corrupt_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let key = KeyPair::generate();
        let good = serde_json::to_string(&entry(&key, 0, None)).unwrap();
        std::fs::write(&path, format!("{good}\n{{not json\n")).unwrap();

        assert!(matches!(
            JsonlAuditStorage::open(&path),
            Err(AuditError::CorruptLog { line: 2, .. })
        ));
    }
}

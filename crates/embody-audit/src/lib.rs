//! Embody Audit - Chain-linked, signed audit logging.
//!
//! This crate provides:
//! - Signed audit entries for registrations, grants, denials, tool calls
//!   and session endings
//! - A single hash chain with sequence numbers (each entry carries the hash
//!   of its predecessor)
//! - Parameter sanitization (secret redaction, string truncation)
//! - In-memory and append-only JSON-lines storage
//! - Chain integrity verification
//!
//! # Security Model
//!
//! Every audit entry is:
//! - Signed by the service's ed25519 key
//! - Linked to the previous entry via content hash
//! - Timestamped and sequenced
//! - Indexed by truncated session reference, never the raw token
//!
//! Appends that fail are reported to the caller; callers on the action path
//! deny the action rather than proceed unaudited.
//!
//! # Example
//!
//! ```
//! use embody_audit::{AuditAction, AuditLog};
//! use embody_core::AgentId;
//! use embody_crypto::KeyPair;
//! use serde_json::json;
//!
//! let log = AuditLog::in_memory(KeyPair::generate());
//! log.record(AgentId::new("guest-1"), AuditAction::ToolCall { tool: "file.read".into() })
//!     .session("sess_1a2b3c4d")
//!     .parameters(json!({"path": "/workspace/README.md"}))
//!     .allowed()
//!     .unwrap();
//!
//! assert!(log.verify_chain().unwrap().valid);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod entry;
mod error;
mod log;
mod sanitize;
mod storage;

pub use entry::{AuditAction, AuditEntry, AuditEntryId, AuditOutcome, AuditRecord};
pub use error::{AuditError, AuditResult};
pub use log::{AuditBuilder, AuditLog, ChainIssue, ChainVerificationResult};
pub use sanitize::{DEFAULT_PREVIEW_LEN, REDACTED, Sanitizer, sanitize_parameters};
pub use storage::{AuditStorage, JsonlAuditStorage, MemoryAuditStorage};

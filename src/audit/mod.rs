//! Tamper-evident audit logging
//!
//! This module handles:
//! - Append-only JSONL storage with SHA-256 hash chaining
//! - Chain recovery across process restarts
//! - Full-chain verification and tail inspection

mod kernel;

pub use kernel::{AuditLog, AuditRecord, GENESIS_HASH};

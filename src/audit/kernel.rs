//! Append-only audit log with SHA-256 hash chaining
//!
//! Every record is framed as one JSON line:
//! ```text
//! {"timestamp": ..., "kind": ..., "payload": ..., "hash": ..., "prev_hash": ...}
//! ```
//! with `hash = SHA-256(prev_hash || canonical({timestamp, kind, payload}))`.
//! The canonical form serializes object keys in sorted order, so `verify`
//! can recompute every hash byte-for-byte from the stored lines.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{CommandRequest, CommandResult};
use crate::telemetry::TelemetryBus;

/// Chain root: the all-zero hash every log starts from
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One record of the audit chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub kind: String,
    pub payload: Value,
    pub hash: String,
    pub prev_hash: String,
}

/// Append-only, hash-chained record store
///
/// The chain pointer and the backing file are mutated only inside the
/// kernel's own critical section; appends are strictly sequential even
/// under concurrent callers.
pub struct AuditLog {
    path: PathBuf,
    bus: TelemetryBus,
    /// Hash of the most recent record, guarded as the chain-wide critical section
    prev_hash: Mutex<String>,
}

impl AuditLog {
    /// Open a log at `path`, recovering the chain pointer from the last
    /// stored line (genesis if the file is missing or empty)
    pub async fn open(path: impl Into<PathBuf>, bus: TelemetryBus) -> Result<Self> {
        let path = path.into();
        let prev_hash = read_last_hash(&path).await?;
        Ok(Self {
            path,
            bus,
            prev_hash: Mutex::new(prev_hash),
        })
    }

    /// Create storage and reset the chain pointer if no log exists yet
    pub async fn bootstrap(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut prev_hash = self.prev_hash.lock().await;
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }
        tokio::fs::write(&self.path, b"").await?;
        *prev_hash = GENESIS_HASH.to_string();
        debug!(path = %self.path.display(), "audit log created");
        Ok(())
    }

    /// Append one record to the chain
    pub async fn append(&self, kind: &str, payload: Value) -> Result<AuditRecord> {
        let record = {
            let mut prev_hash = self.prev_hash.lock().await;
            let timestamp = Utc::now().to_rfc3339();
            let hash = chain_hash(&prev_hash, &timestamp, kind, &payload)?;
            let record = AuditRecord {
                timestamp,
                kind: kind.to_string(),
                payload,
                hash: hash.clone(),
                prev_hash: prev_hash.clone(),
            };

            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;

            // Advance the pointer only after the line is durably queued;
            // a failed write must not orphan the chain.
            *prev_hash = hash;
            record
        };

        self.bus.emit(
            "audit.record_appended",
            json!({
                "kind": &record.kind,
                "hash": &record.hash,
                "prev_hash": &record.prev_hash,
            }),
        );
        Ok(record)
    }

    /// Record a submitted command request
    pub async fn record_command_request(&self, request: &CommandRequest) -> Result<AuditRecord> {
        self.append("command_request", serde_json::to_value(request)?)
            .await
    }

    /// Record one per-device command outcome
    pub async fn record_command_result(&self, result: &CommandResult) -> Result<AuditRecord> {
        self.append("command_result", serde_json::to_value(result)?)
            .await
    }

    /// Return the most recent `limit` records
    pub async fn tail(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let records = self.read_all().await?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }

    /// Number of records currently stored
    pub async fn record_count(&self) -> Result<usize> {
        Ok(self.read_all().await?.len())
    }

    /// Replay the chain from genesis; false at the first mismatch
    ///
    /// An empty (or missing) log is trivially valid. A broken chain is
    /// only reported, never repaired.
    pub async fn verify(&self) -> Result<bool> {
        let mut prev_hash = GENESIS_HASH.to_string();
        for record in self.read_all().await? {
            let expected = chain_hash(&prev_hash, &record.timestamp, &record.kind, &record.payload)?;
            if expected != record.hash || record.prev_hash != prev_hash {
                return Ok(false);
            }
            prev_hash = record.hash;
        }
        Ok(true)
    }

    async fn read_all(&self) -> Result<Vec<AuditRecord>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let mut records = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }
}

/// Compute `SHA-256(prev_hash || canonical record)` as lowercase hex
fn chain_hash(prev_hash: &str, timestamp: &str, kind: &str, payload: &Value) -> Result<String> {
    let canonical = serde_json::to_string(&json!({
        "timestamp": timestamp,
        "kind": kind,
        "payload": payload,
    }))?;
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

async fn read_last_hash(path: &Path) -> Result<String> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(GENESIS_HASH.to_string());
    }
    let contents = tokio::fs::read_to_string(path).await?;
    for line in contents.lines().rev() {
        if line.trim().is_empty() {
            continue;
        }
        let record: AuditRecord = serde_json::from_str(line)?;
        return Ok(record.hash);
    }
    Ok(GENESIS_HASH.to_string())
}

//! Write-ahead action log.
//!
//! Every durable side effect writes a `STARTED` record (fsync'd) before the
//! effect and a `COMPLETED`/`FAILED` record with the same action id after.
//! Recovery enumerates orphaned `STARTED` records: compensable kinds are
//! closed out with a synthetic `FAILED` record, the rest are surfaced for
//! diagnostics.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// File name of the WAL inside the runtime directory.
pub const WAL_FILE: &str = "actions_wal.jsonl";

/// Action kinds whose effect is safe to compensate during recovery: either
/// the effect is idempotently re-droppable or the canonical state was never
/// touched.
const COMPENSABLE_KINDS: &[&str] = &[
    "snapshot.capture",
    "snapshot.drop",
    "staging.discard",
    "artifact.index",
];

/// Lifecycle status of a WAL action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum WalStatus {
    Started,
    Completed,
    Failed,
}

/// A single WAL row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalRecord {
    /// Correlates the STARTED record with its terminal record.
    pub action_id: Uuid,

    /// When the record was appended.
    pub ts: DateTime<Utc>,

    /// Action kind, e.g. `manifest.write` or `snapshot.drop`.
    pub kind: String,

    /// Lifecycle status.
    pub status: WalStatus,

    /// Action-specific payload (already redacted by the caller).
    pub payload: serde_json::Value,
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Orphans closed out with a synthetic FAILED record.
    pub compensated: Vec<Uuid>,
    /// Orphans that could not be compensated; surfaced by doctor.
    pub surfaced: Vec<WalRecord>,
}

/// Append-only JSONL write-ahead log.
pub struct ActionWal {
    path: PathBuf,
}

impl ActionWal {
    /// Open (creating the runtime directory if needed) the WAL.
    pub fn open(runtime_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = runtime_dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(WAL_FILE),
        })
    }

    /// Path of the underlying JSONL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a STARTED record and return its fresh action id.
    pub fn begin(&self, kind: &str, payload: serde_json::Value) -> Result<Uuid> {
        let action_id = Uuid::new_v4();
        self.append(&WalRecord {
            action_id,
            ts: Utc::now(),
            kind: kind.to_string(),
            status: WalStatus::Started,
            payload,
        })?;
        Ok(action_id)
    }

    /// Mark an action as completed.
    pub fn complete(&self, action_id: Uuid, kind: &str) -> Result<()> {
        self.append(&WalRecord {
            action_id,
            ts: Utc::now(),
            kind: kind.to_string(),
            status: WalStatus::Completed,
            payload: serde_json::Value::Null,
        })
    }

    /// Mark an action as failed with a reason.
    pub fn fail(&self, action_id: Uuid, kind: &str, reason: &str) -> Result<()> {
        self.append(&WalRecord {
            action_id,
            ts: Utc::now(),
            kind: kind.to_string(),
            status: WalStatus::Failed,
            payload: serde_json::json!({ "reason": reason }),
        })
    }

    /// All records in append order. Unparseable lines are an error.
    pub fn records(&self) -> Result<Vec<WalRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: WalRecord =
                serde_json::from_str(line).map_err(|e| StoreError::WalCorrupt {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            records.push(record);
        }
        Ok(records)
    }

    /// STARTED records with no terminal record.
    pub fn orphans(&self) -> Result<Vec<WalRecord>> {
        let records = self.records()?;
        let mut open: Vec<WalRecord> = Vec::new();
        for record in records {
            match record.status {
                WalStatus::Started => open.push(record),
                WalStatus::Completed | WalStatus::Failed => {
                    open.retain(|r| r.action_id != record.action_id);
                }
            }
        }
        Ok(open)
    }

    /// Best-effort startup recovery.
    ///
    /// Compensable orphans get a synthetic FAILED record carrying a
    /// `recovered` marker; everything else is returned for doctor to report.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for orphan in self.orphans()? {
            if COMPENSABLE_KINDS.contains(&orphan.kind.as_str()) {
                self.append(&WalRecord {
                    action_id: orphan.action_id,
                    ts: Utc::now(),
                    kind: orphan.kind.clone(),
                    status: WalStatus::Failed,
                    payload: serde_json::json!({ "recovered": true }),
                })?;
                report.compensated.push(orphan.action_id);
            } else {
                warn!(
                    event = "wal.orphan",
                    action_id = %orphan.action_id,
                    kind = %orphan.kind,
                );
                report.surfaced.push(orphan);
            }
        }
        Ok(report)
    }

    fn append(&self, record: &WalRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

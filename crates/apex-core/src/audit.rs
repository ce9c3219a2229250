//! Tamper-evident audit chain.
//!
//! Append-only JSONL, one file per UTC day, each entry hash-linked to its
//! predecessor. The first entry of a day links to the tail of the most
//! recent prior day (or to the zero hash), so the whole history forms one
//! chain. `anchors.jsonl` carries one summary row per date fixing that
//! day's final hash.
//!
//! Hashing covers the canonical (key-sorted) serialization of the redacted
//! payload, so verification runs over the public view of the log.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{ApexError, Result};
use crate::redact::Redactor;

/// `prev_hash` of the first entry ever written.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// File name of the anchor log inside the audit directory.
pub const ANCHORS_FILE: &str = "anchors.jsonl";

/// A single chained audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Monotonic per-file sequence number, starting at 1.
    pub seq: u64,

    pub ts: DateTime<Utc>,

    /// Entry kind, e.g. `run.started` or `planner_fallback`.
    pub kind: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Kind-specific payload, redacted before hashing.
    pub payload: Value,

    /// `entry_hash` of the predecessor (or [`GENESIS_HASH`]).
    pub prev_hash: String,

    /// `sha256(prev_hash || "\n" || canonical(payload))`, hex.
    pub entry_hash: String,
}

/// One summary row per date in `anchors.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyAnchor {
    /// Calendar date the anchor covers.
    pub date: NaiveDate,

    /// `entry_hash` of the day's final entry.
    pub chain_hash: String,

    /// Number of entries in the day's file.
    pub record_count: u64,

    /// Deterministic tag name recorded whether or not the VCS accepted it.
    pub git_tag: String,
}

/// Location of the first verification failure within a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenFile {
    pub file: String,
    pub line: usize,
    pub reason: String,
}

/// Result of walking the chain.
#[derive(Debug, Clone, Default)]
pub struct ChainReport {
    /// Entries that verified.
    pub records: u64,
    /// First break per file, in date order.
    pub broken: Vec<BrokenFile>,
}

impl ChainReport {
    pub fn ok(&self) -> bool {
        self.broken.is_empty()
    }
}

/// Append/verify/anchor interface over the audit directory.
pub struct AuditChain {
    dir: PathBuf,
    redactor: Arc<Redactor>,
}

impl AuditChain {
    pub fn new(dir: impl Into<PathBuf>, redactor: Arc<Redactor>) -> Self {
        Self {
            dir: dir.into(),
            redactor,
        }
    }

    /// Append an entry to today's file.
    ///
    /// Fail-fast: the day file is exclusively locked for the critical
    /// section, the new hash is computed from the current tail, and the
    /// line is fsync'd before the lock is released.
    pub fn append(&self, kind: &str, payload: Value, run_id: Option<&str>) -> Result<AuditEntry> {
        fs::create_dir_all(&self.dir)?;
        let today = Utc::now().date_naive();
        let path = self.day_path(today);

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        file.lock_exclusive()
            .map_err(|e| ApexError::Audit(format!("lock {}: {e}", path.display())))?;

        let result = self.append_locked(&file, &path, today, kind, payload, run_id);
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    fn append_locked(
        &self,
        file: &File,
        path: &Path,
        today: NaiveDate,
        kind: &str,
        payload: Value,
        run_id: Option<&str>,
    ) -> Result<AuditEntry> {
        let tail = read_tail_entry(path)?;
        let (seq, prev_hash) = match tail {
            Some(entry) => (entry.seq + 1, entry.entry_hash),
            None => (1, self.prior_day_tail_hash(today)?),
        };

        let payload = self.redactor.redact_value(&payload);
        let canonical = canonical_json(&payload);
        let entry_hash = chain_hash(&prev_hash, &canonical);

        let entry = AuditEntry {
            seq,
            ts: Utc::now(),
            kind: kind.to_string(),
            run_id: run_id.map(str::to_string),
            payload,
            prev_hash,
            entry_hash,
        };

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut writer = file;
        writer.write_all(line.as_bytes())?;
        file.sync_all()?;

        debug!(event = "audit.appended", kind = %entry.kind, seq = entry.seq);
        Ok(entry)
    }

    /// Walk the chain, recomputing every hash.
    ///
    /// A broken file stops linkage checking at the break, but verification
    /// continues with later files (their internal hashes are still
    /// recomputed; only the cross-file link is unverifiable).
    pub fn verify(&self, date: Option<NaiveDate>) -> Result<ChainReport> {
        let mut report = ChainReport::default();
        if !self.dir.exists() {
            return Ok(report);
        }

        // Expected prev_hash of the next entry; None after a break.
        let mut expected: Option<String> = Some(GENESIS_HASH.to_string());

        for (file_date, path) in self.day_files()? {
            if let Some(filter) = date {
                if file_date != filter {
                    // Out-of-scope files still advance the link expectation.
                    expected = read_tail_entry(&path)
                        .ok()
                        .flatten()
                        .map(|e| e.entry_hash);
                    continue;
                }
            }

            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let content = fs::read_to_string(&path)?;
            let mut file_broken = false;

            for (idx, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: AuditEntry = match serde_json::from_str(line) {
                    Ok(entry) => entry,
                    Err(e) => {
                        report.broken.push(BrokenFile {
                            file: file_name.clone(),
                            line: idx + 1,
                            reason: format!("unparseable entry: {e}"),
                        });
                        file_broken = true;
                        break;
                    }
                };

                if let Some(exp) = &expected {
                    if entry.prev_hash != *exp {
                        report.broken.push(BrokenFile {
                            file: file_name.clone(),
                            line: idx + 1,
                            reason: "prev_hash does not match predecessor".to_string(),
                        });
                        file_broken = true;
                        break;
                    }
                }

                let recomputed = chain_hash(&entry.prev_hash, &canonical_json(&entry.payload));
                if recomputed != entry.entry_hash {
                    report.broken.push(BrokenFile {
                        file: file_name.clone(),
                        line: idx + 1,
                        reason: "entry_hash does not recompute".to_string(),
                    });
                    file_broken = true;
                    break;
                }

                report.records += 1;
                expected = Some(entry.entry_hash);
            }

            if file_broken {
                expected = None;
            }
        }

        Ok(report)
    }

    /// Rewrite the trailing anchor row for today.
    ///
    /// `git_workdir`, when given, receives a best-effort `git tag`; the tag
    /// name is recorded in the anchor either way.
    pub fn anchor_today(&self, git_workdir: Option<&Path>) -> Result<DailyAnchor> {
        fs::create_dir_all(&self.dir)?;
        let today = Utc::now().date_naive();
        let path = self.day_path(today);

        let (chain_hash, record_count) = match read_tail_entry(&path)? {
            Some(tail) => (tail.entry_hash, tail.seq),
            None => (GENESIS_HASH.to_string(), 0),
        };

        let anchor = DailyAnchor {
            date: today,
            chain_hash,
            record_count,
            git_tag: format!("apex-audit-anchor-{today}"),
        };

        let anchors_path = self.dir.join(ANCHORS_FILE);
        let mut anchors: Vec<DailyAnchor> = Vec::new();
        if anchors_path.exists() {
            for line in fs::read_to_string(&anchors_path)?.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let row: DailyAnchor = serde_json::from_str(line)?;
                if row.date != today {
                    anchors.push(row);
                }
            }
        }
        anchors.push(anchor.clone());

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        for row in &anchors {
            let mut line = serde_json::to_string(row)?;
            line.push('\n');
            tmp.write_all(line.as_bytes())?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&anchors_path)
            .map_err(|e| ApexError::Io(e.error))?;

        if let Some(workdir) = git_workdir {
            // Tag acceptance is not required; the anchor row is the record.
            let _ = Command::new("git")
                .args(["tag", "-f", &anchor.git_tag])
                .current_dir(workdir)
                .output();
        }

        Ok(anchor)
    }

    /// All anchor rows on disk.
    pub fn anchors(&self) -> Result<Vec<DailyAnchor>> {
        let path = self.dir.join(ANCHORS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        for line in fs::read_to_string(&path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(line)?);
        }
        Ok(rows)
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{date}.jsonl"))
    }

    /// Day files in ascending date order.
    fn day_files(&self) -> Result<Vec<(NaiveDate, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".jsonl") {
                if let Ok(date) = stem.parse::<NaiveDate>() {
                    files.push((date, entry.path()));
                }
            }
        }
        files.sort_by_key(|(date, _)| *date);
        Ok(files)
    }

    /// Tail hash of the most recent day before `date`, or the zero hash.
    fn prior_day_tail_hash(&self, date: NaiveDate) -> Result<String> {
        let prior = self
            .day_files()?
            .into_iter()
            .filter(|(d, _)| *d < date)
            .next_back();
        match prior {
            Some((_, path)) => Ok(read_tail_entry(&path)?
                .map(|e| e.entry_hash)
                .unwrap_or_else(|| GENESIS_HASH.to_string())),
            None => Ok(GENESIS_HASH.to_string()),
        }
    }
}

/// Last parseable entry of a day file. A trailing line without a newline is
/// treated as an in-flight append and ignored.
fn read_tail_entry(path: &Path) -> Result<Option<AuditEntry>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let complete = match content.rfind('\n') {
        Some(end) => &content[..end],
        None => return Ok(None),
    };
    match complete.lines().rev().find(|l| !l.trim().is_empty()) {
        Some(line) => Ok(serde_json::from_str(line).ok()),
        None => Ok(None),
    }
}

/// Deterministic key-sorted serialization used for hashing.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string key"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).expect("scalar"),
    }
}

fn chain_hash(prev_hash: &str, canonical_payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_payload.as_bytes());
    hex::encode(hasher.finalize())
}

//! Runtime store: a single-writer embedded SQLite database.
//!
//! Holds cross-run state, per-node staging rows, a queryable mirror of run
//! manifests, and policy-file checksum baselines. The writer is guarded by
//! the advisory lock in [`crate::lock`]; read-only consumers (doctor, the
//! history views) open without the lock.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::lock::RuntimeLock;

/// File name of the database inside the runtime directory.
pub const DB_FILE: &str = "runtime.db";

/// File name of the writer lock, next to the database.
pub const LOCK_FILE: &str = "runtime.db.lock";

/// Current schema version, stored in SQLite's `user_version` pragma.
pub const SCHEMA_VERSION: i64 = 1;

/// A row of the `runs` table, mirroring a run manifest for query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRow {
    pub run_id: String,
    pub task: String,
    /// `success`, `failure`, or `cancelled`; `None` while in flight.
    pub outcome: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub risk_level: String,
}

/// A policy-checksum baseline row.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRow {
    pub path: String,
    pub checksum: String,
    pub observed_at: DateTime<Utc>,
}

/// A detected drift between a baseline checksum and the file on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDrift {
    pub path: String,
    pub baseline: String,
    /// Current checksum, or `None` when the file has been removed.
    pub current: Option<String>,
}

/// Writer handle on the runtime database. Holds the advisory lock for its
/// entire lifetime; the lock file is removed on drop.
#[derive(Debug)]
pub struct RuntimeStore {
    conn: Connection,
    _lock: Option<RuntimeLock>,
}

impl RuntimeStore {
    /// Open the store for writing, acquiring the advisory writer lock.
    pub fn open(runtime_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = runtime_dir.as_ref();
        fs::create_dir_all(dir)?;
        let lock = RuntimeLock::acquire(dir.join(LOCK_FILE))?;
        let conn = Connection::open(dir.join(DB_FILE))?;
        let mut store = Self {
            conn,
            _lock: Some(lock),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open the store read-only, without touching the writer lock.
    ///
    /// Fails if the database file does not exist yet.
    pub fn open_read_only(runtime_dir: impl AsRef<Path>) -> Result<Self> {
        let path = runtime_dir.as_ref().join(DB_FILE);
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn, _lock: None })
    }

    /// Whether the database file exists under `runtime_dir`.
    pub fn exists(runtime_dir: impl AsRef<Path>) -> bool {
        runtime_dir.as_ref().join(DB_FILE).exists()
    }

    /// Path of the database file under `runtime_dir`.
    pub fn db_path(runtime_dir: impl AsRef<Path>) -> PathBuf {
        runtime_dir.as_ref().join(DB_FILE)
    }

    /// Schema version of the opened database.
    pub fn schema_version(&self) -> Result<i64> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    fn migrate(&mut self) -> Result<()> {
        let version = self.schema_version()?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }
        debug!(event = "store.migrate", from = version, to = SCHEMA_VERSION);
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS state (
                 key        TEXT PRIMARY KEY,
                 value      TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS staging (
                 node_id TEXT NOT NULL,
                 key     TEXT NOT NULL,
                 value   TEXT NOT NULL,
                 PRIMARY KEY (node_id, key)
             );
             CREATE TABLE IF NOT EXISTS runs (
                 run_id      TEXT PRIMARY KEY,
                 task        TEXT NOT NULL,
                 outcome     TEXT,
                 started_at  TEXT NOT NULL,
                 finished_at TEXT,
                 risk_level  TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS policy (
                 path        TEXT PRIMARY KEY,
                 checksum    TEXT NOT NULL,
                 observed_at TEXT NOT NULL
             );",
        )?;
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tx.commit()?;
        Ok(())
    }

    // -- state ------------------------------------------------------------

    /// Upsert a canonical state key.
    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Read a canonical state key.
    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM state WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    // -- staging ----------------------------------------------------------

    /// Stage a pending mutation a node wants committed on success.
    pub fn stage(&self, node_id: &str, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO staging (node_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(node_id, key) DO UPDATE SET value = ?3",
            params![node_id, key, value],
        )?;
        Ok(())
    }

    /// Staged rows for one node.
    pub fn staged_for(&self, node_id: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM staging WHERE node_id = ?1 ORDER BY key")?;
        let rows = stmt
            .query_map([node_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count of all staged rows.
    pub fn staging_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM staging", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Discard the staging rows of a failed node.
    pub fn discard_staging(&self, node_id: &str) -> Result<usize> {
        let n = self
            .conn
            .execute("DELETE FROM staging WHERE node_id = ?1", [node_id])?;
        Ok(n)
    }

    /// Flush the staging rows of the given nodes into canonical state and
    /// delete them, in a single transaction.
    pub fn flush_staging(&mut self, node_ids: &[String]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut flushed = 0usize;
        for node_id in node_ids {
            let rows: Vec<(String, String)> = {
                let mut stmt =
                    tx.prepare("SELECT key, value FROM staging WHERE node_id = ?1 ORDER BY key")?;
                let collected = stmt
                    .query_map([node_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                collected
            };
            for (key, value) in rows {
                tx.execute(
                    "INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                    params![key, value, now],
                )?;
                flushed += 1;
            }
            tx.execute("DELETE FROM staging WHERE node_id = ?1", [node_id])?;
        }
        tx.commit()?;
        Ok(flushed)
    }

    // -- runs -------------------------------------------------------------

    /// Insert a run row at scheduling time (outcome still open).
    pub fn insert_run(&self, row: &RunRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO runs (run_id, task, outcome, started_at, finished_at, risk_level)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.run_id,
                row.task,
                row.outcome,
                row.started_at.to_rfc3339(),
                row.finished_at.map(|t| t.to_rfc3339()),
                row.risk_level,
            ],
        )?;
        Ok(())
    }

    /// Record the terminal outcome of a run.
    pub fn finish_run(
        &self,
        run_id: &str,
        outcome: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE runs SET outcome = ?2, finished_at = ?3 WHERE run_id = ?1",
            params![run_id, outcome, finished_at.to_rfc3339()],
        )?;
        if n == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    /// Fetch one run row.
    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, task, outcome, started_at, finished_at, risk_level
                 FROM runs WHERE run_id = ?1",
                [run_id],
                Self::map_run_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent runs, newest first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, task, outcome, started_at, finished_at, risk_level
             FROM runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], Self::map_run_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All run ids present in the runs table.
    pub fn run_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT run_id FROM runs")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
        let started: String = row.get(3)?;
        let finished: Option<String> = row.get(4)?;
        Ok(RunRow {
            run_id: row.get(0)?,
            task: row.get(1)?,
            outcome: row.get(2)?,
            started_at: parse_ts(&started),
            finished_at: finished.as_deref().map(parse_ts),
            risk_level: row.get(5)?,
        })
    }

    // -- policy checksums -------------------------------------------------

    /// Record (or refresh) the baseline checksum of a config file.
    pub fn record_policy_baseline(&self, path: &Path) -> Result<PolicyRow> {
        let checksum = file_checksum(path)?;
        let row = PolicyRow {
            path: path.display().to_string(),
            checksum,
            observed_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO policy (path, checksum, observed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET checksum = ?2, observed_at = ?3",
            params![row.path, row.checksum, row.observed_at.to_rfc3339()],
        )?;
        Ok(row)
    }

    /// All recorded baselines.
    pub fn policy_rows(&self) -> Result<Vec<PolicyRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, checksum, observed_at FROM policy ORDER BY path")?;
        let rows = stmt
            .query_map([], |row| {
                let observed: String = row.get(2)?;
                Ok(PolicyRow {
                    path: row.get(0)?,
                    checksum: row.get(1)?,
                    observed_at: parse_ts(&observed),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Compare every baseline against the file currently on disk.
    pub fn check_policy_drift(&self) -> Result<Vec<PolicyDrift>> {
        let mut drifted = Vec::new();
        for row in self.policy_rows()? {
            let current = file_checksum(Path::new(&row.path)).ok();
            if current.as_deref() != Some(row.checksum.as_str()) {
                drifted.push(PolicyDrift {
                    path: row.path,
                    baseline: row.checksum,
                    current,
                });
            }
        }
        Ok(drifted)
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SHA-256 hex checksum of a file's bytes.
pub fn file_checksum(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, RuntimeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RuntimeStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn run_row(run_id: &str) -> RunRow {
        RunRow {
            run_id: run_id.to_string(),
            task: "say hello".to_string(),
            outcome: None,
            started_at: Utc::now(),
            finished_at: None,
            risk_level: "LOW".to_string(),
        }
    }

    #[test]
    fn state_roundtrip() {
        let (_dir, store) = make_store();
        store.set_state("greeting", "hello").unwrap();
        assert_eq!(store.get_state("greeting").unwrap().unwrap(), "hello");
        store.set_state("greeting", "goodbye").unwrap();
        assert_eq!(store.get_state("greeting").unwrap().unwrap(), "goodbye");
    }

    #[test]
    fn schema_version_is_stamped() {
        let (_dir, store) = make_store();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn staging_flush_moves_rows_to_state() {
        let (_dir, mut store) = make_store();
        store.stage("task_1", "result", "42").unwrap();
        store.stage("task_2", "note", "kept staged").unwrap();

        let flushed = store.flush_staging(&["task_1".to_string()]).unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(store.get_state("result").unwrap().unwrap(), "42");
        assert!(store.get_state("note").unwrap().is_none());
        assert_eq!(store.staged_for("task_2").unwrap().len(), 1);
    }

    #[test]
    fn staging_discard_drops_failed_node_rows() {
        let (_dir, store) = make_store();
        store.stage("task_1", "a", "1").unwrap();
        store.stage("task_1", "b", "2").unwrap();
        assert_eq!(store.discard_staging("task_1").unwrap(), 2);
        assert_eq!(store.staging_count().unwrap(), 0);
    }

    #[test]
    fn run_lifecycle_roundtrip() {
        let (_dir, store) = make_store();
        store.insert_run(&run_row("run-aaa")).unwrap();

        let open = store.get_run("run-aaa").unwrap().unwrap();
        assert!(open.outcome.is_none());

        store.finish_run("run-aaa", "success", Utc::now()).unwrap();
        let done = store.get_run("run-aaa").unwrap().unwrap();
        assert_eq!(done.outcome.as_deref(), Some("success"));
        assert!(done.finished_at.is_some());
    }

    #[test]
    fn finish_unknown_run_errors() {
        let (_dir, store) = make_store();
        match store.finish_run("run-zzz", "success", Utc::now()) {
            Err(StoreError::RunNotFound(id)) => assert_eq!(id, "run-zzz"),
            other => panic!("expected RunNotFound, got {other:?}"),
        }
    }

    #[test]
    fn list_runs_newest_first() {
        let (_dir, store) = make_store();
        let mut old = run_row("run-old");
        old.started_at = Utc::now() - chrono::Duration::hours(1);
        store.insert_run(&old).unwrap();
        store.insert_run(&run_row("run-new")).unwrap();

        let runs = store.list_runs(10).unwrap();
        assert_eq!(runs[0].run_id, "run-new");
        assert_eq!(runs[1].run_id, "run-old");
    }

    #[test]
    fn policy_drift_detected_after_edit() {
        let (dir, store) = make_store();
        let config = dir.path().join("config.yaml");
        fs::write(&config, "pool:\n  max_concurrent: 2\n").unwrap();

        store.record_policy_baseline(&config).unwrap();
        assert!(store.check_policy_drift().unwrap().is_empty());

        fs::write(&config, "pool:\n  max_concurrent: 8\n").unwrap();
        let drift = store.check_policy_drift().unwrap();
        assert_eq!(drift.len(), 1);
        assert!(drift[0].current.is_some());
    }

    #[test]
    fn policy_drift_reports_removed_file() {
        let (dir, store) = make_store();
        let config = dir.path().join("config.yaml");
        fs::write(&config, "x").unwrap();
        store.record_policy_baseline(&config).unwrap();
        fs::remove_file(&config).unwrap();

        let drift = store.check_policy_drift().unwrap();
        assert_eq!(drift.len(), 1);
        assert!(drift[0].current.is_none());
    }

    #[test]
    fn second_writer_is_rejected_while_lock_held() {
        let (dir, _store) = make_store();
        match RuntimeStore::open(dir.path()) {
            Err(StoreError::LockHeld { pid }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[test]
    fn read_only_open_skips_the_lock() {
        let (dir, store) = make_store();
        store.set_state("k", "v").unwrap();
        let reader = RuntimeStore::open_read_only(dir.path()).unwrap();
        assert_eq!(reader.get_state("k").unwrap().unwrap(), "v");
    }
}

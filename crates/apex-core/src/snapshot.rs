//! Working-tree snapshots around run execution.
//!
//! `git stash create` captures a commit of the dirty tree without touching
//! it; the resulting oid is recorded in a per-run sidecar. Success drops
//! the sidecar, failure and cancellation retain it as the restore point.

use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ApexHome;
use crate::error::{ApexError, Result};

/// Sidecar file name inside `runs/<run_id>/`.
pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// A saved working-tree state, tagged with the run that captured it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRef {
    pub run_id: String,
    /// Commit oid produced by `git stash create`.
    pub stash_oid: String,
    pub created_at: DateTime<Utc>,
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Whether the working tree has local changes (`git status --porcelain`).
pub fn working_tree_dirty(dir: &Path) -> Result<bool> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(dir)
        .output()
        .map_err(|e| ApexError::GitError(format!("failed to run git: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ApexError::GitError(format!(
            "git status failed: {stderr}"
        )));
    }
    Ok(!output.stdout.is_empty())
}

/// Capture the dirty tree without modifying it.
///
/// Returns `None` when `git stash create` produces nothing to save (clean
/// tree, or only untracked files on older git versions).
pub fn capture(dir: &Path, run_id: &str) -> Result<Option<SnapshotRef>> {
    let output = Command::new("git")
        .args(["stash", "create", &format!("apex snapshot {run_id}")])
        .current_dir(dir)
        .output()
        .map_err(|e| ApexError::GitError(format!("failed to run git: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ApexError::GitError(format!(
            "git stash create failed: {stderr}"
        )));
    }

    let oid = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if oid.is_empty() {
        return Ok(None);
    }
    Ok(Some(SnapshotRef {
        run_id: run_id.to_string(),
        stash_oid: oid,
        created_at: Utc::now(),
    }))
}

/// Persist the sidecar under the run directory.
pub fn save_ref(home: &ApexHome, snapshot: &SnapshotRef) -> Result<()> {
    let dir = home.run_dir(&snapshot.run_id);
    fs::create_dir_all(&dir)?;
    let raw = serde_json::to_string_pretty(snapshot)?;
    fs::write(dir.join(SNAPSHOT_FILE), raw)?;
    Ok(())
}

/// Load the sidecar of a run, when one was captured.
pub fn load_ref(home: &ApexHome, run_id: &str) -> Result<Option<SnapshotRef>> {
    let path = home.run_dir(run_id).join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Drop the sidecar after a successful run. Idempotent.
pub fn drop_ref(home: &ApexHome, run_id: &str) -> Result<()> {
    let path = home.run_dir(run_id).join(SNAPSHOT_FILE);
    if path.exists() {
        fs::remove_file(&path)?;
    }
    Ok(())
}

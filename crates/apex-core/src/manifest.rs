//! Run manifests and per-node results.
//!
//! One manifest per `run` invocation, written atomically at run termination.
//! Its existence is the marker that the run reached a terminal state.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::{ApexHome, SandboxLevel};
use crate::error::{ApexError, Result};
use crate::risk::RiskLevel;

/// Manifest file name inside `runs/<run_id>/`.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Execution state of a DAG node. Transitions are monotonic:
/// `PENDING → STARTED → {COMPLETED | FAILED | SKIPPED}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    Pending,
    Started,
    Completed,
    Failed,
    Skipped,
}

impl NodeState {
    /// Whether this state ends the node's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed | NodeState::Skipped
        )
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failure,
    Cancelled,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
            RunOutcome::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Failure classification carried on a failed node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Retriable,
    Fatal,
    Cancelled,
}

/// Result of one planned DAG node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeResult {
    /// Node id from the plan.
    pub id: String,

    /// Task text of the node.
    pub task: String,

    /// Ids of the nodes this one depended on.
    pub depends_on: Vec<String>,

    /// Terminal state reached.
    pub state: NodeState,

    /// Attempts made (0 for skipped nodes, 1 = no retries used).
    pub attempt_count: u32,

    /// SHA-256 of the node's redacted stdout, when any was captured.
    pub stdout_digest: Option<String>,

    /// Redacted stderr of the final attempt, when it failed.
    pub error: Option<String>,

    /// Classification of the failure, when failed.
    pub error_kind: Option<ErrorKind>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeResult {
    /// A node that never started because an upstream dependency failed.
    pub fn skipped(id: &str, task: &str, depends_on: &[String]) -> Self {
        Self {
            id: id.to_string(),
            task: task.to_string(),
            depends_on: depends_on.to_vec(),
            state: NodeState::Skipped,
            attempt_count: 0,
            stdout_digest: None,
            error: None,
            error_kind: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// One manifest per `run` invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunManifest {
    /// ULID-style run identifier.
    pub run_id: String,

    /// UUID correlating log lines and audit entries for this run.
    pub trace_id: String,

    /// Redacted task text.
    pub task: String,

    /// Model the executor ran with.
    pub model: String,

    pub risk_level: RiskLevel,
    pub sandbox_level: SandboxLevel,
    pub outcome: RunOutcome,

    /// Node results in plan declaration order.
    pub nodes: Vec<NodeResult>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// How cleanly the run can be rolled back: 1.0 on success or with a
    /// retained snapshot; otherwise the fraction of completed nodes.
    pub rollback_quality: f64,

    /// Rough cost estimate for the run, in dollars.
    pub cost_estimate: f64,
}

impl RunManifest {
    /// Write atomically (temp file + rename) as pretty-printed JSON under
    /// `runs/<run_id>/manifest.json`.
    pub fn save(&self, home: &ApexHome) -> Result<PathBuf> {
        let dir = home.run_dir(&self.run_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(MANIFEST_FILE);

        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| ApexError::Io(e.error))?;
        Ok(path)
    }

    /// Load the manifest of a run.
    pub fn load(home: &ApexHome, run_id: &str) -> Result<Self> {
        let path = home.run_dir(run_id).join(MANIFEST_FILE);
        if !path.exists() {
            return Err(ApexError::RunNotFound(run_id.to_string()));
        }
        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest(run_id: &str) -> RunManifest {
        RunManifest {
            run_id: run_id.to_string(),
            trace_id: "3f2b9a60-0000-4000-8000-000000000000".to_string(),
            task: "say hello".to_string(),
            model: "claude-sonnet-4".to_string(),
            risk_level: RiskLevel::Low,
            sandbox_level: SandboxLevel::None,
            outcome: RunOutcome::Success,
            nodes: vec![NodeResult {
                id: "task_1".to_string(),
                task: "say hello".to_string(),
                depends_on: vec![],
                state: NodeState::Completed,
                attempt_count: 1,
                stdout_digest: Some("ab".repeat(32)),
                error: None,
                error_kind: None,
                started_at: Some(Utc::now()),
                finished_at: Some(Utc::now()),
            }],
            started_at: Utc::now(),
            finished_at: Utc::now(),
            rollback_quality: 1.0,
            cost_estimate: 0.03,
        }
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let home = ApexHome::at(dir.path());
        let manifest = sample_manifest("01J0000000000000000000A001");

        let path = manifest.save(&home).unwrap();
        assert!(path.ends_with("manifest.json"));

        let loaded = RunManifest::load(&home, &manifest.run_id).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn manifest_is_pretty_printed() {
        let dir = tempfile::tempdir().unwrap();
        let home = ApexHome::at(dir.path());
        let manifest = sample_manifest("01J0000000000000000000A002");
        let path = manifest.save(&home).unwrap();

        let raw = fs::read_to_string(path).unwrap();
        assert!(raw.lines().count() > 5, "expected multi-line JSON");
        assert!(raw.contains("\"run_id\""));
        assert!(raw.contains("\"trace_id\""));
    }

    #[test]
    fn load_missing_run_errors() {
        let dir = tempfile::tempdir().unwrap();
        let home = ApexHome::at(dir.path());
        match RunManifest::load(&home, "run-none") {
            Err(ApexError::RunNotFound(id)) => assert_eq!(id, "run-none"),
            other => panic!("expected RunNotFound, got {other:?}"),
        }
    }

    #[test]
    fn node_state_terminality() {
        assert!(!NodeState::Pending.is_terminal());
        assert!(!NodeState::Started.is_terminal());
        assert!(NodeState::Completed.is_terminal());
        assert!(NodeState::Failed.is_terminal());
        assert!(NodeState::Skipped.is_terminal());
    }

    #[test]
    fn serde_uses_stable_casing() {
        let json = serde_json::to_string(&NodeState::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
        let json = serde_json::to_string(&RunOutcome::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }
}

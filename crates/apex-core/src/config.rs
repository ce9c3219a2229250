//! Configuration loading and filesystem layout.
//!
//! Everything lives under a single root (`$APEX_HOME`, default
//! `$HOME/.apex`). The kill switch deliberately lives outside the root at
//! `$HOME/.claude/KILL_SWITCH` so it survives an `rm -rf ~/.apex`;
//! `$APEX_KILL_SWITCH` overrides it for hermetic tests.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ApexError, Result};
use crate::risk::RiskLevel;

/// Config file name under the Apex home.
pub const CONFIG_FILE: &str = "config.yaml";

/// Sandbox strength applied to executor subprocesses, weakest first.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum SandboxLevel {
    #[default]
    None,
    Ulimit,
    Container,
}

impl std::fmt::Display for SandboxLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxLevel::None => "none",
            SandboxLevel::Ulimit => "ulimit",
            SandboxLevel::Container => "container",
        };
        write!(f, "{s}")
    }
}

/// Filesystem layout rooted at the Apex home directory.
#[derive(Debug, Clone)]
pub struct ApexHome {
    root: PathBuf,
    kill_switch: PathBuf,
}

impl ApexHome {
    /// Resolve from the environment: `$APEX_HOME` else `$HOME/.apex`, kill
    /// switch from `$APEX_KILL_SWITCH` else `$HOME/.claude/KILL_SWITCH`.
    pub fn resolve() -> Result<Self> {
        let root = match std::env::var_os("APEX_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => home_dir()?.join(".apex"),
        };
        let kill_switch = match std::env::var_os("APEX_KILL_SWITCH") {
            Some(path) => PathBuf::from(path),
            None => home_dir()?.join(".claude").join("KILL_SWITCH"),
        };
        Ok(Self { root, kill_switch })
    }

    /// Construct at an explicit root with the kill switch inside it
    /// (used by tests and embedded callers).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let kill_switch = root.join("KILL_SWITCH");
        Self { root, kill_switch }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn kill_switch_path(&self) -> &Path {
        &self.kill_switch
    }
}

fn home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| ApexError::Config("HOME is not set".to_string()))
}

/// LLM CLI settings for executor invocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClaudeConfig {
    pub model: String,
    pub effort: String,
    /// Per-attempt subprocess timeout, seconds.
    pub timeout: u64,
    /// Binary to spawn; `claude` on `$PATH` when unset.
    pub binary: Option<String>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4".to_string(),
            effort: "medium".to_string(),
            timeout: 300,
            binary: None,
        }
    }
}

/// Planner-specific LLM settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlannerConfig {
    pub model: String,
    /// Planner invocation timeout, seconds.
    pub timeout: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4".to_string(),
            timeout: 120,
        }
    }
}

/// Worker pool sizing for the DAG scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub max_concurrent: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_concurrent: 2 }
    }
}

/// Retry schedule for retriable executor failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub init_delay_seconds: f64,
    pub multiplier: f64,
    pub max_delay_seconds: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            init_delay_seconds: 1.0,
            multiplier: 2.0,
            max_delay_seconds: 30.0,
        }
    }
}

/// Sandbox policy: current level plus the risk tiers that require one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SandboxConfig {
    pub level: SandboxLevel,
    /// Risk levels that must not run with `level = none`.
    pub require_for: Vec<RiskLevel>,
}

/// Top-level configuration, loaded from `config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ApexConfig {
    pub claude: ClaudeConfig,
    pub planner: PlannerConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub sandbox: SandboxConfig,
}

impl ApexConfig {
    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| ApexError::Config(format!("{}: {e}", path.display())))
    }

    /// Binary name for executor invocations.
    pub fn claude_binary(&self) -> &str {
        self.claude.binary.as_deref().unwrap_or("claude")
    }
}

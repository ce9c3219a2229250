//! Apex Core Library
//!
//! The run pipeline behind the `apex` CLI: risk classification, admission
//! gating, planning, DAG scheduling over an external LLM CLI subprocess,
//! and the durable records every run leaves behind (audit chain, manifests,
//! artifacts, snapshots).

pub mod artifacts;
pub mod audit;
pub mod config;
pub mod coordinator;
pub mod diff;
pub mod doctor;
pub mod error;
pub mod executor;
pub mod gate;
pub mod manifest;
pub mod obs;
pub mod plan;
pub mod planner;
pub mod redact;
pub mod risk;
pub mod scheduler;
pub mod snapshot;
pub mod telemetry;

pub use artifacts::{ArtifactRecord, ArtifactStore, GcReport};
pub use audit::{
    canonical_json, AuditChain, AuditEntry, BrokenFile, ChainReport, DailyAnchor, ANCHORS_FILE,
    GENESIS_HASH,
};
pub use config::{
    ApexConfig, ApexHome, ClaudeConfig, PlannerConfig, PoolConfig, RetryConfig, SandboxConfig,
    SandboxLevel, CONFIG_FILE,
};
pub use coordinator::{Coordinator, RunOptions, RunReport};
pub use diff::{diff_manifests, FieldDelta, ManifestDiff};
pub use doctor::{
    aggregate, diagnose, system_health, ComponentHealth, DoctorReport, HealthLevel, Importance,
    InvariantCheck,
};
pub use error::{ApexError, Result};
pub use executor::{
    backoff_delay, classify_failure, CliInvoker, CliOutput, Executor, InvokeError, LlmInvoker,
    NodeExecution, NodeRunner,
};
pub use gate::{
    activate_kill_switch, admit, deactivate_kill_switch, kill_switch_active, GateDecision,
    GateReject, KillSwitchStatus,
};
pub use manifest::{ErrorKind, NodeResult, NodeState, RunManifest, RunOutcome, MANIFEST_FILE};
pub use plan::{Plan, PlanError, PlanNode};
pub use planner::{is_multi_step, PlanOutcome, Planner};
pub use redact::{Redactor, REDACTED};
pub use risk::{RiskClassifier, RiskLevel};
pub use scheduler::{FailurePolicy, NoopObserver, RunObserver, ScheduleOutcome, Scheduler};
pub use snapshot::SnapshotRef;
pub use telemetry::init_tracing;

/// Apex version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

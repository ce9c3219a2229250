//! Run coordinator: the end-to-end pipeline behind `apex run`.
//!
//! Sequence: allocate run id → `run.started` audit → classify risk → admit
//! → snapshot a dirty tree → plan → schedule → flush staging on success →
//! manifest → drop/retain snapshot → `run.finished` audit → daily anchor.
//! Dry runs short-circuit after planning and leave no durable residue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;
use uuid::Uuid;

use apex_store::{ActionWal, RunRow, RuntimeStore};

use crate::artifacts::ArtifactStore;
use crate::audit::AuditChain;
use crate::config::{ApexConfig, ApexHome, SandboxLevel};
use crate::doctor;
use crate::error::{ApexError, Result};
use crate::executor::{CliInvoker, Executor, LlmInvoker};
use crate::gate::{self, GateDecision, GateReject};
use crate::manifest::{ErrorKind, NodeState, RunManifest, RunOutcome};
use crate::obs;
use crate::plan::Plan;
use crate::planner::{Planner, PlanOutcome};
use crate::redact::Redactor;
use crate::risk::{RiskClassifier, RiskLevel};
use crate::scheduler::{FailurePolicy, RunObserver, Scheduler};
use crate::snapshot;

/// Options for one `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
}

/// Everything a `run` invocation produced, for the CLI to render.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub trace_id: String,
    pub risk_level: RiskLevel,
    pub sandbox_level: SandboxLevel,
    pub warnings: Vec<String>,
    pub gated: Option<GateReject>,
    pub dry_run: bool,
    pub plan: Option<Plan>,
    pub cost_estimate: f64,
    pub snapshot_saved: bool,
    pub snapshot_retained: bool,
    pub manifest: Option<RunManifest>,
}

impl RunReport {
    /// Process exit code for this report.
    pub fn exit_code(&self) -> i32 {
        if let Some(reject) = &self.gated {
            return reject.exit_code();
        }
        match self.manifest.as_ref().map(|m| m.outcome) {
            Some(RunOutcome::Success) | None => 0,
            Some(RunOutcome::Failure) | Some(RunOutcome::Cancelled) => 1,
        }
    }
}

/// Owns one run end to end.
pub struct Coordinator {
    home: ApexHome,
    config: ApexConfig,
    redactor: Arc<Redactor>,
    /// Working tree snapshots and anchor tags target this directory.
    workdir: PathBuf,
}

impl Coordinator {
    pub fn new(home: ApexHome, config: ApexConfig, workdir: PathBuf) -> Self {
        Self {
            home,
            config,
            redactor: Arc::new(Redactor::from_env()),
            workdir,
        }
    }

    /// Test seam: inject an explicit redactor.
    pub fn with_redactor(mut self, redactor: Arc<Redactor>) -> Self {
        self.redactor = redactor;
        self
    }

    /// Plan without executing (the `plan` subcommand).
    pub async fn plan_only(&self, task: &str) -> Result<PlanOutcome> {
        let invoker: Arc<dyn LlmInvoker> = Arc::new(CliInvoker::new(&self.config));
        let planner = Planner::new(invoker, &self.config);
        Ok(planner.plan(task, &CancellationToken::new()).await)
    }

    /// Execute a task end to end.
    pub async fn run(&self, task: &str, opts: &RunOptions) -> Result<RunReport> {
        let audit = AuditChain::new(self.home.audit_dir(), self.redactor.clone());
        let wal = ActionWal::open(self.home.runtime_dir())?;

        // Best-effort startup recovery of orphaned actions.
        match wal.recover() {
            Ok(report) if !report.surfaced.is_empty() => {
                warn!(
                    event = "wal.recovery",
                    surfaced = report.surfaced.len(),
                    compensated = report.compensated.len(),
                );
            }
            Ok(_) => {}
            Err(e) => warn!(event = "wal.recovery_failed", error = %e),
        }

        let run_id = Ulid::new().to_string();
        let trace_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let task_redacted = self.redactor.redact_str(task);

        audit.append(
            "run.started",
            json!({ "task": task, "trace_id": trace_id }),
            Some(&run_id),
        )?;

        let classifier = RiskClassifier::new();
        let mut risk = classifier.classify(task);
        obs::emit_run_started(&run_id, &risk.to_string());

        let health = doctor::system_health(&self.home, self.redactor.clone());
        let warnings = match gate::admit(&self.config, &self.home, risk, health) {
            GateDecision::Reject(reject) => {
                return self.gated(&audit, &run_id, &trace_id, risk, reject);
            }
            GateDecision::Admit { warnings } => warnings,
        };

        // Cooperative cancellation: OS interrupt becomes a token cancel.
        let cancel = CancellationToken::new();
        {
            let token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });
        }

        // Snapshot a dirty working tree before anything executes. Dry runs
        // must leave no durable residue, so they skip straight to planning.
        let mut snapshot_saved = false;
        if !opts.dry_run
            && snapshot::is_git_repo(&self.workdir)
            && snapshot::working_tree_dirty(&self.workdir)?
        {
            let action = wal.begin("snapshot.capture", json!({ "run_id": run_id }))?;
            match snapshot::capture(&self.workdir, &run_id) {
                Ok(Some(snap)) => {
                    snapshot::save_ref(&self.home, &snap)?;
                    wal.complete(action, "snapshot.capture")?;
                    audit.append(
                        "snapshot.captured",
                        json!({ "oid": snap.stash_oid }),
                        Some(&run_id),
                    )?;
                    snapshot_saved = true;
                }
                Ok(None) => wal.complete(action, "snapshot.capture")?,
                Err(e) => {
                    wal.fail(action, "snapshot.capture", &e.to_string())?;
                    return Err(e);
                }
            }
        }

        let invoker: Arc<dyn LlmInvoker> = Arc::new(CliInvoker::new(&self.config));
        let planner = Planner::new(invoker.clone(), &self.config);
        let plan_outcome = planner.plan(task, &cancel).await;
        if plan_outcome.used_fallback {
            obs::emit_planner_fallback(
                &run_id,
                plan_outcome.fallback_reason.as_deref().unwrap_or(""),
            );
            audit.append(
                "planner_fallback",
                json!({ "reason": plan_outcome.fallback_reason }),
                Some(&run_id),
            )?;
        }
        let plan = plan_outcome.plan;
        plan.validate()
            .map_err(|e| ApexError::InvalidPlan(e.to_string()))?;

        // Node tasks can escalate the run's risk; re-check the sandbox
        // policy against the escalated level.
        risk = risk.max(classifier.classify_all(plan.nodes.iter().map(|n| n.task.as_str())));
        if self.config.sandbox.level == SandboxLevel::None
            && self.config.sandbox.require_for.contains(&risk)
        {
            if snapshot_saved {
                snapshot::drop_ref(&self.home, &run_id)?;
            }
            let reject = GateReject::FailClosed {
                risk,
                level: self.config.sandbox.level,
            };
            return self.gated(&audit, &run_id, &trace_id, risk, reject);
        }

        let cost_estimate = estimate_cost(&self.config.claude.model, plan.nodes.len());

        if opts.dry_run {
            audit.append(
                "dry_run_preview",
                json!({ "nodes": plan.nodes.len(), "cost_estimate": cost_estimate }),
                Some(&run_id),
            )?;
            return Ok(RunReport {
                run_id,
                trace_id,
                risk_level: risk,
                sandbox_level: self.config.sandbox.level,
                warnings,
                gated: None,
                dry_run: true,
                plan: Some(plan),
                cost_estimate,
                snapshot_saved: false,
                snapshot_retained: false,
                manifest: None,
            });
        }

        // The writer handle is held for the rest of the run.
        let mut store = RuntimeStore::open(self.home.runtime_dir())?;
        if store.policy_rows()?.is_empty() && self.home.config_path().exists() {
            store.record_policy_baseline(&self.home.config_path())?;
        }

        let row_action = wal.begin("runs.insert", json!({ "run_id": run_id }))?;
        store.insert_run(&RunRow {
            run_id: run_id.clone(),
            task: task_redacted.clone(),
            outcome: None,
            started_at,
            finished_at: None,
            risk_level: risk.to_string(),
        })?;
        wal.complete(row_action, "runs.insert")?;

        let observer = Arc::new(PipelineObserver {
            audit: AuditChain::new(self.home.audit_dir(), self.redactor.clone()),
            wal: ActionWal::open(self.home.runtime_dir())?,
            run_id: run_id.clone(),
            open_actions: Mutex::new(HashMap::new()),
        });
        let executor = Arc::new(Executor::new(invoker, &self.config, self.redactor.clone()));
        let scheduler = Scheduler::new(self.config.pool.max_concurrent, FailurePolicy::Drain);
        let scheduled = scheduler
            .run(&plan, executor, observer, cancel.clone())
            .await;

        // Persist node stdout as content-addressed artifacts.
        let artifacts = ArtifactStore::new(self.home.artifacts_dir())?;
        for (node_id, stdout) in &scheduled.stdouts {
            let action = wal.begin(
                "artifact.index",
                json!({ "run_id": run_id, "node_id": node_id }),
            )?;
            artifacts.put(
                stdout.as_bytes(),
                &format!("{node_id}.stdout"),
                &run_id,
                node_id,
            )?;
            wal.complete(action, "artifact.index")?;
        }

        let cancelled = cancel.is_cancelled()
            || scheduled
                .nodes
                .iter()
                .any(|n| n.error_kind == Some(ErrorKind::Cancelled));
        let outcome = if cancelled {
            RunOutcome::Cancelled
        } else if scheduled.any_failed() {
            RunOutcome::Failure
        } else {
            RunOutcome::Success
        };

        // Staging: flush for a successful run, discard otherwise.
        let node_ids: Vec<String> = plan.nodes.iter().map(|n| n.id.clone()).collect();
        if outcome == RunOutcome::Success {
            let action = wal.begin("staging.flush", json!({ "run_id": run_id }))?;
            store.flush_staging(&node_ids)?;
            wal.complete(action, "staging.flush")?;
        } else {
            let action = wal.begin("staging.discard", json!({ "run_id": run_id }))?;
            for node_id in &node_ids {
                store.discard_staging(node_id)?;
            }
            wal.complete(action, "staging.discard")?;
        }

        let completed = scheduled
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Completed)
            .count();
        let rollback_quality = match outcome {
            RunOutcome::Success => 1.0,
            _ if snapshot_saved => 1.0,
            _ => completed as f64 / scheduled.nodes.len().max(1) as f64,
        };

        let finished_at = Utc::now();
        let manifest = RunManifest {
            run_id: run_id.clone(),
            trace_id: trace_id.clone(),
            task: task_redacted,
            model: self.config.claude.model.clone(),
            risk_level: risk,
            sandbox_level: self.config.sandbox.level,
            outcome,
            nodes: scheduled.nodes,
            started_at,
            finished_at,
            rollback_quality,
            cost_estimate,
        };

        let manifest_action = wal.begin("manifest.write", json!({ "run_id": run_id }))?;
        manifest.save(&self.home)?;
        store.finish_run(&run_id, &outcome.to_string(), finished_at)?;
        wal.complete(manifest_action, "manifest.write")?;

        let mut snapshot_retained = false;
        if snapshot_saved {
            if outcome == RunOutcome::Success {
                let action = wal.begin("snapshot.drop", json!({ "run_id": run_id }))?;
                snapshot::drop_ref(&self.home, &run_id)?;
                wal.complete(action, "snapshot.drop")?;
            } else {
                snapshot_retained = true;
                debug!(event = "snapshot.retained", run_id = %run_id);
            }
        }

        audit.append(
            "run.finished",
            json!({ "outcome": outcome.to_string(), "nodes": manifest.nodes.len() }),
            Some(&run_id),
        )?;
        obs::emit_run_finished(
            &run_id,
            &outcome.to_string(),
            (finished_at - started_at).num_milliseconds().max(0) as u64,
        );

        let tag_dir = snapshot::is_git_repo(&self.workdir).then_some(self.workdir.as_path());
        let anchor = audit.anchor_today(tag_dir)?;
        obs::emit_anchor_updated(&anchor.date.to_string(), anchor.record_count);

        Ok(RunReport {
            run_id,
            trace_id,
            risk_level: risk,
            sandbox_level: self.config.sandbox.level,
            warnings,
            gated: None,
            dry_run: false,
            plan: Some(plan),
            cost_estimate,
            snapshot_saved,
            snapshot_retained,
            manifest: Some(manifest),
        })
    }

    fn gated(
        &self,
        audit: &AuditChain,
        run_id: &str,
        trace_id: &str,
        risk: RiskLevel,
        reject: GateReject,
    ) -> Result<RunReport> {
        obs::emit_gate_rejected(&reject.message());
        audit.append(
            "run.gated",
            json!({ "reason": reject.message() }),
            Some(run_id),
        )?;
        Ok(RunReport {
            run_id: run_id.to_string(),
            trace_id: trace_id.to_string(),
            risk_level: risk,
            sandbox_level: self.config.sandbox.level,
            warnings: Vec::new(),
            gated: Some(reject),
            dry_run: false,
            plan: None,
            cost_estimate: 0.0,
            snapshot_saved: false,
            snapshot_retained: false,
            manifest: None,
        })
    }
}

/// Per-model unit estimate, dollars per node invocation.
fn estimate_cost(model: &str, node_count: usize) -> f64 {
    let unit = if model.contains("opus") {
        0.15
    } else if model.contains("haiku") {
        0.01
    } else {
        0.03
    };
    unit * node_count as f64
}

/// Writes one audit entry and one WAL record per node state transition.
struct PipelineObserver {
    audit: AuditChain,
    wal: ActionWal,
    run_id: String,
    open_actions: Mutex<HashMap<String, Uuid>>,
}

impl RunObserver for PipelineObserver {
    fn node_transition(&self, node_id: &str, state: NodeState) {
        obs::emit_node_transition(&self.run_id, node_id, &format!("{state:?}"));
        if let Err(e) = self.audit.append(
            "node.transition",
            json!({ "node_id": node_id, "state": format!("{state:?}").to_uppercase() }),
            Some(&self.run_id),
        ) {
            warn!(event = "audit.append_failed", error = %e);
        }

        let result = match state {
            NodeState::Started => self
                .wal
                .begin("node.execute", json!({ "node_id": node_id }))
                .map(|action| {
                    self.open_actions
                        .lock()
                        .expect("observer lock")
                        .insert(node_id.to_string(), action);
                }),
            NodeState::Completed | NodeState::Failed | NodeState::Skipped => {
                let open = self
                    .open_actions
                    .lock()
                    .expect("observer lock")
                    .remove(node_id);
                match (state, open) {
                    (NodeState::Completed, Some(action)) => {
                        self.wal.complete(action, "node.execute")
                    }
                    (NodeState::Failed, Some(action)) => {
                        self.wal.fail(action, "node.execute", "node failed")
                    }
                    // Skipped nodes never started; open and close one
                    // action so the transition is still journalled.
                    (NodeState::Skipped, _) => self
                        .wal
                        .begin("node.skip", json!({ "node_id": node_id }))
                        .and_then(|action| self.wal.complete(action, "node.skip")),
                    (_, None) => Ok(()),
                    (NodeState::Pending | NodeState::Started, Some(_)) => Ok(()),
                }
            }
            NodeState::Pending => Ok(()),
        };
        if let Err(e) = result {
            warn!(event = "wal.append_failed", error = %e);
        }
    }
}

//! Apex - transactional run orchestrator over an external LLM CLI
//!
//! The `apex` command plans a natural-language task into a DAG, gates it,
//! schedules it over LLM CLI subprocesses, and audits every step.
//!
//! ## Commands
//!
//! - `run`: Execute a task end to end (plan, gate, schedule, audit)
//! - `plan`: Show the DAG a task would be decomposed into
//! - `doctor`: Verify the audit chain, runtime store, and invariants
//! - `kill-switch` / `resume`: Pause and unpause the whole system
//! - `diff`: Compare two run manifests
//! - `status` / `history`: Thin views over recorded runs
//! - `gc`: Collect artifacts outside the retention window

use std::collections::HashSet;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

use apex_core::{
    diff_manifests, ApexConfig, ApexHome, Coordinator, KillSwitchStatus, RunManifest, RunOptions,
    RunOutcome,
};
use apex_store::RuntimeStore;

#[derive(Parser)]
#[command(name = "apex")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Transactional run orchestrator over an external LLM CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a task: plan, gate, schedule, audit
    Run {
        /// Natural-language task to execute
        task: String,

        /// Plan and estimate only; execute nothing
        #[arg(long)]
        dry_run: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Show the DAG a task would be decomposed into
    Plan {
        /// Natural-language task to plan
        task: String,
    },

    /// Verify the audit chain, runtime store, lock, and invariants
    Doctor,

    /// Pause the system: refuse all runs until `resume`
    KillSwitch {
        /// Reason recorded in the switch file
        reason: Option<String>,
    },

    /// Unpause the system
    Resume,

    /// Compare two run manifests field by field
    Diff {
        /// Left run id
        left: String,

        /// Right run id
        right: String,

        /// Output format
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Show kill switch, health, and the most recent run
    Status,

    /// List recent runs
    History {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Collect artifacts whose runs are outside the retention window
    Gc {
        /// Report candidates without deleting anything
        #[arg(long)]
        dry_run: bool,

        /// Keep at most this many recent runs
        #[arg(long)]
        max_runs: Option<usize>,

        /// Keep runs newer than this many days
        #[arg(long)]
        max_age_days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    apex_core::init_tracing(cli.json, level);

    match dispatch(cli.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(command: Commands) -> anyhow::Result<u8> {
    let home = ApexHome::resolve()?;
    let config = ApexConfig::load(&home.config_path())?;

    match command {
        Commands::Run {
            task,
            dry_run,
            format,
        } => cmd_run(home, config, &task, dry_run, format).await,
        Commands::Plan { task } => cmd_plan(home, config, &task).await,
        Commands::Doctor => cmd_doctor(home),
        Commands::KillSwitch { reason } => cmd_kill_switch(home, reason.as_deref()),
        Commands::Resume => cmd_resume(home),
        Commands::Diff {
            left,
            right,
            format,
        } => cmd_diff(home, &left, &right, format),
        Commands::Status => cmd_status(home),
        Commands::History { limit } => cmd_history(home, limit),
        Commands::Gc {
            dry_run,
            max_runs,
            max_age_days,
        } => cmd_gc(home, dry_run, max_runs, max_age_days),
    }
}

async fn cmd_run(
    home: ApexHome,
    config: ApexConfig,
    task: &str,
    dry_run: bool,
    format: OutputFormat,
) -> anyhow::Result<u8> {
    let workdir = std::env::current_dir()?;
    let coordinator = Coordinator::new(home, config, workdir);
    let report = coordinator
        .run(task, &RunOptions { dry_run })
        .await
        .context("run pipeline failed")?;

    if format == OutputFormat::Json {
        let value = serde_json::json!({
            "run_id": report.run_id,
            "trace_id": report.trace_id,
            "risk_level": report.risk_level,
            "sandbox_level": report.sandbox_level,
            "gated": report.gated.as_ref().map(|g| g.message()),
            "dry_run": report.dry_run,
            "cost_estimate": report.cost_estimate,
            "outcome": report.manifest.as_ref().map(|m| m.outcome),
            "nodes": report.manifest.as_ref().map(|m| &m.nodes),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(exit_code(report.exit_code()));
    }

    for warning in &report.warnings {
        println!("{warning}");
    }
    if let Some(reject) = &report.gated {
        println!("{}", reject.message());
        return Ok(exit_code(reject.exit_code()));
    }

    println!("Risk level: {}", report.risk_level);
    println!("Sandbox: {}", report.sandbox_level);
    println!("[trace: {}]", report.trace_id);
    if report.snapshot_saved {
        println!("Snapshot saved");
    }

    if report.dry_run {
        let plan = report.plan.as_ref().expect("dry run always plans");
        println!("DRY RUN: {} node(s) planned", plan.nodes.len());
        println!("{}", serde_json::to_string_pretty(&plan.nodes)?);
        println!("Cost estimate: ${:.2}", report.cost_estimate);
        return Ok(0);
    }

    let manifest = report.manifest.as_ref().expect("terminal run has manifest");
    match manifest.outcome {
        RunOutcome::Success => {
            println!(
                "Done ({} node(s), run {})",
                manifest.nodes.len(),
                report.run_id
            );
        }
        RunOutcome::Failure => {
            let failed: Vec<&str> = manifest
                .nodes
                .iter()
                .filter(|n| n.error.is_some())
                .map(|n| n.id.as_str())
                .collect();
            println!("Run failed (nodes: {})", failed.join(", "));
        }
        RunOutcome::Cancelled => println!("Run cancelled"),
    }
    if report.snapshot_retained {
        println!("Snapshot retained for rollback");
    }
    Ok(exit_code(report.exit_code()))
}

async fn cmd_plan(home: ApexHome, config: ApexConfig, task: &str) -> anyhow::Result<u8> {
    let workdir = std::env::current_dir()?;
    let coordinator = Coordinator::new(home, config, workdir);
    let outcome = coordinator.plan_only(task).await?;
    if outcome.used_fallback {
        println!(
            "Planner fell back to a single node ({})",
            outcome.fallback_reason.as_deref().unwrap_or("unknown")
        );
    }
    println!("{}", serde_json::to_string_pretty(&outcome.plan.nodes)?);
    Ok(0)
}

fn cmd_doctor(home: ApexHome) -> anyhow::Result<u8> {
    let report = apex_core::diagnose(&home, std::sync::Arc::new(apex_core::Redactor::from_env()))?;
    print!("{}", report.render());
    // Doctor is a reporting tool: findings are not process failures.
    Ok(0)
}

fn cmd_kill_switch(home: ApexHome, reason: Option<&str>) -> anyhow::Result<u8> {
    match apex_core::activate_kill_switch(&home, reason)? {
        KillSwitchStatus::Activated => {
            println!("Kill switch ACTIVATED{}", reason_suffix(reason));
        }
        KillSwitchStatus::AlreadyActive => println!("Kill switch already active"),
        _ => unreachable!("activate returns activation states"),
    }
    Ok(0)
}

fn reason_suffix(reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!(" ({reason})"),
        None => String::new(),
    }
}

fn cmd_resume(home: ApexHome) -> anyhow::Result<u8> {
    match apex_core::deactivate_kill_switch(&home)? {
        KillSwitchStatus::Deactivated => println!("Kill switch DEACTIVATED"),
        KillSwitchStatus::NotActive => println!("No kill switch active"),
        _ => unreachable!("deactivate returns deactivation states"),
    }
    Ok(0)
}

fn cmd_diff(home: ApexHome, left: &str, right: &str, format: OutputFormat) -> anyhow::Result<u8> {
    let left_manifest =
        RunManifest::load(&home, left).with_context(|| format!("loading manifest {left}"))?;
    let right_manifest =
        RunManifest::load(&home, right).with_context(|| format!("loading manifest {right}"))?;

    let diff = diff_manifests(&left_manifest, &right_manifest);
    match format {
        OutputFormat::Human => print!("{}", diff.render_human()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&diff)?),
    }
    Ok(0)
}

fn cmd_status(home: ApexHome) -> anyhow::Result<u8> {
    if apex_core::kill_switch_active(&home) {
        println!("Kill switch: ACTIVE");
    } else {
        println!("Kill switch: inactive");
    }

    let health = apex_core::system_health(&home, std::sync::Arc::new(apex_core::Redactor::from_env()));
    println!("System Health: {health}");

    if RuntimeStore::exists(home.runtime_dir()) {
        let store = RuntimeStore::open_read_only(home.runtime_dir())?;
        match store.list_runs(1)?.first() {
            Some(run) => println!(
                "Last run: {} [{}] {}",
                run.run_id,
                run.outcome.as_deref().unwrap_or("in flight"),
                run.task
            ),
            None => println!("Last run: none"),
        }
    } else {
        println!("Last run: none");
    }
    Ok(0)
}

fn cmd_history(home: ApexHome, limit: usize) -> anyhow::Result<u8> {
    if !RuntimeStore::exists(home.runtime_dir()) {
        println!("No runs recorded");
        return Ok(0);
    }
    let store = RuntimeStore::open_read_only(home.runtime_dir())?;
    let runs = store.list_runs(limit)?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(0);
    }
    for run in runs {
        println!(
            "{}  {}  [{}] risk={}  {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.run_id,
            run.outcome.as_deref().unwrap_or("in flight"),
            run.risk_level,
            run.task
        );
    }
    Ok(0)
}

fn cmd_gc(
    home: ApexHome,
    dry_run: bool,
    max_runs: Option<usize>,
    max_age_days: Option<i64>,
) -> anyhow::Result<u8> {
    let runs = if RuntimeStore::exists(home.runtime_dir()) {
        RuntimeStore::open_read_only(home.runtime_dir())?.list_runs(100_000)?
    } else {
        Vec::new()
    };

    // list_runs is newest-first; retention keeps the newest window.
    let cutoff = max_age_days.map(|days| chrono::Utc::now() - chrono::Duration::days(days));
    let retained: HashSet<String> = runs
        .iter()
        .filter(|r| cutoff.map(|c| r.started_at >= c).unwrap_or(true))
        .take(max_runs.unwrap_or(usize::MAX))
        .map(|r| r.run_id.clone())
        .collect();

    let store = apex_core::ArtifactStore::new(home.artifacts_dir())?;
    let report = store.gc(&retained, dry_run)?;

    if dry_run {
        println!(
            "DRY RUN: {} artifact(s) outside retention",
            report.candidates.len()
        );
        for candidate in &report.candidates {
            println!("  {} {} (run {})", candidate.hash, candidate.name, candidate.run_id);
        }
    } else {
        println!(
            "Collected {} artifact(s), {} blob(s) deleted",
            report.candidates.len(),
            report.deleted_blobs.len()
        );
    }
    Ok(0)
}

fn exit_code(code: i32) -> u8 {
    code.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_clamps_into_u8_range() {
        assert_eq!(exit_code(0), 0);
        assert_eq!(exit_code(1), 1);
        assert_eq!(exit_code(-7), 0);
        assert_eq!(exit_code(4096), 255);
    }

    #[test]
    fn reason_suffix_formats() {
        assert_eq!(reason_suffix(None), "");
        assert_eq!(reason_suffix(Some("maintenance")), " (maintenance)");
    }

    #[test]
    fn cli_parses_core_commands() {
        use clap::Parser;
        let cli = Cli::try_parse_from(["apex", "run", "say hello", "--dry-run"]).unwrap();
        match cli.command {
            Commands::Run { task, dry_run, .. } => {
                assert_eq!(task, "say hello");
                assert!(dry_run);
            }
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["apex", "diff", "run-aaa", "run-bbb", "--format", "json"])
            .unwrap();
        match cli.command {
            Commands::Diff { format, .. } => assert_eq!(format, OutputFormat::Json),
            _ => panic!("expected diff"),
        }

        // Missing args are a parse error, surfaced as a non-zero exit.
        assert!(Cli::try_parse_from(["apex", "run"]).is_err());
    }
}

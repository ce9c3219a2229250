//! Structured observability hooks for the Apex run lifecycle.
//!
//! Emission functions for key lifecycle events: start, admission, node
//! transitions, finish, anchor update. Events carry an `event = "..."`
//! field, are emitted at `info!`/`warn!` level, and are filtered via
//! `RUST_LOG`.

use tracing::{info, warn};

/// Emit event: run admitted and started.
pub fn emit_run_started(run_id: &str, risk_level: &str) {
    info!(event = "run.started", run_id = %run_id, risk_level = %risk_level);
}

/// Emit event: admission gate vetoed the run.
pub fn emit_gate_rejected(reason: &str) {
    warn!(event = "gate.rejected", reason = %reason);
}

/// Emit event: a node reached a new state.
pub fn emit_node_transition(run_id: &str, node_id: &str, state: &str) {
    info!(event = "node.transition", run_id = %run_id, node_id = %node_id, state = %state);
}

/// Emit event: run finished with its outcome.
pub fn emit_run_finished(run_id: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: planner fell back to the single-node fast path.
pub fn emit_planner_fallback(run_id: &str, reason: &str) {
    warn!(event = "planner.fallback", run_id = %run_id, reason = %reason);
}

/// Emit event: daily anchor rewritten.
pub fn emit_anchor_updated(date: &str, record_count: u64) {
    info!(event = "audit.anchored", date = %date, record_count = record_count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitters_do_not_panic_without_subscriber() {
        emit_run_started("run-test", "LOW");
        emit_node_transition("run-test", "task_1", "COMPLETED");
        emit_run_finished("run-test", "success", 12);
        emit_gate_rejected("[HEALTH] System health RED");
        emit_planner_fallback("run-test", "parse failed");
        emit_anchor_updated("2026-08-01", 2);
    }
}

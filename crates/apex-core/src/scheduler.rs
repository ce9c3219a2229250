//! Topological concurrent execution of a plan.
//!
//! Ready nodes (all dependencies COMPLETED) are spawned onto a bounded
//! worker pool in declaration order. The first failure marks every
//! transitive dependent SKIPPED; under the default `Drain` policy,
//! independent in-flight nodes finish before the run is declared failed,
//! while `CancelAll` fires the shared cancellation token instead.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::executor::{NodeExecution, NodeRunner};
use crate::manifest::{NodeResult, NodeState};
use crate::plan::Plan;

/// What to do with independent in-flight work after the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Let unrelated in-flight nodes finish (default).
    #[default]
    Drain,
    /// Cancel everything still running.
    CancelAll,
}

/// Callback for per-node state transitions; the coordinator wires this to
/// the audit chain and the WAL.
pub trait RunObserver: Send + Sync {
    fn node_transition(&self, node_id: &str, state: NodeState);
}

/// Observer that records nothing.
pub struct NoopObserver;

impl RunObserver for NoopObserver {
    fn node_transition(&self, _node_id: &str, _state: NodeState) {}
}

/// Everything the scheduler produced for one plan.
#[derive(Debug)]
pub struct ScheduleOutcome {
    /// Node results in plan declaration order.
    pub nodes: Vec<NodeResult>,
    /// Redacted stdout per completed node id.
    pub stdouts: HashMap<String, String>,
}

impl ScheduleOutcome {
    pub fn any_failed(&self) -> bool {
        self.nodes.iter().any(|n| n.state == NodeState::Failed)
    }
}

/// Bounded-concurrency DAG scheduler.
pub struct Scheduler {
    max_concurrent: usize,
    policy: FailurePolicy,
}

impl Scheduler {
    pub fn new(max_concurrent: usize, policy: FailurePolicy) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            policy,
        }
    }

    /// Execute the plan to quiescence.
    ///
    /// The plan must already be validated; unknown dependency ids would
    /// panic here rather than misschedule.
    pub async fn run(
        &self,
        plan: &Plan,
        runner: Arc<dyn NodeRunner>,
        observer: Arc<dyn RunObserver>,
        cancel: CancellationToken,
    ) -> ScheduleOutcome {
        let n = plan.nodes.len();
        let idx_of: HashMap<&str, usize> = plan
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.as_str(), i))
            .collect();

        let mut states: Vec<NodeState> = vec![NodeState::Pending; n];
        let mut results: Vec<Option<NodeResult>> = vec![None; n];
        let mut stdouts: HashMap<String, String> = HashMap::new();
        let mut workers: JoinSet<(usize, NodeExecution)> = JoinSet::new();
        let mut in_flight = 0usize;

        loop {
            if !cancel.is_cancelled() {
                // Spawn ready nodes in declaration order up to the cap.
                for i in 0..n {
                    if in_flight >= self.max_concurrent {
                        break;
                    }
                    if states[i] != NodeState::Pending {
                        continue;
                    }
                    let ready = plan.nodes[i]
                        .depends
                        .iter()
                        .all(|dep| states[idx_of[dep.as_str()]] == NodeState::Completed);
                    if !ready {
                        continue;
                    }

                    states[i] = NodeState::Started;
                    observer.node_transition(&plan.nodes[i].id, NodeState::Started);
                    debug!(event = "scheduler.spawn", node_id = %plan.nodes[i].id);

                    let node = plan.nodes[i].clone();
                    let runner = Arc::clone(&runner);
                    let token = cancel.clone();
                    workers.spawn(async move {
                        let execution = runner.run_node(&node, &token).await;
                        (i, execution)
                    });
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                break;
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            let (i, execution) = joined.expect("scheduler worker panicked");
            in_flight -= 1;

            let state = execution.result.state;
            states[i] = state;
            observer.node_transition(&plan.nodes[i].id, state);
            if let Some(stdout) = execution.stdout {
                stdouts.insert(plan.nodes[i].id.clone(), stdout);
            }
            results[i] = Some(execution.result);

            if state == NodeState::Failed {
                warn!(event = "scheduler.node_failed", node_id = %plan.nodes[i].id);
                for dep_id in plan.transitive_dependents(&plan.nodes[i].id) {
                    let j = idx_of[dep_id.as_str()];
                    if states[j] == NodeState::Pending {
                        states[j] = NodeState::Skipped;
                        observer.node_transition(&dep_id, NodeState::Skipped);
                        results[j] = Some(NodeResult::skipped(
                            &plan.nodes[j].id,
                            &plan.nodes[j].task,
                            &plan.nodes[j].depends,
                        ));
                    }
                }
                if self.policy == FailurePolicy::CancelAll {
                    cancel.cancel();
                }
            }
        }

        // Anything still pending never became ready (cancellation, or an
        // upstream terminal state other than COMPLETED).
        let nodes = plan
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                results[i].take().unwrap_or_else(|| {
                    observer.node_transition(&node.id, NodeState::Skipped);
                    NodeResult::skipped(&node.id, &node.task, &node.depends)
                })
            })
            .collect();

        ScheduleOutcome { nodes, stdouts }
    }
}

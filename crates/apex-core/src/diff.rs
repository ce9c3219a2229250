//! Field-by-field comparison of two run manifests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::manifest::RunManifest;

/// One differing field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDelta {
    pub left: Value,
    pub right: Value,
}

/// All differences between two manifests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestDiff {
    pub left_run_id: String,
    pub right_run_id: String,
    pub fields: BTreeMap<String, FieldDelta>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Render for terminals: `field: left → right` per differing field.
    pub fn render_human(&self) -> String {
        let mut out = format!("diff {} {}\n", self.left_run_id, self.right_run_id);
        if self.fields.is_empty() {
            out.push_str("  no differences\n");
            return out;
        }
        for (field, delta) in &self.fields {
            out.push_str(&format!(
                "  {field}: {} → {}\n",
                render_value(&delta.left),
                render_value(&delta.right)
            ));
        }
        out
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compare the run-level fields plus a per-node state summary.
pub fn diff_manifests(left: &RunManifest, right: &RunManifest) -> ManifestDiff {
    let mut fields = BTreeMap::new();

    let mut compare = |name: &str, l: Value, r: Value| {
        if l != r {
            fields.insert(name.to_string(), FieldDelta { left: l, right: r });
        }
    };

    compare("task", json!(left.task), json!(right.task));
    compare("model", json!(left.model), json!(right.model));
    compare("risk_level", json!(left.risk_level), json!(right.risk_level));
    compare(
        "sandbox_level",
        json!(left.sandbox_level),
        json!(right.sandbox_level),
    );
    compare("outcome", json!(left.outcome), json!(right.outcome));
    compare(
        "rollback_quality",
        json!(left.rollback_quality),
        json!(right.rollback_quality),
    );
    compare(
        "cost_estimate",
        json!(left.cost_estimate),
        json!(right.cost_estimate),
    );
    compare(
        "node_count",
        json!(left.nodes.len()),
        json!(right.nodes.len()),
    );

    let node_states = |manifest: &RunManifest| -> Value {
        json!(manifest
            .nodes
            .iter()
            .map(|n| format!("{}={:?}", n.id, n.state))
            .collect::<Vec<_>>())
    };
    compare("node_states", node_states(left), node_states(right));

    ManifestDiff {
        left_run_id: left.run_id.clone(),
        right_run_id: right.run_id.clone(),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxLevel;
    use crate::manifest::{NodeResult, NodeState, RunOutcome};
    use crate::risk::RiskLevel;
    use chrono::Utc;

    fn manifest(run_id: &str, model: &str, outcome: RunOutcome) -> RunManifest {
        RunManifest {
            run_id: run_id.to_string(),
            trace_id: "t".to_string(),
            task: "say hello".to_string(),
            model: model.to_string(),
            risk_level: RiskLevel::Low,
            sandbox_level: SandboxLevel::None,
            outcome,
            nodes: vec![NodeResult {
                id: "task_1".to_string(),
                task: "say hello".to_string(),
                depends_on: vec![],
                state: NodeState::Completed,
                attempt_count: 1,
                stdout_digest: None,
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
    fn differing_model_and_outcome_are_reported() {
        let left = manifest("run-aaa", "claude-sonnet-4", RunOutcome::Success);
        let right = manifest("run-bbb", "claude-opus-4", RunOutcome::Failure);

        let diff = diff_manifests(&left, &right);
        assert_eq!(diff.left_run_id, "run-aaa");
        assert_eq!(diff.right_run_id, "run-bbb");
        assert!(diff.fields.contains_key("model"));
        assert!(diff.fields.contains_key("outcome"));
        assert!(!diff.fields.contains_key("task"));

        let human = diff.render_human();
        assert!(human.contains("claude-sonnet-4"));
        assert!(human.contains("claude-opus-4"));
        assert!(human.contains("success"));
        assert!(human.contains("failure"));
    }

    #[test]
    fn identical_manifests_have_empty_fields() {
        let left = manifest("run-aaa", "m", RunOutcome::Success);
        let mut right = left.clone();
        right.run_id = "run-bbb".to_string();

        let diff = diff_manifests(&left, &right);
        assert!(diff.is_empty());
        assert!(diff.render_human().contains("no differences"));
    }

    #[test]
    fn json_shape_is_stable() {
        let left = manifest("run-aaa", "a", RunOutcome::Success);
        let right = manifest("run-bbb", "b", RunOutcome::Success);
        let diff = diff_manifests(&left, &right);

        let value = serde_json::to_value(&diff).unwrap();
        assert!(value.get("left_run_id").is_some());
        assert!(value.get("right_run_id").is_some());
        assert!(value.get("fields").is_some());
        assert_eq!(value["fields"]["model"]["left"], "a");
        assert_eq!(value["fields"]["model"]["right"], "b");
    }
}

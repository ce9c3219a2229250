//! Task plans: the DAG the scheduler executes.
//!
//! Nodes live in an ordered array and reference each other by id string;
//! there are no pointer-like back-references. Validation runs Kahn's
//! algorithm for cycle detection.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use thiserror::Error;

/// One unit of work in a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanNode {
    /// Unique id within the plan, e.g. `task_1`.
    pub id: String,

    /// Natural-language task for the executor.
    pub task: String,

    /// Ids of nodes that must complete first.
    #[serde(default, alias = "depends_on")]
    pub depends: Vec<String>,
}

/// An ordered, validated set of plan nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub nodes: Vec<PlanNode>,
}

/// Plan validation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no nodes")]
    Empty,

    #[error("empty node id")]
    EmptyId,

    #[error("duplicate node id: {0}")]
    DuplicateId(String),

    #[error("node {node} depends on unknown id: {dep}")]
    UnknownDependency { node: String, dep: String },

    #[error("node {0} depends on itself")]
    SelfLoop(String),

    #[error("dependency cycle involving: {0}")]
    Cycle(String),
}

impl Plan {
    /// The single-node fast-path plan.
    pub fn single(task: &str) -> Self {
        Self {
            nodes: vec![PlanNode {
                id: "task_1".to_string(),
                task: task.to_string(),
                depends: Vec::new(),
            }],
        }
    }

    /// Validate ids, dependency references, self-loops, and acyclicity.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.nodes.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(PlanError::EmptyId);
            }
            if !ids.insert(node.id.as_str()) {
                return Err(PlanError::DuplicateId(node.id.clone()));
            }
        }

        for node in &self.nodes {
            for dep in &node.depends {
                if dep == &node.id {
                    return Err(PlanError::SelfLoop(node.id.clone()));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        node: node.id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm: repeatedly remove zero-in-degree nodes; leftovers
    /// are on a cycle.
    fn check_acyclic(&self) -> Result<(), PlanError> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.depends.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for dep in &node.depends {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(node.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;

        while let Some(id) = queue.pop_front() {
            visited += 1;
            for dependent in dependents.get(id).into_iter().flatten() {
                let entry = in_degree.get_mut(dependent).expect("known id");
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited == self.nodes.len() {
            Ok(())
        } else {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            let mut stuck = stuck;
            stuck.sort_unstable();
            Err(PlanError::Cycle(stuck.join(", ")))
        }
    }

    /// Ids of all nodes transitively depending on `root`.
    pub fn transitive_dependents(&self, root: &str) -> HashSet<String> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for dep in &node.depends {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(node.id.as_str());
            }
        }

        let mut out = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(root);
        while let Some(id) = queue.pop_front() {
            for dependent in dependents.get(id).into_iter().flatten() {
                if out.insert(dependent.to_string()) {
                    queue.push_back(dependent);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, depends: &[&str]) -> PlanNode {
        PlanNode {
            id: id.to_string(),
            task: format!("do {id}"),
            depends: depends.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn single_plan_is_valid() {
        let plan = Plan::single("say hello");
        assert_eq!(plan.nodes.len(), 1);
        assert_eq!(plan.nodes[0].id, "task_1");
        plan.validate().unwrap();
    }

    #[test]
    fn diamond_is_valid() {
        let plan = Plan {
            nodes: vec![
                node("a", &[]),
                node("b", &["a"]),
                node("c", &["a"]),
                node("d", &["b", "c"]),
            ],
        };
        plan.validate().unwrap();
    }

    #[test]
    fn empty_plan_rejected() {
        let plan = Plan { nodes: vec![] };
        assert_eq!(plan.validate(), Err(PlanError::Empty));
    }

    #[test]
    fn duplicate_id_rejected() {
        let plan = Plan {
            nodes: vec![node("a", &[]), node("a", &[])],
        };
        assert_eq!(plan.validate(), Err(PlanError::DuplicateId("a".into())));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let plan = Plan {
            nodes: vec![node("a", &["ghost"])],
        };
        assert_eq!(
            plan.validate(),
            Err(PlanError::UnknownDependency {
                node: "a".into(),
                dep: "ghost".into()
            })
        );
    }

    #[test]
    fn self_loop_rejected() {
        let plan = Plan {
            nodes: vec![node("a", &["a"])],
        };
        assert_eq!(plan.validate(), Err(PlanError::SelfLoop("a".into())));
    }

    #[test]
    fn two_node_cycle_rejected() {
        let plan = Plan {
            nodes: vec![node("a", &["b"]), node("b", &["a"])],
        };
        match plan.validate() {
            Err(PlanError::Cycle(ids)) => {
                assert!(ids.contains('a') && ids.contains('b'));
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn transitive_dependents_cover_the_subtree() {
        let plan = Plan {
            nodes: vec![
                node("a", &[]),
                node("b", &["a"]),
                node("c", &["b"]),
                node("d", &[]),
            ],
        };
        let downstream = plan.transitive_dependents("a");
        assert!(downstream.contains("b"));
        assert!(downstream.contains("c"));
        assert!(!downstream.contains("d"));
        assert!(!downstream.contains("a"));
    }

    #[test]
    fn depends_on_alias_accepted() {
        let plan: Plan = serde_json::from_str(
            r#"{"nodes":[{"id":"x","task":"t","depends_on":["y"]},{"id":"y","task":"t"}]}"#,
        )
        .unwrap();
        assert_eq!(plan.nodes[0].depends, vec!["y".to_string()]);
        plan.validate().unwrap();
    }
}

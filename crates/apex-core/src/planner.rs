//! Task decomposition: single-node fast path or an LLM-produced DAG.
//!
//! Short tasks without multi-step connective clustering never invoke the
//! LLM. Everything the LLM path produces is validated (unique ids, known
//! dependencies, acyclic); any parse or validation failure falls back to
//! the fast path so a bad plan can never block a run.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ApexConfig;
use crate::executor::LlmInvoker;
use crate::plan::{Plan, PlanNode};

/// Prompt prefix signalling planner mode to the CLI.
const PLANNER_SYSTEM_PROMPT: &str =
    "You are a task planner. Decompose the task below into a JSON array of \
     nodes, each {\"id\": string, \"task\": string, \"depends\": [ids]}. \
     Reply with the JSON array only.";

/// Connective phrases whose presence marks a task as multi-step.
const CONNECTIVES: &[&str] = &["first", "then", "finally", "after that"];

/// Tasks longer than this always take the LLM path.
const FAST_PATH_MAX_LEN: usize = 240;

/// A produced plan plus whether the fast-path fallback was used in place
/// of a failed LLM plan.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub used_fallback: bool,
    pub fallback_reason: Option<String>,
}

impl PlanOutcome {
    fn fast_path(task: &str) -> Self {
        Self {
            plan: Plan::single(task),
            used_fallback: false,
            fallback_reason: None,
        }
    }

    fn fallback(task: &str, reason: String) -> Self {
        Self {
            plan: Plan::single(task),
            used_fallback: true,
            fallback_reason: Some(reason),
        }
    }
}

/// Heuristic: does the task text look like more than one step?
pub fn is_multi_step(task: &str) -> bool {
    let lower = task.to_lowercase();
    if lower.contains("after that") {
        return true;
    }
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has_connective = CONNECTIVES
        .iter()
        .filter(|c| !c.contains(' '))
        .any(|c| words.contains(c));
    let and_count = words.iter().filter(|w| **w == "and").count();

    has_connective || and_count >= 2 || task.len() > FAST_PATH_MAX_LEN
}

/// Decides between the fast path and the LLM path.
pub struct Planner {
    invoker: Arc<dyn LlmInvoker>,
    model: String,
    timeout: Duration,
}

impl Planner {
    pub fn new(invoker: Arc<dyn LlmInvoker>, config: &ApexConfig) -> Self {
        Self {
            invoker,
            model: config.planner.model.clone(),
            timeout: Duration::from_secs(config.planner.timeout),
        }
    }

    /// Produce a validated plan for the task.
    pub async fn plan(&self, task: &str, cancel: &CancellationToken) -> PlanOutcome {
        if !is_multi_step(task) {
            return PlanOutcome::fast_path(task);
        }

        let prompt = format!("{PLANNER_SYSTEM_PROMPT}\n\nTask: {task}");
        let invoked = self
            .invoker
            .invoke(&prompt, &self.model, self.timeout, cancel)
            .await;

        let reason = match invoked {
            Ok(output) if output.exit_code == 0 => match parse_plan(&output.stdout) {
                Ok(plan) => match plan.validate() {
                    Ok(()) => {
                        return PlanOutcome {
                            plan,
                            used_fallback: false,
                            fallback_reason: None,
                        }
                    }
                    Err(e) => format!("plan validation failed: {e}"),
                },
                Err(e) => format!("plan parse failed: {e}"),
            },
            Ok(output) => format!("planner exited {}", output.exit_code),
            Err(e) => format!("planner invocation failed: {e:?}"),
        };

        warn!(event = "planner.fallback", reason = %reason);
        PlanOutcome::fallback(task, reason)
    }
}

/// Parse the CLI's stdout into plan nodes.
///
/// Accepts a bare JSON array, a fenced code block, a `{"nodes": [...]}`
/// wrapper object, or an array embedded in surrounding prose.
fn parse_plan(stdout: &str) -> Result<Plan, String> {
    let text = strip_code_fences(stdout.trim());

    if let Ok(nodes) = serde_json::from_str::<Vec<PlanNode>>(text) {
        return Ok(Plan { nodes });
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        if let Some(nodes) = value.get("nodes") {
            if let Ok(nodes) = serde_json::from_value::<Vec<PlanNode>>(nodes.clone()) {
                return Ok(Plan { nodes });
            }
        }
    }

    if let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) {
        if start < end {
            if let Ok(nodes) = serde_json::from_str::<Vec<PlanNode>>(&text[start..=end]) {
                return Ok(Plan { nodes });
            }
        }
    }

    Err("no JSON node array in planner output".to_string())
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") on the opening fence line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CliOutput, InvokeError};
    use async_trait::async_trait;

    struct ScriptedInvoker {
        stdout: String,
        exit_code: i32,
    }

    #[async_trait]
    impl LlmInvoker for ScriptedInvoker {
        async fn invoke(
            &self,
            _prompt: &str,
            _model: &str,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<CliOutput, InvokeError> {
            Ok(CliOutput {
                stdout: self.stdout.clone(),
                stderr: String::new(),
                exit_code: self.exit_code,
            })
        }
    }

    fn planner_with(stdout: &str, exit_code: i32) -> Planner {
        Planner::new(
            Arc::new(ScriptedInvoker {
                stdout: stdout.to_string(),
                exit_code,
            }),
            &ApexConfig::default(),
        )
    }

    #[test]
    fn short_tasks_are_single_step() {
        assert!(!is_multi_step("say hello"));
        assert!(!is_multi_step("summarize the README"));
    }

    #[test]
    fn connectives_mark_multi_step() {
        assert!(is_multi_step("first fetch the data, then summarize it"));
        assert!(is_multi_step("build the index and after that publish it"));
        assert!(is_multi_step(
            "fetch the data and clean it and publish the summary"
        ));
    }

    #[test]
    fn single_and_is_not_clustering() {
        assert!(!is_multi_step("compare apples and oranges"));
    }

    #[test]
    fn very_long_tasks_take_the_llm_path() {
        let long_task = "x".repeat(FAST_PATH_MAX_LEN + 1);
        assert!(is_multi_step(&long_task));
    }

    #[tokio::test]
    async fn fast_path_produces_single_node_without_invoking() {
        let planner = planner_with("should never be read", 0);
        let outcome = planner
            .plan("say hello", &CancellationToken::new())
            .await;
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.plan.nodes.len(), 1);
        assert_eq!(outcome.plan.nodes[0].id, "task_1");
        assert_eq!(outcome.plan.nodes[0].task, "say hello");
    }

    #[tokio::test]
    async fn llm_path_parses_a_dag() {
        let stdout = r#"[
            {"id": "fetch", "task": "fetch the data", "depends": []},
            {"id": "clean", "task": "clean the data", "depends": ["fetch"]},
            {"id": "report", "task": "write the report", "depends": ["clean"]}
        ]"#;
        let planner = planner_with(stdout, 0);
        let outcome = planner
            .plan(
                "first fetch the data, then clean it, finally write a report",
                &CancellationToken::new(),
            )
            .await;
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.plan.nodes.len(), 3);
        assert_eq!(outcome.plan.nodes[1].depends, vec!["fetch".to_string()]);
    }

    #[tokio::test]
    async fn fenced_output_is_accepted() {
        let stdout = "```json\n[{\"id\":\"a\",\"task\":\"t\",\"depends\":[]}]\n```";
        let planner = planner_with(stdout, 0);
        let outcome = planner
            .plan(
                "first do one thing, then do the other",
                &CancellationToken::new(),
            )
            .await;
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.plan.nodes.len(), 1);
    }

    #[tokio::test]
    async fn garbage_output_falls_back_to_single_node() {
        let planner = planner_with("I cannot decompose that, sorry!", 0);
        let task = "first do one thing, then do the other";
        let outcome = planner.plan(task, &CancellationToken::new()).await;
        assert!(outcome.used_fallback);
        assert_eq!(outcome.plan.nodes.len(), 1);
        assert_eq!(outcome.plan.nodes[0].task, task);
        assert!(outcome.fallback_reason.unwrap().contains("parse failed"));
    }

    #[tokio::test]
    async fn cyclic_plan_falls_back() {
        let stdout = r#"[
            {"id": "a", "task": "t", "depends": ["b"]},
            {"id": "b", "task": "t", "depends": ["a"]}
        ]"#;
        let planner = planner_with(stdout, 0);
        let outcome = planner
            .plan(
                "first do one thing, then do the other",
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.used_fallback);
        assert!(outcome
            .fallback_reason
            .unwrap()
            .contains("validation failed"));
    }

    #[tokio::test]
    async fn planner_exit_failure_falls_back() {
        let planner = planner_with("", 1);
        let outcome = planner
            .plan(
                "first do one thing, then do the other",
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.used_fallback);
        assert!(outcome.fallback_reason.unwrap().contains("exited 1"));
    }

    #[test]
    fn parse_plan_accepts_wrapper_object() {
        let plan = parse_plan(r#"{"nodes": [{"id": "x", "task": "t"}]}"#).unwrap();
        assert_eq!(plan.nodes.len(), 1);
    }

    #[test]
    fn parse_plan_extracts_embedded_array() {
        let plan =
            parse_plan(r#"Here is the plan: [{"id": "x", "task": "t"}] enjoy"#).unwrap();
        assert_eq!(plan.nodes.len(), 1);
    }
}

//! LLM CLI executor: subprocess spawn, failure classification, retry.
//!
//! Each node invocation is one-shot: spawn the CLI with the node task as
//! prompt, capture stdout/stderr (capped), classify any failure from exit
//! code and stderr lexemes, and retry retriable failures on an exponential
//! backoff schedule. Cancellation is checked before every attempt and
//! interrupts backoff sleeps and subprocess waits.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ApexConfig, RetryConfig, SandboxLevel};
use crate::manifest::{ErrorKind, NodeResult, NodeState};
use crate::plan::PlanNode;
use crate::redact::Redactor;

/// Cap on captured stdout/stderr per attempt.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Virtual-memory cap applied under the `ulimit` sandbox level, in KiB.
const ULIMIT_VMEM_KB: u64 = 4 * 1024 * 1024;

/// System instruction prepended to every executor prompt.
const EXECUTOR_SYSTEM_PROMPT: &str =
    "You are an execution agent. Perform exactly the task given, then reply \
     with the result as JSON ({\"result\": ...}) or plain text.";

/// Stderr lexemes classified as transient.
const RETRIABLE_LEXEMES: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "429",
    "overloaded",
    "temporarily unavailable",
    "connection reset",
    "connection refused",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "500",
    "502",
    "503",
    "504",
];

/// Stderr lexemes classified as fatal regardless of exit code.
const FATAL_LEXEMES: &[&str] = &[
    "permission denied",
    "unauthorized",
    "authentication",
    "invalid",
    "no such file",
    "not found",
];

/// Raw output of one CLI invocation.
#[derive(Debug, Clone)]
pub struct CliOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Failures of the invocation mechanism itself (not of the CLI's work).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The per-attempt timeout elapsed; the subprocess was killed.
    Timeout,
    /// The cancellation token fired during the wait.
    Cancelled,
    /// The subprocess could not be spawned.
    Spawn(String),
}

/// Seam between the executor/planner and the actual LLM CLI.
#[async_trait]
pub trait LlmInvoker: Send + Sync {
    async fn invoke(
        &self,
        prompt: &str,
        model: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CliOutput, InvokeError>;
}

/// Spawns the configured LLM CLI binary as a subprocess.
pub struct CliInvoker {
    binary: String,
    sandbox: SandboxLevel,
}

impl CliInvoker {
    pub fn new(config: &ApexConfig) -> Self {
        Self {
            binary: config.claude_binary().to_string(),
            sandbox: config.sandbox.level,
        }
    }

    pub fn with_binary(binary: &str, sandbox: SandboxLevel) -> Self {
        Self {
            binary: binary.to_string(),
            sandbox,
        }
    }

    fn command(&self) -> Command {
        match self.sandbox {
            SandboxLevel::Ulimit => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c")
                    .arg(format!("ulimit -v {ULIMIT_VMEM_KB}; exec \"$0\" \"$@\""))
                    .arg(&self.binary);
                cmd
            }
            // Container enforcement belongs to the surrounding deployment;
            // the invocation itself is identical to `none`.
            SandboxLevel::None | SandboxLevel::Container => Command::new(&self.binary),
        }
    }
}

#[async_trait]
impl LlmInvoker for CliInvoker {
    async fn invoke(
        &self,
        prompt: &str,
        model: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CliOutput, InvokeError> {
        let mut cmd = self.command();
        cmd.arg("-p")
            .arg(prompt)
            .arg("--model")
            .arg(model)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Ok(token) = std::env::var("CLAUDE_CODE_OAUTH_TOKEN") {
            cmd.env("CLAUDE_CODE_OAUTH_TOKEN", token);
        }

        let child = cmd
            .spawn()
            .map_err(|e| InvokeError::Spawn(format!("{}: {e}", self.binary)))?;

        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.map_err(|e| InvokeError::Spawn(e.to_string()))?
            }
            _ = tokio::time::sleep(timeout) => return Err(InvokeError::Timeout),
            _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
        };

        Ok(CliOutput {
            stdout: truncate_capture(&output.stdout),
            stderr: truncate_capture(&output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

fn truncate_capture(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_CAPTURE_BYTES {
        text.into_owned()
    } else {
        let mut end = MAX_CAPTURE_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

/// Classify a non-zero exit into retriable vs fatal.
///
/// Fatal lexemes win over retriable ones ("permission denied ... timeout"
/// must not be retried). Unrecognized stderr is fatal: only failures the
/// table recognizes as transient earn another subprocess spawn.
pub fn classify_failure(exit_code: i32, stderr: &str) -> ErrorKind {
    let lower = stderr.to_lowercase();
    if FATAL_LEXEMES.iter().any(|l| lower.contains(l)) {
        return ErrorKind::Fatal;
    }
    // Exit 2 is the CLI's usage/permission class; transient wording there
    // does not earn a retry.
    if exit_code != 2 && RETRIABLE_LEXEMES.iter().any(|l| lower.contains(l)) {
        return ErrorKind::Retriable;
    }
    ErrorKind::Fatal
}

/// Delay before the retry following `attempt` (1-based).
pub fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exp = retry.init_delay_seconds * retry.multiplier.powi(attempt.saturating_sub(1) as i32);
    Duration::from_secs_f64(exp.min(retry.max_delay_seconds).max(0.0))
}

/// A finished node plus its captured stdout (for artifact storage).
#[derive(Debug, Clone)]
pub struct NodeExecution {
    pub result: NodeResult,
    /// Redacted stdout of the successful attempt.
    pub stdout: Option<String>,
}

/// Seam the scheduler drives; implemented by [`Executor`] and by test fakes.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    async fn run_node(&self, node: &PlanNode, cancel: &CancellationToken) -> NodeExecution;
}

/// Production node runner: CLI invocations with the retry schedule.
pub struct Executor {
    invoker: Arc<dyn LlmInvoker>,
    retry: RetryConfig,
    timeout: Duration,
    model: String,
    redactor: Arc<Redactor>,
}

impl Executor {
    pub fn new(
        invoker: Arc<dyn LlmInvoker>,
        config: &ApexConfig,
        redactor: Arc<Redactor>,
    ) -> Self {
        Self {
            invoker,
            retry: config.retry.clone(),
            timeout: Duration::from_secs(config.claude.timeout),
            model: config.claude.model.clone(),
            redactor,
        }
    }

    fn base_result(node: &PlanNode) -> NodeResult {
        NodeResult {
            id: node.id.clone(),
            task: node.task.clone(),
            depends_on: node.depends.clone(),
            state: NodeState::Started,
            attempt_count: 0,
            stdout_digest: None,
            error: None,
            error_kind: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    fn finish(mut result: NodeResult, state: NodeState) -> NodeResult {
        result.state = state;
        result.finished_at = Some(Utc::now());
        result
    }
}

#[async_trait]
impl NodeRunner for Executor {
    async fn run_node(&self, node: &PlanNode, cancel: &CancellationToken) -> NodeExecution {
        let mut result = Self::base_result(node);
        let prompt = format!("{EXECUTOR_SYSTEM_PROMPT}\n\nTask: {}", node.task);

        loop {
            if cancel.is_cancelled() {
                result.error = Some("cancelled before attempt".to_string());
                result.error_kind = Some(ErrorKind::Cancelled);
                return NodeExecution {
                    result: Self::finish(result, NodeState::Failed),
                    stdout: None,
                };
            }

            result.attempt_count += 1;
            let attempt = result.attempt_count;
            debug!(event = "node.attempt", node_id = %node.id, attempt = attempt);

            let invoked = self
                .invoker
                .invoke(&prompt, &self.model, self.timeout, cancel)
                .await;

            let (error, kind) = match invoked {
                Ok(output) if output.exit_code == 0 => {
                    let stdout = self.redactor.redact_str(&output.stdout);
                    let mut hasher = Sha256::new();
                    hasher.update(stdout.as_bytes());
                    result.stdout_digest = Some(hex::encode(hasher.finalize()));
                    return NodeExecution {
                        result: Self::finish(result, NodeState::Completed),
                        stdout: Some(stdout),
                    };
                }
                Ok(output) => {
                    let kind = classify_failure(output.exit_code, &output.stderr);
                    let stderr = self.redactor.redact_str(&output.stderr);
                    warn!(
                        event = "node.attempt_failed",
                        node_id = %node.id,
                        exit_code = output.exit_code,
                        retriable = matches!(kind, ErrorKind::Retriable),
                    );
                    (
                        format!("exit {}: {}", output.exit_code, stderr.trim()),
                        kind,
                    )
                }
                Err(InvokeError::Timeout) => (
                    format!("attempt timed out after {:?}", self.timeout),
                    ErrorKind::Retriable,
                ),
                Err(InvokeError::Cancelled) => {
                    result.error = Some("cancelled during attempt".to_string());
                    result.error_kind = Some(ErrorKind::Cancelled);
                    return NodeExecution {
                        result: Self::finish(result, NodeState::Failed),
                        stdout: None,
                    };
                }
                Err(InvokeError::Spawn(msg)) => (msg, ErrorKind::Fatal),
            };

            let retriable = matches!(kind, ErrorKind::Retriable);
            if retriable && attempt < self.retry.max_attempts {
                let delay = backoff_delay(&self.retry, attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = cancel.cancelled() => {
                        result.error = Some("cancelled during backoff".to_string());
                        result.error_kind = Some(ErrorKind::Cancelled);
                        return NodeExecution {
                            result: Self::finish(result, NodeState::Failed),
                            stdout: None,
                        };
                    }
                }
            }

            result.error = Some(error);
            result.error_kind = Some(kind);
            return NodeExecution {
                result: Self::finish(result, NodeState::Failed),
                stdout: None,
            };
        }
    }
}

//! Lexical risk classification of task text.
//!
//! Tier keyword tables are matched case-insensitively at word boundaries
//! against the task string (and each planned node's task). The highest
//! matching tier wins; text matching nothing is LOW.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Risk tier of a task, ordered LOW < MEDIUM < HIGH < CRITICAL.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(RiskLevel::Low),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "HIGH" => Ok(RiskLevel::High),
            "CRITICAL" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

const CRITICAL_KEYWORDS: &[&str] = &[
    "rm -rf",
    "mkfs",
    "dd if=",
    "drop database",
    "force push",
    "force-push",
    "wipe",
    "format disk",
    "shutdown",
    "reboot",
];

const HIGH_KEYWORDS: &[&str] = &[
    "delete",
    "remove",
    "drop table",
    "drop",
    "truncate",
    "deploy",
    "production",
    "credentials",
    "secret",
    "token",
    "sudo",
    "chmod",
    "migrate",
    "rollback",
];

const MEDIUM_KEYWORDS: &[&str] = &[
    "modify",
    "update",
    "write",
    "edit",
    "install",
    "rename",
    "move",
    "refactor",
    "push",
    "merge",
    "commit",
];

/// Word-boundary keyword matcher over the three non-LOW tiers.
pub struct RiskClassifier {
    critical: Vec<Regex>,
    high: Vec<Regex>,
    medium: Vec<Regex>,
}

impl RiskClassifier {
    pub fn new() -> Self {
        Self {
            critical: compile(CRITICAL_KEYWORDS),
            high: compile(HIGH_KEYWORDS),
            medium: compile(MEDIUM_KEYWORDS),
        }
    }

    /// Classify a task string into a risk tier.
    pub fn classify(&self, task: &str) -> RiskLevel {
        if self.critical.iter().any(|re| re.is_match(task)) {
            RiskLevel::Critical
        } else if self.high.iter().any(|re| re.is_match(task)) {
            RiskLevel::High
        } else if self.medium.iter().any(|re| re.is_match(task)) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Highest tier across a task and its planned node tasks.
    pub fn classify_all<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> RiskLevel {
        texts
            .into_iter()
            .map(|t| self.classify(t))
            .max()
            .unwrap_or(RiskLevel::Low)
    }
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-insensitive, word-boundary-anchored regex per keyword. Boundaries
/// are only attached next to word characters; "dd if=" keeps its bare edge.
fn compile(keywords: &[&str]) -> Vec<Regex> {
    keywords
        .iter()
        .map(|kw| {
            let escaped = regex::escape(kw);
            let lead = if kw.starts_with(|c: char| c.is_alphanumeric() || c == '_') {
                r"\b"
            } else {
                ""
            };
            let trail = if kw.ends_with(|c: char| c.is_alphanumeric() || c == '_') {
                r"\b"
            } else {
                ""
            };
            Regex::new(&format!("(?i){lead}{escaped}{trail}")).expect("static keyword regex")
        })
        .collect()
}

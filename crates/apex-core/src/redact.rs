//! Secret redaction for everything that reaches disk.
//!
//! Applied before audit hashing and before stdout/stderr lands in manifests
//! or the WAL, so the tamper-evident chain covers the public, redacted view.

use regex::Regex;
use serde_json::Value;

/// The literal every matched secret is replaced with.
pub const REDACTED: &str = "[REDACTED]";

/// Environment variable names whose values are treated as credentials.
const SECRET_ENV_PATTERN: &str = r"(?i)(TOKEN|SECRET|PASSWORD|API_KEY)";

/// Minimum length of an env value before it is treated as a secret; shorter
/// values cause too many false positives in ordinary prose.
const MIN_ENV_SECRET_LEN: usize = 8;

/// Replaces secret-shaped byte ranges with [`REDACTED`].
pub struct Redactor {
    patterns: Vec<Regex>,
    env_values: Vec<String>,
}

impl Redactor {
    /// Build a redactor with the standard pattern set plus the values of
    /// credential-named variables from the current process environment.
    pub fn from_env() -> Self {
        let env_re = Regex::new(SECRET_ENV_PATTERN).expect("static regex");
        let env_values = std::env::vars()
            .filter(|(name, value)| env_re.is_match(name) && value.len() >= MIN_ENV_SECRET_LEN)
            .map(|(_, value)| value)
            .collect();
        Self::with_env_values(env_values)
    }

    /// Build a redactor with explicit credential values (test seam).
    pub fn with_env_values(env_values: Vec<String>) -> Self {
        let patterns = vec![
            // Bearer tokens in headers or prose.
            Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=\-]{8,}").expect("static regex"),
            // API-key shapes: sk-... and friends.
            Regex::new(r"\bsk-[A-Za-z0-9_\-]{16,}\b").expect("static regex"),
            // key=value / key: value credential assignments.
            Regex::new(r#"(?i)\b(api[_-]?key|token|secret|password|credential)s?\s*[=:]\s*["']?[^\s"']{6,}["']?"#)
                .expect("static regex"),
            // Long high-entropy hex blobs (private key material, digest leaks).
            Regex::new(r"\b[0-9a-fA-F]{48,}\b").expect("static regex"),
        ];
        Self {
            patterns,
            env_values,
        }
    }

    /// Redact a string.
    pub fn redact_str(&self, input: &str) -> String {
        let mut out = input.to_string();
        for value in &self.env_values {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), REDACTED);
            }
        }
        for pattern in &self.patterns {
            out = pattern.replace_all(&out, REDACTED).into_owned();
        }
        out
    }

    /// Redact every string leaf of a JSON value.
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact_str(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.redact_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare() -> Redactor {
        Redactor::with_env_values(Vec::new())
    }

    #[test]
    fn bearer_token_is_redacted() {
        let out = bare().redact_str("Authorization: Bearer abc123def456xyz");
        assert!(out.contains(REDACTED));
        assert!(!out.contains("abc123def456xyz"));
    }

    #[test]
    fn sk_key_is_redacted() {
        let out = bare().redact_str("use sk-ant4f8a9b2c3d4e5f6a7b8 for auth");
        assert!(out.contains(REDACTED));
        assert!(!out.contains("sk-ant4f8a9b2c3d4e5f6a7b8"));
    }

    #[test]
    fn key_value_assignment_is_redacted() {
        let out = bare().redact_str("set API_KEY=supersecretvalue then run");
        assert!(out.contains(REDACTED));
        assert!(!out.contains("supersecretvalue"));
    }

    #[test]
    fn env_sourced_value_is_redacted_anywhere() {
        let redactor = Redactor::with_env_values(vec!["hunter2hunter2".to_string()]);
        let out = redactor.redact_str("the password is hunter2hunter2, don't tell");
        assert!(out.contains(REDACTED));
        assert!(!out.contains("hunter2hunter2"));
    }

    #[test]
    fn plain_text_is_untouched() {
        let input = "say hello to the world";
        assert_eq!(bare().redact_str(input), input);
    }

    #[test]
    fn json_string_leaves_are_redacted() {
        let value = serde_json::json!({
            "task": "rotate token=verysecretthing now",
            "nested": { "items": ["Bearer aaaabbbbccccdddd"] },
            "count": 3,
        });
        let out = bare().redact_value(&value);
        let rendered = out.to_string();
        assert!(!rendered.contains("verysecretthing"));
        assert!(!rendered.contains("aaaabbbbccccdddd"));
        assert_eq!(out["count"], 3);
    }

    #[test]
    fn short_env_values_are_not_collected() {
        // Values under the length floor never make it into the replacement
        // set, so common short words stay intact.
        let redactor = Redactor::with_env_values(
            vec!["ok".to_string()]
                .into_iter()
                .filter(|v| v.len() >= MIN_ENV_SECRET_LEN)
                .collect(),
        );
        assert_eq!(redactor.redact_str("ok then"), "ok then");
    }
}

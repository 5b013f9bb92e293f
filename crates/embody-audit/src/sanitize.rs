//! Parameter sanitization before anything reaches the audit log.

use embody_core::truncate_to_boundary;
use serde_json::{Map, Value};

/// Default longest string kept verbatim, in bytes.
pub const DEFAULT_PREVIEW_LEN: usize = 256;

/// Replacement for secret values.
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEY_PARTS: [&str; 4] = ["password", "token", "secret", "key"];

/// Redacts secrets and truncates long strings in tool parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sanitizer {
    preview_len: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_LEN)
    }
}

impl Sanitizer {
    /// Create a sanitizer with the given preview length.
    #[must_use]
    pub fn new(preview_len: usize) -> Self {
        Self { preview_len }
    }

    /// Preview length in bytes.
    #[must_use]
    pub fn preview_len(&self) -> usize {
        self.preview_len
    }

    /// Sanitize a parameter tree.
    ///
    /// Any value stored under a key containing `password`, `token`, `secret`
    /// or `key` (case-insensitive) is replaced whole, including nested
    /// objects. Strings longer than the preview length are cut on a UTF-8
    /// boundary and suffixed with `…`.
    #[must_use]
    pub fn sanitize(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.preview(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize(v)).collect()),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    let cleaned = if is_sensitive(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        self.sanitize(item)
                    };
                    out.insert(key.clone(), cleaned);
                }
                Value::Object(out)
            },
            other => other.clone(),
        }
    }

    fn preview(&self, s: &str) -> String {
        if s.len() <= self.preview_len {
            return s.to_string();
        }
        let mut cut = truncate_to_boundary(s, self.preview_len).to_string();
        cut.push('…');
        cut
    }
}

fn is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| lower.contains(part))
}

/// Sanitize with the default preview length.
#[must_use]
pub fn sanitize_parameters(value: &Value) -> Value {
    Sanitizer::default().sanitize(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacts_sensitive_keys_case_insensitive() {
        let params = json!({
            "path": "/workspace/app.env",
            "Password": "hunter2",
            "api_key": "abc",
            "AUTH_TOKEN": {"nested": "x"},
            "clientSecret": ["a", "b"],
            "options": {"sshKey": "-----BEGIN", "depth": 2}
        });
        let clean = sanitize_parameters(&params);
        assert_eq!(clean["path"], "/workspace/app.env");
        assert_eq!(clean["Password"], REDACTED);
        assert_eq!(clean["api_key"], REDACTED);
        assert_eq!(clean["AUTH_TOKEN"], REDACTED);
        assert_eq!(clean["clientSecret"], REDACTED);
        assert_eq!(clean["options"]["sshKey"], REDACTED);
        assert_eq!(clean["options"]["depth"], 2);
    }

    #[test]
    fn test_truncates_long_strings_on_boundary() {
        let sanitizer = Sanitizer::new(5);
        let clean = sanitizer.sanitize(&json!({"content": "caféteria", "short": "ok"}));
        // 'é' spans bytes 3..5, so a 5-byte cut keeps it whole.
        assert_eq!(clean["content"], "café…");
        assert_eq!(clean["short"], "ok");

        let clean = Sanitizer::new(4).sanitize(&json!(["café"]));
        assert_eq!(clean[0], "caf…");
    }

    #[test]
    fn test_scalars_untouched() {
        let params = json!({"count": 3, "flag": true, "none": null, "ratio": 0.5});
        assert_eq!(sanitize_parameters(&params), params);
    }
}

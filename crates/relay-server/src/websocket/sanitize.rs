//! Payload scrubbing applied to every outbound event.
//!
//! Object keys matching the redaction list (ASCII case-insensitive, exact)
//! have their values replaced by [`REDACTED`] at any depth. Strings longer
//! than `max_field_chars` characters are cut to that many characters and
//! suffixed with `...`.

use std::collections::HashSet;

use serde_json::{Map, Value};

/// Replacement for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Appended to truncated strings.
pub const ELLIPSIS: &str = "...";

/// Redaction and truncation policy.
#[derive(Clone, Debug)]
pub struct Sanitizer {
    redacted_keys: HashSet<String>,
    max_field_chars: usize,
}

impl Sanitizer {
    /// Build from a key list and a per-string character limit.
    pub fn new<I, S>(redacted_keys: I, max_field_chars: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            redacted_keys: redacted_keys
                .into_iter()
                .map(|k| k.as_ref().to_ascii_lowercase())
                .collect(),
            max_field_chars,
        }
    }

    /// Character limit for string values.
    pub fn max_field_chars(&self) -> usize {
        self.max_field_chars
    }

    /// Whether values under `key` are redacted.
    pub fn is_redacted_key(&self, key: &str) -> bool {
        self.redacted_keys.contains(&key.to_ascii_lowercase())
    }

    /// Scrub an arbitrary JSON value.
    pub fn sanitize(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.truncate(s)),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.sanitize(v)).collect()),
            Value::Object(map) => Value::Object(self.sanitize_map(map)),
            other => other,
        }
    }

    /// Scrub every entry of an object.
    pub fn sanitize_map(&self, map: Map<String, Value>) -> Map<String, Value> {
        map.into_iter()
            .map(|(k, v)| {
                let v = if self.is_redacted_key(&k) {
                    Value::String(REDACTED.to_owned())
                } else {
                    self.sanitize(v)
                };
                (k, v)
            })
            .collect()
    }

    /// Cut `s` to `max_field_chars` characters plus [`ELLIPSIS`].
    pub fn truncate(&self, s: String) -> String {
        match s.char_indices().nth(self.max_field_chars) {
            Some((byte_idx, _)) => {
                let mut cut = s;
                cut.truncate(byte_idx);
                cut.push_str(ELLIPSIS);
                cut
            }
            None => s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sanitizer() -> Sanitizer {
        Sanitizer::new(["api_key", "password", "token"], 200)
    }

    #[test]
    fn redacts_secrets_and_keeps_safe_fields() {
        let input = json!({
            "api_key": "sk-123",
            "password": "hunter2",
            "safe": "visible",
            "long": "x".repeat(501),
        });
        let out = sanitizer().sanitize(input);
        assert_eq!(out["api_key"], REDACTED);
        assert_eq!(out["password"], REDACTED);
        assert_eq!(out["safe"], "visible");

        let long = out["long"].as_str().unwrap();
        assert_eq!(long.chars().count(), 203);
        assert!(long.ends_with("..."));
        assert!(long.starts_with(&"x".repeat(200)));
    }

    #[test]
    fn redaction_is_case_insensitive_and_exact() {
        let out = sanitizer().sanitize(json!({"API_KEY": "a", "Password": "b", "api_key_hint": "c"}));
        assert_eq!(out["API_KEY"], REDACTED);
        assert_eq!(out["Password"], REDACTED);
        assert_eq!(out["api_key_hint"], "c");
    }

    #[test]
    fn nested_objects_and_arrays() {
        let out = sanitizer().sanitize(json!({
            "config": {"token": "t", "depth": {"password": {"nested": true}}},
            "items": [{"api_key": "k"}, "short"],
        }));
        assert_eq!(out["config"]["token"], REDACTED);
        assert_eq!(out["config"]["depth"]["password"], REDACTED);
        assert_eq!(out["items"][0]["api_key"], REDACTED);
        assert_eq!(out["items"][1], "short");
    }

    #[test]
    fn exactly_at_limit_is_untouched() {
        let s = "y".repeat(200);
        assert_eq!(sanitizer().truncate(s.clone()), s);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let s = "é".repeat(250);
        let out = sanitizer().truncate(s);
        assert_eq!(out.chars().count(), 203);
        assert!(out.starts_with(&"é".repeat(200)));
    }

    #[test]
    fn non_string_scalars_pass_through() {
        let out = sanitizer().sanitize(json!({"n": 5, "b": true, "z": null}));
        assert_eq!(out, json!({"n": 5, "b": true, "z": null}));
    }
}

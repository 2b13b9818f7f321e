//! Config redaction: safe-to-display config snapshots.
//!
//! Masks credentials embedded in URLs and any field whose name marks it as a
//! secret.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static SECRET_KEYS: &[&str] = &["password", "secret", "token"];

/// `scheme://credentials@` prefix of a URL.
static URL_CREDENTIALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<scheme>[a-z][a-z0-9+.-]*://)[^/@]+@").unwrap());

/// Redact a config JSON value, replacing secrets with `"***"`.
pub fn redact(value: &Value) -> Value {
    redact_recursive(value, "")
}

fn is_sensitive_key(key: &str) -> bool {
    SECRET_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
}

fn redact_string(s: &str, key: &str) -> Value {
    if is_sensitive_key(key) && !s.is_empty() {
        return Value::String("***".to_string());
    }
    Value::String(URL_CREDENTIALS.replace(s, "${scheme}***@").into_owned())
}

fn redact_recursive(value: &Value, key: &str) -> Value {
    match value {
        Value::String(s) => redact_string(s, key),
        Value::Array(arr) => Value::Array(arr.iter().map(|v| redact_recursive(v, key)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_recursive(v, k)))
                .collect(),
        ),
        other => other.clone(),
    }
}

//! Censoring of secrets before request and response bodies reach the logs.

use serde_json::Value;

pub const REDACTED: &str = "*****";

/// Field names whose values never appear in logs, at any nesting depth.
pub const SENSITIVE_FIELDS: &[&str] = &[
    "email",
    "password",
    "access_key_id",
    "security_key",
    "secret_access_key",
    "X-Api-Key",
    "Authorization",
    "access_token",
    "refresh_token",
];

fn is_sensitive(key: &str) -> bool {
    SENSITIVE_FIELDS
        .iter()
        .any(|field| field.eq_ignore_ascii_case(key))
}

/// Returns a copy of `value` with every sensitive field replaced by [`REDACTED`].
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let inner = if is_sensitive(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(inner)
                    };
                    (key.clone(), inner)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Redacts a header value by name.
pub fn redact_header<'a>(name: &str, value: &'a str) -> &'a str {
    if is_sensitive(name) { REDACTED } else { value }
}

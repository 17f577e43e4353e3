//! Parameter-map canonicalization.
//!
//! The canonical form of a request is `k1=v1&k2=v2&…` with keys sorted
//! lexicographically, skipping the `sign` key and any empty-string or null
//! value. String values render verbatim; numbers and booleans render as
//! their JSON literal; nested objects and arrays render as compact JSON
//! with their keys in insertion order (the signer on the other side built
//! the same JSON, so insertion order is the stable order).

use serde_json::{Map, Value};

/// The key excluded from the canonical form.
pub const SIGN_KEY: &str = "sign";

/// Render one value for the canonical string, or `None` to skip the pair.
fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(_) | Value::Array(_) => Some(
            serde_json::to_string(value)
                .expect("serializing a Value never fails"),
        ),
    }
}

/// Canonicalize a parameter map for signing or verification.
pub fn canonicalize(params: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = params
        .keys()
        .filter(|k| k.as_str() != SIGN_KEY)
        .collect();
    keys.sort_unstable();

    let mut out = String::new();
    for key in keys {
        let Some(rendered) = render(&params[key.as_str()]) else {
            continue;
        };
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(&rendered);
    }
    out
}

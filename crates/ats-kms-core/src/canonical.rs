//! Canonical JSON serialization
//!
//! Producer and verifier of the audit chain must agree on one byte-exact
//! rendering. The rule set: object keys in lexicographic byte order, arrays
//! in element order, JSON string escapes, shortest-round-trip decimal
//! numbers, no insignificant whitespace.

use serde_json::Value;

use crate::error::{KmsError, Result};

/// Render a JSON value in canonical form
pub fn to_canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_value(&mut out, value)?;
    Ok(out)
}

/// Serialize any serde value, then render it canonically
pub fn canonicalize<T: serde::Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_value(value)
        .map_err(|e| KmsError::internal(format!("canonicalization failed: {e}")))?;
    to_canonical_json(&json)
}

fn write_value(out: &mut String, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders integers via itoa and floats via ryu, which is
        // the shortest-round-trip rule this format requires.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            let escaped = serde_json::to_string(s)
                .map_err(|e| KmsError::internal(format!("string escape failed: {e}")))?;
            out.push_str(&escaped);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let escaped = serde_json::to_string(key)
                    .map_err(|e| KmsError::internal(format!("key escape failed: {e}")))?;
                out.push_str(&escaped);
                out.push(':');
                write_value(out, &map[key.as_str()])?;
            }
            out.push('}');
        }
    }
    Ok(())
}

// canonical.rs — Deterministic JSON serialization for signing and pinning
//
// Canonical JSON: sorted object keys, compact format (no whitespace),
// standard JSON string escaping. Metadata carries only strings, integers,
// booleans and null, so floating-point values are rejected outright rather
// than normalized.
//
// RULE: signatures cover canonical(signed), and length/hash pins cover
// canonical(envelope). Files on disk are written in canonical form, so the
// bytes a client fetches are the bytes that were pinned.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Serialize any payload to canonical JSON bytes.
pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(payload).map_err(|e| Error::Encoding(e.to_string()))?;
    Ok(canonical_json(&value)?.into_bytes())
}

/// Canonical text of a JSON value. Fails with `Error::Encoding` on any
/// non-integer number.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) if n.is_i64() || n.is_u64() => out.push_str(&n.to_string()),
        Value::Number(n) => {
            return Err(Error::Encoding(format!(
                "non-integer number {n} has no canonical form"
            )))
        }
        Value::String(s) => write_string(s, out)?,
        Value::Array(items) => {
            out.push('[');
            for (n, item) in items.iter().enumerate() {
                if n > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // serde_json::Map keeps insertion order when preserve_order is
            // enabled anywhere in the dependency graph, so sort explicitly.
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (n, (key, item)) in entries.into_iter().enumerate() {
                if n > 0 {
                    out.push(',');
                }
                write_string(key, out)?;
                out.push(':');
                write_value(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_string(s: &str, out: &mut String) -> Result<()> {
    let escaped = serde_json::to_string(s).map_err(|e| Error::Encoding(e.to_string()))?;
    out.push_str(&escaped);
    Ok(())
}

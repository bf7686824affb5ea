//! Canonical content hashing.
//!
//! Values are rendered to a compact JSON form with object keys sorted
//! lexically at every depth, then SHA-256 hashed and hex-encoded. Two
//! structurally equal values always produce the same digest, whatever order
//! their maps were built in.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::SyncError;

/// Hash any serialisable value.
pub fn hash<T: Serialize + ?Sized>(value: &T) -> Result<String, SyncError> {
    Ok(hash_value(&serde_json::to_value(value)?))
}

/// Hash an already-built JSON value.
pub fn hash_value(value: &Value) -> String {
    let canonical = canonical_json(value);
    let mut h = Sha256::new();
    h.update(canonical.as_bytes());
    hex::encode(h.finalize())
}

/// `true` when `previous` is empty (never synced) or differs from `current`.
pub fn hash_changed(previous: &str, current: &str) -> bool {
    previous.is_empty() || previous != current
}

/// Compact JSON with sorted object keys.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        // Scalars have exactly one JSON rendering.
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_owned()).to_string());
}

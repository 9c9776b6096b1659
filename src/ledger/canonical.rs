//! Canonical payload serialization and hashing.
//!
//! Idempotency keys and payload hashes are SHA-256 over a deterministic
//! serialization: object keys sorted, no whitespace, serde_json's stable
//! number formatting. Binary media referenced by URL are expected to be
//! represented in the payload by their own SHA-256, so the canonical form
//! never embeds bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value deterministically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
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
        other => {
            out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
        }
    }
}

/// SHA-256 over the canonical serialization, hex encoded.
pub fn payload_hash(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value).as_bytes()))
}

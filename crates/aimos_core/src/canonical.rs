//! Canonical JSON encoding and content digests.
//!
//! # Invariants
//! - Object keys are emitted in sorted order at every nesting level.
//! - Output is compact (no insignificant whitespace).
//! - Equal values always produce byte-identical output.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serializes `value` into canonical JSON.
///
/// Routing through `serde_json::Value` re-keys every object into a sorted map,
/// so struct field order does not leak into the encoding.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&sort_value(value))
}

/// SHA-256 hex digest of the canonical JSON form of `value`.
pub fn canonical_digest<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let encoded = canonical_json(value)?;
    Ok(sha256_hex(encoded.as_bytes()))
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.into_iter().collect::<Vec<_>>();
            entries.sort_by(|left, right| left.0.cmp(&right.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, sort_value(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

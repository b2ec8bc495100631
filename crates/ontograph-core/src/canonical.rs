//! Canonical JSON and content hashing.
//!
//! All persisted JSON documents and all hashed schema blobs go through
//! `canonical_json` so that hashes are stable across runtimes: object keys
//! sorted, compact separators.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{OntoError, Result};

/// Recursively sort all object keys in a JSON value.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<&String, &Value> = map.iter().collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialize a JSON value canonically (sorted keys, tight separators).
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).expect("canonical JSON serialization is infallible")
}

/// Content hash (SHA-256 hex string).
///
/// The inner field is private so the string is always valid lowercase hex
/// produced by [`ContentHash::of_bytes`] or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute the SHA-256 hash of the given bytes.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentHash(hex::encode(hasher.finalize()))
    }

    /// Hash a JSON value through its canonical serialization.
    pub fn of_json(value: &Value) -> Self {
        Self::of_bytes(canonical_json(value).as_bytes())
    }

    /// Full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentHash {
    type Error = OntoError;

    fn try_from(s: String) -> Result<Self> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(OntoError::Serialization(format!("invalid content hash: {s}")));
        }
        Ok(ContentHash(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

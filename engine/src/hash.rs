//! Content fingerprints for cheap change detection.
//!
//! A fingerprint is the SHA-256 of an item's canonical JSON form with volatile
//! fields removed. Object keys are sorted at every level, so the fingerprint
//! does not depend on field serialization order.

use crate::error::HashError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Top-level fields excluded from fingerprints by default.
pub const DEFAULT_VOLATILE_FIELDS: &[&str] = &["updatedAt", "lastViewedAt"];

/// Hex-encoded SHA-256 content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes fingerprints over the synchronization-relevant fields of an item.
#[derive(Debug, Clone)]
pub struct HashManager {
    volatile_fields: Vec<String>,
}

impl Default for HashManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HashManager {
    /// Create a hash manager ignoring [`DEFAULT_VOLATILE_FIELDS`].
    pub fn new() -> Self {
        Self::with_volatile_fields(DEFAULT_VOLATILE_FIELDS.iter().copied())
    }

    /// Create a hash manager ignoring the given top-level fields.
    pub fn with_volatile_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            volatile_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Fingerprint a value.
    pub fn hash<T: Serialize + ?Sized>(&self, item: &T) -> Result<ContentHash, HashError> {
        let mut value =
            serde_json::to_value(item).map_err(|e| HashError::NotSerializable(e.to_string()))?;

        if let Value::Object(map) = &mut value {
            for field in &self.volatile_fields {
                map.remove(field);
            }
        }

        let bytes = serde_json::to_vec(&canonicalize(value))
            .map_err(|e| HashError::NotSerializable(e.to_string()))?;

        Ok(ContentHash(hex::encode(Sha256::digest(&bytes))))
    }

    /// Check whether a value no longer matches a known fingerprint.
    pub fn has_changed<T: Serialize + ?Sized>(
        &self,
        item: &T,
        known: &ContentHash,
    ) -> Result<bool, HashError> {
        Ok(&self.hash(item)? != known)
    }
}

/// Rebuild objects with sorted keys so the byte form is independent of the
/// map implementation serde_json was compiled with.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect::<Map<String, Value>>())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

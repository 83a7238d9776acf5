//! Persisted engine state.
//!
//! A snapshot holds the change queue and the item cache so that offline
//! mutations survive a restart. The optimistic overlay and pending conflicts
//! are not persisted. Maps are `BTreeMap`s so the JSON form is deterministic.

use crate::{
    error::Result, CacheEntry, ChangeQueue, DirtyChange, DirtyTracker, Error, ItemId,
    SyncOperation, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Serializable engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// When the snapshot was taken
    pub saved_at: Timestamp,
    /// Queued operations in order
    pub operations: Vec<SyncOperation>,
    /// Completed-operation counter
    #[serde(default)]
    pub completed_operations: u64,
    /// Cached items by id
    pub cache: BTreeMap<ItemId, CacheEntry>,
    /// Unsynced edits by id
    pub dirty: BTreeMap<ItemId, DirtyChange>,
    /// End of the last sync cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<Timestamp>,
}

impl SyncSnapshot {
    /// Create an empty snapshot.
    pub fn new(saved_at: Timestamp) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            saved_at,
            operations: Vec::new(),
            completed_operations: 0,
            cache: BTreeMap::new(),
            dirty: BTreeMap::new(),
            last_sync: None,
        }
    }

    /// Capture the queue and cache.
    pub fn capture(
        queue: &ChangeQueue,
        cache: &DirtyTracker,
        last_sync: Option<Timestamp>,
        saved_at: Timestamp,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            saved_at,
            operations: queue.operations().to_vec(),
            completed_operations: queue.completed_count(),
            cache: cache
                .entries()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            dirty: cache
                .dirty_entries()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            last_sync,
        }
    }

    /// Rebuild the queue from this snapshot.
    pub fn queue(&self, max_retries: u32) -> ChangeQueue {
        ChangeQueue::restore(self.operations.clone(), self.completed_operations, max_retries)
    }

    /// Rebuild the cache from this snapshot.
    pub fn tracker(&self, max_size: usize) -> DirtyTracker {
        DirtyTracker::restore(
            self.cache.iter().map(|(k, v)| (k.clone(), v.clone())),
            self.dirty.iter().map(|(k, v)| (k.clone(), v.clone())),
            max_size,
        )
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for op in &self.operations {
            if !ids.insert(op.id.as_str()) {
                return Err(Error::InvalidSnapshot(format!(
                    "duplicate operation id: {}",
                    op.id
                )));
            }
        }

        for key in self.dirty.keys() {
            if !self.cache.contains_key(key) {
                return Err(Error::InvalidSnapshot(format!(
                    "dirty change without cache entry: {key}"
                )));
            }
        }

        for (key, entry) in &self.cache {
            if &entry.data.id != key {
                return Err(Error::InvalidSnapshot(format!(
                    "cache key {key} holds item {}",
                    entry.data.id
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        // Validate format version
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        snapshot.validate()?;
        Ok(snapshot)
    }
}

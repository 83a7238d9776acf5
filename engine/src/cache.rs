//! Cache of confirmed items plus the dirty map of unsynced local edits.
//!
//! The cache is bounded by `max_size`. When an insertion exceeds the bound,
//! clean entries are evicted oldest first. Dirty entries are never evicted,
//! so the cache may temporarily grow past its bound.

use crate::{error::Result, ContentItem, Error, ItemId, ItemPatch, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A cached item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Last server-confirmed version
    pub data: ContentItem,
    /// When this entry was last synced or observed
    pub timestamp: Timestamp,
    /// Whether unsynced local edits exist for this item
    pub dirty: bool,
}

/// Unsynced edits for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyChange {
    /// Accumulated edits
    pub patch: ItemPatch,
    /// Bumped on every edit; lets a sync confirm only what it actually sent
    pub revision: u64,
}

/// Bounded item cache with dirty-change tracking.
#[derive(Debug, Clone)]
pub struct DirtyTracker {
    entries: HashMap<ItemId, CacheEntry>,
    dirty: HashMap<ItemId, DirtyChange>,
    max_size: usize,
    next_revision: u64,
}

impl DirtyTracker {
    /// Create an empty tracker.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dirty: HashMap::new(),
            max_size,
            next_revision: 0,
        }
    }

    /// Rebuild a tracker from persisted state. Dirty changes without a cache
    /// entry are dropped, since there is nothing to apply them to.
    pub fn restore(
        entries: impl IntoIterator<Item = (ItemId, CacheEntry)>,
        dirty: impl IntoIterator<Item = (ItemId, DirtyChange)>,
        max_size: usize,
    ) -> Self {
        let mut tracker = Self::new(max_size);
        tracker.entries = entries.into_iter().collect();
        for (key, change) in dirty {
            if let Some(entry) = tracker.entries.get_mut(&key) {
                entry.dirty = true;
                tracker.next_revision = tracker.next_revision.max(change.revision);
                tracker.dirty.insert(key, change);
            }
        }
        for (key, entry) in tracker.entries.iter_mut() {
            if !tracker.dirty.contains_key(key) {
                entry.dirty = false;
            }
        }
        tracker
    }

    /// Nominal maximum number of entries.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Record the server's version of an item. Entries with unsynced edits
    /// keep their confirmed base until the edits are resolved.
    pub fn observe(&mut self, item: ContentItem, now: Timestamp) {
        match self.entries.get_mut(&item.id) {
            Some(entry) if entry.dirty => {}
            Some(entry) => {
                entry.data = item;
                entry.timestamp = now;
            }
            None => self.insert(item, now),
        }
    }

    /// Store a version the server just confirmed for a sync of this item.
    pub fn confirm(&mut self, item: ContentItem, now: Timestamp) {
        match self.entries.get_mut(&item.id) {
            Some(entry) => {
                entry.data = item;
                entry.timestamp = now;
            }
            None => self.insert(item, now),
        }
    }

    fn insert(&mut self, item: ContentItem, now: Timestamp) {
        let key = item.id.clone();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                data: item,
                timestamp: now,
                dirty: false,
            },
        );
        self.evict_if_needed(&key);
    }

    fn evict_if_needed(&mut self, keep: &str) {
        while self.entries.len() > self.max_size {
            let oldest_clean = self
                .entries
                .iter()
                .filter(|(key, entry)| !entry.dirty && key.as_str() != keep)
                .min_by(|(ka, a), (kb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| ka.cmp(kb)))
                .map(|(key, _)| key.clone());

            match oldest_clean {
                Some(key) => {
                    self.entries.remove(&key);
                    debug!(item_id = %key, "Evicted clean cache entry");
                }
                None => break,
            }
        }
    }

    /// Record a local edit for a cached item.
    ///
    /// Returns the new revision of the item's dirty change.
    pub fn set_dirty_change(&mut self, key: &str, patch: ItemPatch) -> Result<u64> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::UnknownItem(key.to_string()))?;
        entry.dirty = true;

        self.next_revision += 1;
        let revision = self.next_revision;
        self.dirty
            .entry(key.to_string())
            .and_modify(|change| {
                change.patch.merge(patch.clone());
                change.revision = revision;
            })
            .or_insert(DirtyChange { patch, revision });

        Ok(revision)
    }

    /// All unsynced edits by item.
    pub fn get_dirty_changes(&self) -> HashMap<ItemId, ItemPatch> {
        self.dirty
            .iter()
            .map(|(key, change)| (key.clone(), change.patch.clone()))
            .collect()
    }

    /// The dirty change of one item.
    pub fn dirty_change(&self, key: &str) -> Option<&DirtyChange> {
        self.dirty.get(key)
    }

    /// Current revision of an item's dirty change.
    pub fn dirty_revision(&self, key: &str) -> Option<u64> {
        self.dirty.get(key).map(|change| change.revision)
    }

    /// Check if an item has unsynced edits.
    pub fn is_dirty(&self, key: &str) -> bool {
        self.dirty.contains_key(key)
    }

    /// Number of items with unsynced edits.
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Clear dirty state after a confirmed sync.
    pub fn clear_dirty_changes<S: AsRef<str>>(&mut self, keys: &[S]) {
        for key in keys {
            let key = key.as_ref();
            self.dirty.remove(key);
            if let Some(entry) = self.entries.get_mut(key) {
                entry.dirty = false;
            }
        }
        self.evict_if_needed("");
    }

    /// Clear an item's dirty state only if nothing was edited since
    /// `revision` was read. Returns whether it was cleared.
    pub fn clear_dirty_if_unchanged(&mut self, key: &str, revision: u64) -> bool {
        if self.dirty_revision(key) != Some(revision) {
            return false;
        }
        self.clear_dirty_changes(&[key]);
        true
    }

    /// Get a cache entry.
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// The confirmed version with unsynced edits applied.
    pub fn local_view(&self, key: &str) -> Option<ContentItem> {
        let entry = self.entries.get(key)?;
        Some(match self.dirty.get(key) {
            Some(change) => change.patch.applied(&entry.data),
            None => entry.data.clone(),
        })
    }

    /// Remove an item entirely, e.g. after it was deleted remotely.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.dirty.remove(key);
        self.entries.remove(key)
    }

    /// Apply a refreshed canonical item list. Clean entries are updated,
    /// inserted or dropped to match; dirty entries are left alone.
    pub fn reconcile(&mut self, items: Vec<ContentItem>, now: Timestamp) {
        let listed: HashSet<ItemId> = items.iter().map(|item| item.id.clone()).collect();
        self.entries
            .retain(|key, entry| entry.dirty || listed.contains(key));
        for item in items {
            self.observe(item, now);
        }
    }

    /// Drop every clean entry. Dirty entries survive; they hold unsynced data.
    pub fn clear_cache(&mut self) {
        self.entries.retain(|_, entry| entry.dirty);
    }

    /// Discard unsynced edits for items without syncing them.
    pub fn discard_dirty_changes<S: AsRef<str>>(&mut self, keys: &[S]) {
        self.clear_dirty_changes(keys);
    }

    /// Number of cached entries.
    pub fn cache_size(&self) -> usize {
        self.entries.len()
    }

    /// All entries, for snapshots.
    pub fn entries(&self) -> impl Iterator<Item = (&ItemId, &CacheEntry)> {
        self.entries.iter()
    }

    /// All dirty changes, for snapshots.
    pub fn dirty_entries(&self) -> impl Iterator<Item = (&ItemId, &DirtyChange)> {
        self.dirty.iter()
    }
}

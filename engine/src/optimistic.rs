//! Optimistic overlay: tentative local versions of items with unconfirmed
//! mutations.
//!
//! While an entry exists, reads through the overlay see the tentative
//! version. Entries live in memory only and start empty on every launch.

use crate::{ContentItem, ItemId, OperationId, Timestamp};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// The tentative state of an item.
#[derive(Debug, Clone, PartialEq)]
pub enum Tentative {
    /// The item as the user last edited it
    Item(ContentItem),
    /// The user deleted the item
    Deleted,
}

/// A tentative version with the operations it is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticEntry {
    /// What the user currently sees
    pub tentative: Tentative,
    /// Canonical value before the first unconfirmed mutation (`None` for
    /// items created locally)
    pub previous: Option<ContentItem>,
    /// Unconfirmed operations behind this entry
    pub operations: BTreeSet<OperationId>,
    /// When the latest tentative value was applied
    pub applied_at: Timestamp,
}

/// Overlay of tentative item versions.
#[derive(Debug, Clone)]
pub struct OptimisticOverlay {
    entries: HashMap<ItemId, OptimisticEntry>,
    enabled: bool,
}

impl Default for OptimisticOverlay {
    fn default() -> Self {
        Self::new(true)
    }
}

impl OptimisticOverlay {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: HashMap::new(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable new optimistic entries. Existing entries stay until
    /// their operations settle.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Show `tentative` for the item until its operations settle.
    ///
    /// A second update to the same item replaces the tentative value
    /// (last write wins) and keeps the original `previous`. Returns `false`
    /// when the overlay is disabled.
    pub fn apply_optimistic_update(
        &mut self,
        item_id: &str,
        tentative: Tentative,
        previous: Option<ContentItem>,
        operation: Option<OperationId>,
        now: Timestamp,
    ) -> bool {
        if !self.enabled {
            return false;
        }

        let entry = self
            .entries
            .entry(item_id.to_string())
            .or_insert_with(|| OptimisticEntry {
                tentative: tentative.clone(),
                previous,
                operations: BTreeSet::new(),
                applied_at: now,
            });
        entry.tentative = tentative;
        entry.applied_at = now;
        if let Some(op_id) = operation {
            entry.operations.insert(op_id);
        }
        true
    }

    /// The tentative item, if one exists and it is not a pending delete.
    pub fn get_optimistic_content(&self, item_id: &str) -> Option<&ContentItem> {
        match &self.entries.get(item_id)?.tentative {
            Tentative::Item(item) => Some(item),
            Tentative::Deleted => None,
        }
    }

    /// The full entry for an item.
    pub fn get(&self, item_id: &str) -> Option<&OptimisticEntry> {
        self.entries.get(item_id)
    }

    /// Check if the item is tentatively deleted.
    pub fn is_pending_delete(&self, item_id: &str) -> bool {
        matches!(
            self.entries.get(item_id).map(|e| &e.tentative),
            Some(Tentative::Deleted)
        )
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.entries.contains_key(item_id)
    }

    /// Mark one operation as confirmed. When no unconfirmed operations remain
    /// the entry is retired and returned.
    pub fn settle(&mut self, item_id: &str, op_id: &str) -> Option<OptimisticEntry> {
        let entry = self.entries.get_mut(item_id)?;
        entry.operations.remove(op_id);
        if entry.operations.is_empty() {
            debug!(item_id = %item_id, "Retired optimistic entry");
            self.entries.remove(item_id)
        } else {
            None
        }
    }

    /// Retire an entry that is not waiting on any queued operation.
    pub fn retire_if_idle(&mut self, item_id: &str) -> Option<OptimisticEntry> {
        if self.entries.get(item_id)?.operations.is_empty() {
            self.entries.remove(item_id)
        } else {
            None
        }
    }

    /// Swap the operation an entry is waiting on, e.g. when a conflict
    /// resolution re-submits the local version under a new operation.
    pub fn replace_operation(&mut self, item_id: &str, old: &str, new: OperationId) {
        if let Some(entry) = self.entries.get_mut(item_id) {
            entry.operations.remove(old);
            entry.operations.insert(new);
        }
    }

    /// Move an entry to a new item id, e.g. after the server assigned its
    /// own id to a created item.
    pub fn remap_item(&mut self, old: &str, new: &str) {
        if let Some(mut entry) = self.entries.remove(old) {
            if let Tentative::Item(item) = &mut entry.tentative {
                item.id = new.to_string();
            }
            self.entries.insert(new.to_string(), entry);
        }
    }

    /// Drop the entry for an item. The returned entry carries the canonical
    /// pre-mutation value in `previous`.
    pub fn rollback_optimistic_update(&mut self, item_id: &str) -> Option<OptimisticEntry> {
        let entry = self.entries.remove(item_id);
        if entry.is_some() {
            debug!(item_id = %item_id, "Rolled back optimistic entry");
        }
        entry
    }

    /// Drop every entry.
    pub fn clear_optimistic_updates(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, title: &str) -> ContentItem {
        ContentItem::new(id, title)
    }

    #[test]
    fn reads_return_tentative_version() {
        let mut overlay = OptimisticOverlay::default();
        overlay.apply_optimistic_update(
            "A",
            Tentative::Item(item("A", "new")),
            Some(item("A", "old")),
            Some("op-1".into()),
            10,
        );

        assert_eq!(overlay.get_optimistic_content("A").unwrap().title, "new");
        assert!(overlay.get_optimistic_content("B").is_none());
    }

    #[test]
    fn remap_moves_entry() {
        let mut overlay = OptimisticOverlay::default();
        overlay.apply_optimistic_update(
            "tmp-1",
            Tentative::Item(item("tmp-1", "draft")),
            None,
            Some("op-1".into()),
            10,
        );
        overlay.remap_item("tmp-1", "srv-1");

        assert!(!overlay.contains("tmp-1"));
        assert_eq!(overlay.get_optimistic_content("srv-1").unwrap().id, "srv-1");
    }

    #[test]
    fn last_write_wins_and_keeps_previous() {
        let mut overlay = OptimisticOverlay::default();
        overlay.apply_optimistic_update(
            "A",
            Tentative::Item(item("A", "first")),
            Some(item("A", "old")),
            Some("op-1".into()),
            10,
        );
        overlay.apply_optimistic_update(
            "A",
            Tentative::Item(item("A", "second")),
            Some(item("A", "first")),
            Some("op-2".into()),
            20,
        );

        let entry = overlay.get("A").unwrap();
        assert_eq!(overlay.get_optimistic_content("A").unwrap().title, "second");
        assert_eq!(entry.previous.as_ref().unwrap().title, "old");
        assert_eq!(entry.operations.len(), 2);
    }

    #[test]
    fn settles_when_all_operations_confirm() {
        let mut overlay = OptimisticOverlay::default();
        for op in ["op-1", "op-2"] {
            overlay.apply_optimistic_update(
                "A",
                Tentative::Item(item("A", op)),
                None,
                Some(op.into()),
                1,
            );
        }

        assert!(overlay.settle("A", "op-1").is_none());
        assert!(overlay.contains("A"));
        let retired = overlay.settle("A", "op-2").unwrap();
        assert_eq!(retired.tentative, Tentative::Item(item("A", "op-2")));
        assert!(overlay.is_empty());
    }

    #[test]
    fn rollback_returns_previous() {
        let mut overlay = OptimisticOverlay::default();
        overlay.apply_optimistic_update(
            "A",
            Tentative::Item(item("A", "new")),
            Some(item("A", "old")),
            Some("op-1".into()),
            1,
        );

        let entry = overlay.rollback_optimistic_update("A").unwrap();
        assert_eq!(entry.previous.unwrap().title, "old");
        assert!(overlay.get_optimistic_content("A").is_none());
        assert!(overlay.rollback_optimistic_update("A").is_none());
    }

    #[test]
    fn pending_delete_hides_item() {
        let mut overlay = OptimisticOverlay::default();
        overlay.apply_optimistic_update("A", Tentative::Deleted, Some(item("A", "x")), None, 1);
        assert!(overlay.is_pending_delete("A"));
        assert!(overlay.get_optimistic_content("A").is_none());
        assert!(overlay.retire_if_idle("A").is_some());
    }

    #[test]
    fn disabled_overlay_accepts_nothing() {
        let mut overlay = OptimisticOverlay::new(false);
        let applied =
            overlay.apply_optimistic_update("A", Tentative::Item(item("A", "x")), None, None, 1);
        assert!(!applied);
        assert!(overlay.is_empty());

        overlay.set_enabled(true);
        assert!(overlay.is_enabled());
    }

    #[test]
    fn replace_operation_keeps_entry_alive() {
        let mut overlay = OptimisticOverlay::default();
        overlay.apply_optimistic_update(
            "A",
            Tentative::Item(item("A", "x")),
            None,
            Some("op-1".into()),
            1,
        );
        overlay.replace_operation("A", "op-1", "op-2".into());
        assert!(overlay.settle("A", "op-1").is_none());
        assert!(overlay.settle("A", "op-2").is_some());
    }
}

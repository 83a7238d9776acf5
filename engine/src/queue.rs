//! The change queue: an ordered, coalescing list of pending operations.
//!
//! Operations are drained oldest first. Only the first queued operation of an
//! item is ever eligible for dispatch, so operations on the same item reach
//! the remote service in the order they were recorded.

use crate::{
    ContentItem, OperationId, OperationKind, OperationStatus, OperationType, SyncOperation,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Counts by operation state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Waiting to be sent (including retryable failures)
    pub pending: usize,
    /// Currently in flight
    pub processing: usize,
    /// Completed since the queue was created or restored
    pub completed: u64,
    /// Terminal failures waiting for a manual retry
    pub failed: usize,
}

/// What [`ChangeQueue::enqueue`] did with an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended as a new operation
    Queued(OperationId),
    /// Folded into an existing pending operation with this id
    Coalesced(OperationId),
    /// Cancelled a pending create of this id; nothing will be sent
    Cancelled(OperationId),
}

impl EnqueueOutcome {
    /// The id of the queued operation that now carries the mutation, if any.
    pub fn operation_id(&self) -> Option<&OperationId> {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::Coalesced(id) => Some(id),
            EnqueueOutcome::Cancelled(_) => None,
        }
    }
}

/// Ordered queue of operations awaiting sync.
#[derive(Debug, Clone)]
pub struct ChangeQueue {
    operations: Vec<SyncOperation>,
    max_retries: u32,
    completed: u64,
}

impl ChangeQueue {
    /// Create an empty queue.
    pub fn new(max_retries: u32) -> Self {
        Self {
            operations: Vec::new(),
            max_retries,
            completed: 0,
        }
    }

    /// Rebuild a queue from persisted operations.
    ///
    /// Operations that were in flight when the state was saved go back to
    /// pending; their outcome is unknown.
    pub fn restore(operations: Vec<SyncOperation>, completed: u64, max_retries: u32) -> Self {
        let mut queue = Self {
            operations,
            max_retries,
            completed,
        };
        queue.reset_in_flight();
        queue
    }

    /// Maximum number of automatic retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Add an operation, coalescing with the item's last pending operation.
    ///
    /// - update after pending update: payloads merge, the earlier id and
    ///   timestamp are kept
    /// - update after pending create: the patch is folded into the create
    /// - delete after pending create: both are dropped
    /// - delete after pending update: the update becomes the delete
    pub fn enqueue(&mut self, op: SyncOperation) -> EnqueueOutcome {
        let last_pending = self
            .operations
            .iter()
            .rposition(|o| o.item_id == op.item_id)
            .filter(|&idx| self.operations[idx].is_pending());

        let Some(idx) = last_pending else {
            return self.push(op);
        };

        let coalesced_id = self.operations[idx].id.clone();
        match (self.operations[idx].op_type(), op.kind) {
            (OperationType::Update, OperationKind::Update(later)) => {
                if let OperationKind::Update(patch) = &mut self.operations[idx].kind {
                    patch.merge(later);
                }
                debug!(op_id = %coalesced_id, item_id = %op.item_id, "Coalesced update");
                EnqueueOutcome::Coalesced(coalesced_id)
            }
            (OperationType::Create, OperationKind::Update(later)) => {
                if let OperationKind::Create(item) = &mut self.operations[idx].kind {
                    later.apply_to(item);
                }
                debug!(op_id = %coalesced_id, item_id = %op.item_id, "Folded update into create");
                EnqueueOutcome::Coalesced(coalesced_id)
            }
            (OperationType::Create, OperationKind::Delete) => {
                self.operations.remove(idx);
                debug!(op_id = %coalesced_id, item_id = %op.item_id, "Delete cancelled pending create");
                EnqueueOutcome::Cancelled(coalesced_id)
            }
            (OperationType::Update, OperationKind::Delete) => {
                self.operations[idx].kind = OperationKind::Delete;
                debug!(op_id = %coalesced_id, item_id = %op.item_id, "Delete replaced pending update");
                EnqueueOutcome::Coalesced(coalesced_id)
            }
            (OperationType::Delete, OperationKind::Delete) => EnqueueOutcome::Coalesced(coalesced_id),
            (_, kind) => self.push(SyncOperation { kind, ..op }),
        }
    }

    fn push(&mut self, op: SyncOperation) -> EnqueueOutcome {
        let id = op.id.clone();
        debug!(op_id = %id, item_id = %op.item_id, op_type = %op.op_type(), "Enqueued operation");
        self.operations.push(op);
        EnqueueOutcome::Queued(id)
    }

    /// Record an operation that already failed terminally, e.g. a rejected
    /// edit discovered outside the queue. It is kept for manual retry.
    pub fn enqueue_failed(&mut self, mut op: SyncOperation, error: impl Into<String>) {
        op.status = OperationStatus::Failed;
        op.error = Some(error.into());
        self.operations.push(op);
    }

    /// Take up to `max_size` dispatchable operations, oldest first, and mark
    /// them as syncing.
    pub fn dequeue_batch(&mut self, max_size: usize) -> Vec<SyncOperation> {
        self.dequeue_batch_excluding(max_size, &HashSet::new())
    }

    /// Like [`dequeue_batch`](Self::dequeue_batch), skipping the given ids.
    ///
    /// At most one operation per item is returned, and only when it is the
    /// item's first operation in the queue.
    pub fn dequeue_batch_excluding(
        &mut self,
        max_size: usize,
        skip: &HashSet<OperationId>,
    ) -> Vec<SyncOperation> {
        let mut seen_items: HashSet<&str> = HashSet::new();
        let mut picked = Vec::new();

        for (idx, op) in self.operations.iter().enumerate() {
            if picked.len() >= max_size {
                break;
            }
            if !seen_items.insert(op.item_id.as_str()) {
                continue;
            }
            if op.is_pending() && !skip.contains(&op.id) {
                picked.push(idx);
            }
        }

        picked
            .into_iter()
            .map(|idx| {
                let op = &mut self.operations[idx];
                op.status = OperationStatus::Syncing;
                op.clone()
            })
            .collect()
    }

    /// Check if any operation could be dispatched right now.
    pub fn has_dispatchable(&self) -> bool {
        self.has_dispatchable_excluding(&HashSet::new())
    }

    /// Like [`has_dispatchable`](Self::has_dispatchable), ignoring the given ids.
    pub fn has_dispatchable_excluding(&self, skip: &HashSet<OperationId>) -> bool {
        let mut seen_items: HashSet<&str> = HashSet::new();
        self.operations.iter().any(|op| {
            seen_items.insert(op.item_id.as_str()) && op.is_pending() && !skip.contains(&op.id)
        })
    }

    /// Remove a successfully synced operation.
    pub fn mark_completed(&mut self, id: &str) -> Option<SyncOperation> {
        let idx = self.operations.iter().position(|o| o.id == id)?;
        let mut op = self.operations.remove(idx);
        op.status = OperationStatus::Completed;
        op.error = None;
        self.completed += 1;
        Some(op)
    }

    /// Record a failed attempt.
    ///
    /// The operation returns to pending until its retry count exceeds
    /// `max_retries`, after which it is terminally failed. Returns the new status.
    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> Option<OperationStatus> {
        let max_retries = self.max_retries;
        let op = self.operations.iter_mut().find(|o| o.id == id)?;
        op.retry_count += 1;
        op.error = Some(error.into());
        op.status = if op.retry_count > max_retries {
            OperationStatus::Failed
        } else {
            OperationStatus::Pending
        };
        Some(op.status)
    }

    /// Fail an operation terminally without consuming retries.
    pub fn mark_rejected(&mut self, id: &str, error: impl Into<String>) -> bool {
        match self.operations.iter_mut().find(|o| o.id == id) {
            Some(op) => {
                op.status = OperationStatus::Failed;
                op.error = Some(error.into());
                true
            }
            None => false,
        }
    }

    /// Remove an operation regardless of its state.
    pub fn remove(&mut self, id: &str) -> Option<SyncOperation> {
        let idx = self.operations.iter().position(|o| o.id == id)?;
        Some(self.operations.remove(idx))
    }

    /// Remove every operation for an item that is not in flight.
    pub fn remove_for_item(&mut self, item_id: &str) -> Vec<SyncOperation> {
        let (removed, kept) = std::mem::take(&mut self.operations)
            .into_iter()
            .partition(|o| o.item_id == item_id && o.status != OperationStatus::Syncing);
        self.operations = kept;
        removed
    }

    /// Point every remaining operation for `old` at `new`, e.g. after the
    /// server assigned its own id to a created item.
    pub fn remap_item(&mut self, old: &str, new: &str) -> usize {
        let mut count = 0;
        for op in self.operations.iter_mut().filter(|o| o.item_id == old) {
            op.item_id = new.to_string();
            if let OperationKind::Create(item) = &mut op.kind {
                item.id = new.to_string();
            }
            count += 1;
        }
        count
    }

    /// Get an operation by id.
    pub fn get(&self, id: &str) -> Option<&SyncOperation> {
        self.operations.iter().find(|o| o.id == id)
    }

    /// All queued operations in order.
    pub fn operations(&self) -> &[SyncOperation] {
        &self.operations
    }

    /// Operations waiting to be sent.
    pub fn pending_operations(&self) -> Vec<&SyncOperation> {
        self.operations.iter().filter(|o| o.is_pending()).collect()
    }

    /// Terminally failed operations.
    pub fn failed_operations(&self) -> Vec<&SyncOperation> {
        self.operations.iter().filter(|o| o.is_terminal()).collect()
    }

    /// Check if any operation (in any state) targets the item.
    pub fn has_ops_for(&self, item_id: &str) -> bool {
        self.operations.iter().any(|o| o.item_id == item_id)
    }

    /// The payload of a create for the item that has not been confirmed or
    /// failed yet.
    pub fn unconfirmed_create(&self, item_id: &str) -> Option<&ContentItem> {
        self.operations
            .iter()
            .filter(|o| o.item_id == item_id && !o.is_terminal())
            .find_map(|o| match &o.kind {
                OperationKind::Create(item) => Some(item),
                _ => None,
            })
    }

    /// Move every terminally failed operation back to pending with a fresh
    /// retry budget. Returns how many were requeued.
    pub fn retry_failed(&mut self) -> usize {
        let mut count = 0;
        for op in self.operations.iter_mut().filter(|o| o.is_terminal()) {
            op.status = OperationStatus::Pending;
            op.retry_count = 0;
            op.error = None;
            count += 1;
        }
        count
    }

    /// Put in-flight operations back to pending.
    pub fn reset_in_flight(&mut self) {
        for op in &mut self.operations {
            if op.status == OperationStatus::Syncing {
                op.status = OperationStatus::Pending;
            }
        }
    }

    /// Drop every operation. Returns the dropped operations.
    pub fn clear(&mut self) -> Vec<SyncOperation> {
        std::mem::take(&mut self.operations)
    }

    /// Counts by state.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            completed: self.completed,
            ..QueueStats::default()
        };
        for op in &self.operations {
            match op.status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::Syncing => stats.processing += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Completed => {}
            }
        }
        stats
    }

    /// Number of completed operations since creation or restore.
    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

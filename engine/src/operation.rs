//! Sync operations recorded in the change queue.
//!
//! Every local mutation becomes a [`SyncOperation`]. The operation id is
//! assigned once and stays stable across retries.

use crate::{ContentHash, ContentItem, ItemId, ItemPatch, OperationId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an operation does, with exactly the payload that kind may carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum OperationKind {
    /// Create a new item (full item)
    Create(ContentItem),
    /// Update fields of an existing item
    Update(ItemPatch),
    /// Delete an item
    Delete,
}

/// Payload-free discriminant of [`OperationKind`], used for grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Create => f.write_str("create"),
            OperationType::Update => f.write_str("update"),
            OperationType::Delete => f.write_str("delete"),
        }
    }
}

/// Lifecycle state of an operation.
///
/// `Pending -> Syncing -> Completed | Failed`. A retryable failure puts the
/// operation back to `Pending`; `Failed` is terminal until retried manually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

/// A queued mutation waiting to reach the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Operation ID, stable across retries
    pub id: OperationId,
    /// Item this operation targets
    pub item_id: ItemId,
    /// The mutation
    pub kind: OperationKind,
    /// Fingerprint of the confirmed version the mutation was made against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_hash: Option<ContentHash>,
    /// When the mutation was first recorded
    pub timestamp: Timestamp,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Lifecycle state
    pub status: OperationStatus,
    /// Last error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncOperation {
    fn new(
        item_id: impl Into<ItemId>,
        kind: OperationKind,
        base_hash: Option<ContentHash>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            item_id: item_id.into(),
            kind,
            base_hash,
            timestamp,
            retry_count: 0,
            status: OperationStatus::Pending,
            error: None,
        }
    }

    /// Create operation for a new item.
    pub fn create(item: ContentItem, timestamp: Timestamp) -> Self {
        let item_id = item.id.clone();
        Self::new(item_id, OperationKind::Create(item), None, timestamp)
    }

    /// Update operation for an existing item.
    pub fn update(
        item_id: impl Into<ItemId>,
        patch: ItemPatch,
        base_hash: Option<ContentHash>,
        timestamp: Timestamp,
    ) -> Self {
        Self::new(item_id, OperationKind::Update(patch), base_hash, timestamp)
    }

    /// Delete operation for an existing item.
    pub fn delete(
        item_id: impl Into<ItemId>,
        base_hash: Option<ContentHash>,
        timestamp: Timestamp,
    ) -> Self {
        Self::new(item_id, OperationKind::Delete, base_hash, timestamp)
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: impl Into<OperationId>) -> Self {
        self.id = id.into();
        self
    }

    /// The payload-free operation type.
    pub fn op_type(&self) -> OperationType {
        match self.kind {
            OperationKind::Create(_) => OperationType::Create,
            OperationKind::Update(_) => OperationType::Update,
            OperationKind::Delete => OperationType::Delete,
        }
    }

    /// Check if the operation is waiting to be sent.
    pub fn is_pending(&self) -> bool {
        self.status == OperationStatus::Pending
    }

    /// Check if the operation exhausted its retries or was rejected.
    pub fn is_terminal(&self) -> bool {
        self.status == OperationStatus::Failed
    }
}

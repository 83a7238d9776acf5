//! Conflict detection bookkeeping and resolution strategies.
//!
//! A conflict is recorded when the remote service rejects a write because
//! the item changed since the version the client edited. The resolver holds
//! both snapshots until the conflict is resolved or superseded; it decides
//! *what* the outcome is, and the orchestrator applies it.

use crate::{error::Result, ContentItem, Error, ItemId, OperationId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Combines the local and remote versions of an item.
pub type MergeFn = Arc<dyn Fn(&ContentItem, &ContentItem) -> ContentItem + Send + Sync>;

/// How conflicts are handled when they are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Keep conflicts until the user picks a side (default)
    #[default]
    Manual,
    /// Re-submit the local version over the remote one
    LocalFirst,
    /// Discard the local change and adopt the remote version
    RemoteFirst,
    /// Combine both with the configured merge function
    Merge,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictStrategy::Manual => "manual",
            ConflictStrategy::LocalFirst => "local-first",
            ConflictStrategy::RemoteFirst => "remote-first",
            ConflictStrategy::Merge => "merge",
        })
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ConflictStrategy::Manual),
            "local-first" => Ok(ConflictStrategy::LocalFirst),
            "remote-first" => Ok(ConflictStrategy::RemoteFirst),
            "merge" => Ok(ConflictStrategy::Merge),
            other => Err(format!("unknown conflict strategy: {other}")),
        }
    }
}

/// Alias used when a strategy is applied to a single conflict.
pub type ResolutionMode = ConflictStrategy;

/// Which side an automatic resolution picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoResolution {
    Local,
    Remote,
}

/// A detected divergence between the local and remote version of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    /// The item in conflict
    pub item_id: ItemId,
    /// What the user has locally
    pub local: ContentItem,
    /// What the server has
    pub remote: ContentItem,
    /// When the conflict was detected
    pub timestamp: Timestamp,
    /// Set when the conflict was resolved automatically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_resolution_mode: Option<AutoResolution>,
    /// The rejected operation, when the write came from the queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
}

impl ConflictInfo {
    pub fn new(local: ContentItem, remote: ContentItem, timestamp: Timestamp) -> Self {
        Self {
            item_id: local.id.clone(),
            local,
            remote,
            timestamp,
            auto_resolution_mode: None,
            operation_id: None,
        }
    }

    pub fn with_operation(mut self, op_id: impl Into<OperationId>) -> Self {
        self.operation_id = Some(op_id.into());
        self
    }
}

/// The decided outcome of a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Re-submit the local version
    KeepLocal(ContentItem),
    /// Adopt the remote version
    AcceptRemote(ContentItem),
    /// Submit a merged version
    Merged(ContentItem),
}

/// Holds pending conflicts, one per item.
#[derive(Clone, Default)]
pub struct ConflictResolver {
    conflicts: BTreeMap<ItemId, ConflictInfo>,
    merge: Option<MergeFn>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("conflicts", &self.conflicts)
            .field("merge", &self.merge.is_some())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the function used by [`ConflictStrategy::Merge`].
    pub fn with_merge_fn(mut self, merge: MergeFn) -> Self {
        self.merge = Some(merge);
        self
    }

    pub fn has_merge_fn(&self) -> bool {
        self.merge.is_some()
    }

    /// Record a conflict. A newer conflict for the same item supersedes the
    /// older one, which is returned.
    pub fn add_conflict(&mut self, info: ConflictInfo) -> Option<ConflictInfo> {
        self.conflicts.insert(info.item_id.clone(), info)
    }

    /// Pending conflicts, oldest first.
    pub fn pending_conflicts(&self) -> Vec<&ConflictInfo> {
        let mut conflicts: Vec<_> = self.conflicts.values().collect();
        conflicts.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        conflicts
    }

    /// Replace the local side of an open conflict with what the user has
    /// now. Returns `false` when the item has no open conflict.
    pub fn update_local(&mut self, item_id: &str, mut local: ContentItem) -> bool {
        match self.conflicts.get_mut(item_id) {
            Some(info) => {
                local.id = info.item_id.clone();
                info.local = local;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, item_id: &str) -> Option<&ConflictInfo> {
        self.conflicts.get(item_id)
    }

    pub fn has_conflict(&self, item_id: &str) -> bool {
        self.conflicts.contains_key(item_id)
    }

    /// Decide the outcome of a conflict with the given mode.
    ///
    /// `Manual` leaves the conflict pending and returns `None`. Any other
    /// mode removes the conflict.
    pub fn resolve_conflict(
        &mut self,
        item_id: &str,
        mode: ResolutionMode,
    ) -> Result<Option<(ConflictInfo, Resolution)>> {
        let info = self
            .conflicts
            .get(item_id)
            .ok_or_else(|| Error::ConflictNotFound(item_id.to_string()))?;

        let resolution = match mode {
            ConflictStrategy::Manual => return Ok(None),
            ConflictStrategy::LocalFirst => Resolution::KeepLocal(info.local.clone()),
            ConflictStrategy::RemoteFirst => Resolution::AcceptRemote(info.remote.clone()),
            ConflictStrategy::Merge => {
                let merge = self.merge.as_ref().ok_or(Error::MergeUnavailable)?;
                let mut merged = merge(&info.local, &info.remote);
                merged.id = info.item_id.clone();
                Resolution::Merged(merged)
            }
        };

        let mut info = self
            .conflicts
            .remove(item_id)
            .ok_or_else(|| Error::ConflictNotFound(item_id.to_string()))?;
        info.auto_resolution_mode = match resolution {
            Resolution::KeepLocal(_) => Some(AutoResolution::Local),
            Resolution::AcceptRemote(_) => Some(AutoResolution::Remote),
            Resolution::Merged(_) => None,
        };
        Ok(Some((info, resolution)))
    }

    /// Resolve a conflict with an explicitly merged item.
    pub fn resolve_with(
        &mut self,
        item_id: &str,
        mut merged: ContentItem,
    ) -> Result<(ConflictInfo, Resolution)> {
        let info = self
            .conflicts
            .remove(item_id)
            .ok_or_else(|| Error::ConflictNotFound(item_id.to_string()))?;
        merged.id = info.item_id.clone();
        Ok((info, Resolution::Merged(merged)))
    }

    /// Drop every pending conflict.
    pub fn clear_conflicts(&mut self) -> Vec<ConflictInfo> {
        std::mem::take(&mut self.conflicts).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

//! Lifecycle events and statistics published by the engine.

use crate::{AutoResolution, ItemId, QueueStats, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What started a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTrigger {
    /// Quiet period after a local mutation elapsed
    Debounced,
    /// Periodic background tick
    Interval,
    /// Explicit `force_sync_now`
    Forced,
    /// Connectivity came back
    Online,
    /// A trigger arrived while a cycle was running
    Coalesced,
    /// Failed operations were requeued
    Retry,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::Debounced => "debounced",
            SyncTrigger::Interval => "interval",
            SyncTrigger::Forced => "forced",
            SyncTrigger::Online => "online",
            SyncTrigger::Coalesced => "coalesced",
            SyncTrigger::Retry => "retry",
        };
        write!(f, "{}", name)
    }
}

/// Overall outcome of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CycleStatus {
    /// Every attempted item synced
    Success,
    /// Some items synced, some failed or conflicted
    Partial,
    /// Nothing synced
    Error,
    /// Offline or nothing to do; no work attempted
    Skipped,
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub trigger: SyncTrigger,
    pub status: CycleStatus,
    /// Dirty items and operations confirmed by the server
    pub succeeded: usize,
    /// Attempts that failed, retryable or not
    pub failed: usize,
    /// Conflicts detected this cycle
    pub conflicts: usize,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl CycleReport {
    /// A report with no work recorded. [`finish`](Self::finish) sets the
    /// final status; an unfinished report reads as skipped.
    pub(crate) fn new(trigger: SyncTrigger, now: Timestamp) -> Self {
        Self {
            trigger,
            status: CycleStatus::Skipped,
            succeeded: 0,
            failed: 0,
            conflicts: 0,
            started_at: now,
            finished_at: now,
        }
    }

    /// Number of items or operations attempted.
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed + self.conflicts
    }

    pub(crate) fn finish(&mut self, now: Timestamp) {
        self.finished_at = now;
        self.status = if self.attempted() == 0 || self.succeeded == self.attempted() {
            CycleStatus::Success
        } else if self.succeeded > 0 {
            CycleStatus::Partial
        } else {
            CycleStatus::Error
        };
    }
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync: Option<Timestamp>,
    pub queue: QueueStats,
    pub dirty: usize,
    pub conflicts: usize,
    pub cache_size: usize,
}

/// Events broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A cycle began doing work
    Started { trigger: SyncTrigger },
    /// A cycle finished with at least one success or nothing failing
    Completed { report: CycleReport, stats: SyncStats },
    /// A cycle finished without a single success
    Error { message: String, report: CycleReport },
    /// A stale write was detected
    #[serde(rename_all = "camelCase")]
    ConflictDetected {
        item_id: ItemId,
        auto_resolution: Option<AutoResolution>,
    },
}

//! Sync cycle tests: draining, retries, rollback and batch isolation.

mod common;

use common::{harness, Call};
use syncwell_engine::{
    ContentItem, CycleStatus, EnqueueOutcome, ItemPatch, OperationKind, OperationStatus,
    OperationType, RemoteError, SyncConfig, SyncTrigger,
};

fn item(id: &str, title: &str) -> ContentItem {
    ContentItem::new(id, title)
}

// ============================================================================
// Draining
// ============================================================================

#[tokio::test]
async fn two_updates_before_drain_sync_as_one() {
    let h = harness(SyncConfig::default());
    h.seed(&[item("A", "start")]).await;

    let first = h
        .engine
        .update_item("A", ItemPatch::new().title("X"))
        .await
        .unwrap();
    let second = h
        .engine
        .update_item("A", ItemPatch::new().title("Y"))
        .await
        .unwrap();
    assert!(matches!(first, EnqueueOutcome::Queued(_)));
    assert_eq!(second.operation_id(), first.operation_id());

    let pending = h.engine.pending_operations().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OperationKind::Update(ItemPatch::new().title("Y")));

    let report = h.engine.force_sync_now().await.unwrap();
    assert_eq!(report.status, CycleStatus::Success);
    assert_eq!(report.succeeded, 1);

    assert!(h.engine.pending_operations().await.is_empty());
    assert!(h.engine.dirty_changes().await.get("A").is_none());
    assert!(h.engine.last_sync().await.is_some());
    assert_eq!(h.remote.update_calls(), 1);
    assert_eq!(h.remote.item("A").unwrap().title, "Y");
    assert_eq!(h.engine.get_item("A").await.unwrap().title, "Y");
    assert!(h.engine.get_optimistic_content("A").await.is_none());
}

#[tokio::test]
async fn nothing_to_do_is_skipped() {
    let h = harness(SyncConfig::default());
    h.seed(&[item("A", "start")]).await;

    let report = h.engine.force_sync_now().await.unwrap();
    assert_eq!(report.status, CycleStatus::Skipped);
    assert!(h.engine.last_sync().await.is_none());
    assert_eq!(h.remote.refresh_count(), 0);
}

#[tokio::test]
async fn operations_are_batched_and_grouped_by_type() {
    let h = harness(SyncConfig::default().with_batch_sizes(50, 2));
    h.seed(&[item("A", "a"), item("B", "b")]).await;

    for i in 0..3 {
        h.engine.create_item(item(&format!("N{}", i), "new")).await;
    }
    h.engine
        .update_item("A", ItemPatch::new().title("a2"))
        .await
        .unwrap();
    h.engine.delete_item("B").await.unwrap();

    let report = h.engine.force_sync_now().await.unwrap();
    assert_eq!(report.status, CycleStatus::Success);
    assert_eq!(report.succeeded, 5);
    assert!(h.remote.max_in_flight() <= 2);

    assert!(h.remote.item("N2").is_some());
    assert!(h.remote.item("B").is_none());
    assert!(h.engine.get_item("B").await.is_none());
    assert_eq!(h.engine.get_sync_stats().await.queue.completed, 5);

    // First batch holds N0 and N1; creates go out before anything else.
    let calls = h.remote.calls();
    assert_eq!(calls[0], Call::Create("N0".into()));
    assert_eq!(calls[1], Call::Create("N1".into()));
}

#[tokio::test]
async fn delete_replaces_pending_update() {
    let h = harness(SyncConfig::default());
    h.seed(&[item("A", "start")]).await;

    h.engine
        .update_item("A", ItemPatch::new().title("one"))
        .await
        .unwrap();
    h.engine.delete_item("A").await.unwrap();

    // The delete replaced the pending update.
    let pending = h.engine.pending_operations().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].op_type(), OperationType::Delete);

    h.engine.force_sync_now().await.unwrap();
    assert!(h.remote.item("A").is_none());
    assert!(h.engine.dirty_changes().await.is_empty());
}

#[tokio::test]
async fn server_assigned_ids_replace_local_ids() {
    let h = harness(SyncConfig::default());
    h.remote.assign_server_ids();

    h.engine.create_item(item("tmp-1", "draft")).await;
    let outcome = h
        .engine
        .update_item("tmp-1", ItemPatch::new().title("final"))
        .await
        .unwrap();
    assert!(matches!(outcome, EnqueueOutcome::Coalesced(_)));

    let report = h.engine.force_sync_now().await.unwrap();
    assert_eq!(report.status, CycleStatus::Success);
    assert!(h.engine.get_item("tmp-1").await.is_none());
    assert_eq!(h.engine.get_item("srv-1").await.unwrap().title, "final");
    assert_eq!(h.remote.item("srv-1").unwrap().title, "final");
}

#[tokio::test]
async fn deleting_a_missing_item_counts_as_success() {
    let h = harness(SyncConfig::default());
    h.engine.observe_items([item("A", "local only")]).await;

    h.engine.delete_item("A").await.unwrap();
    let report = h.engine.force_sync_now().await.unwrap();

    assert_eq!(report.status, CycleStatus::Success);
    assert!(h.engine.failed_operations().await.is_empty());
    assert!(h.engine.get_item("A").await.is_none());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn retries_are_bounded() {
    let h = harness(SyncConfig::default().with_max_retries(2));
    h.seed(&[item("A", "start")]).await;
    h.remote.fail("A", RemoteError::Network("offline".into()));

    h.engine
        .update_item("A", ItemPatch::new().title("X"))
        .await
        .unwrap();

    for attempt in 1..=3 {
        let report = h.engine.force_sync_now().await.unwrap();
        assert_eq!(report.status, CycleStatus::Error, "attempt {}", attempt);
        assert_eq!(report.failed, 1);
    }

    let failed = h.engine.failed_operations().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, OperationStatus::Failed);
    assert_eq!(failed[0].retry_count, 3);
    assert!(failed[0].error.as_deref().unwrap().contains("offline"));

    // Terminal: background cycles leave it alone.
    let report = h.engine.force_sync_now().await.unwrap();
    assert_eq!(report.status, CycleStatus::Skipped);
    assert_eq!(h.remote.update_calls(), 3);
    assert_eq!(h.engine.get_sync_stats().await.queue.failed, 1);
}

#[tokio::test]
async fn transient_failure_keeps_optimistic_version() {
    let h = harness(SyncConfig::default());
    h.seed(&[item("A", "start")]).await;
    h.remote.fail("A", RemoteError::Network("timeout".into()));

    h.engine
        .update_item("A", ItemPatch::new().title("X"))
        .await
        .unwrap();
    h.engine.force_sync_now().await.unwrap();

    assert_eq!(h.engine.get_item("A").await.unwrap().title, "X");
    let pending = h.engine.pending_operations().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);

    h.remote.heal("A");
    h.engine.force_sync_now().await.unwrap();
    assert_eq!(h.remote.item("A").unwrap().title, "X");
    assert!(h.engine.pending_operations().await.is_empty());
}

#[tokio::test]
async fn permanent_failure_rolls_back_optimistic_update() {
    let h = harness(SyncConfig::default());
    h.seed(&[item("A", "start")]).await;
    h.remote.fail("A", RemoteError::Validation("title too long".into()));

    h.engine
        .update_item("A", ItemPatch::new().title("X"))
        .await
        .unwrap();
    assert_eq!(
        h.engine.get_optimistic_content("A").await.unwrap().title,
        "X"
    );

    let report = h.engine.force_sync_now().await.unwrap();
    assert_eq!(report.status, CycleStatus::Error);

    assert!(h.engine.get_optimistic_content("A").await.is_none());
    assert_eq!(h.engine.get_item("A").await.unwrap().title, "start");
    assert!(h.engine.dirty_changes().await.is_empty());

    let failed = h.engine.failed_operations().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 0);
    assert!(failed[0].error.as_deref().unwrap().contains("title too long"));
}

#[tokio::test]
async fn rejected_delete_restores_item_dropped_from_cache() {
    let h = harness(SyncConfig::default());
    h.seed(&[item("A", "start")]).await;

    h.engine.delete_item("A").await.unwrap();
    h.engine.clear_cache().await;
    assert!(h.engine.get_item("A").await.is_none());

    h.remote.fail("A", RemoteError::Validation("item is locked".into()));
    h.remote.break_refresh();
    let report = h.engine.force_sync_now().await.unwrap();
    assert_eq!(report.status, CycleStatus::Error);

    assert_eq!(h.engine.get_item("A").await.unwrap().title, "start");
    assert_eq!(h.engine.get_sync_stats().await.cache_size, 1);
    assert_eq!(h.engine.failed_operations().await.len(), 1);
}

#[tokio::test]
async fn one_failure_does_not_abort_the_batch() {
    let h = harness(SyncConfig::default());
    h.seed(&[item("A", "a"), item("B", "b"), item("C", "c")]).await;
    h.remote.fail("B", RemoteError::Validation("bad".into()));

    for id in ["A", "B", "C"] {
        h.engine
            .update_item(id, ItemPatch::new().title(format!("{}2", id)))
            .await
            .unwrap();
    }

    let report = h.engine.force_sync_now().await.unwrap();
    assert_eq!(report.status, CycleStatus::Partial);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(h.remote.item("A").unwrap().title, "A2");
    assert_eq!(h.remote.item("C").unwrap().title, "C2");
    assert_eq!(h.remote.item("B").unwrap().title, "b");
}

#[tokio::test]
async fn rejected_staged_edit_becomes_failed_operation() {
    let h = harness(SyncConfig::default());
    h.seed(&[item("A", "start")]).await;
    h.remote.fail("A", RemoteError::Validation("nope".into()));

    h.engine
        .stage_edit("A", ItemPatch::new().title("draft"))
        .await
        .unwrap();
    let report = h.engine.force_sync_now().await.unwrap();
    assert_eq!(report.status, CycleStatus::Error);

    let failed = h.engine.failed_operations().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].op_type(), OperationType::Update);
    assert_eq!(failed[0].item_id, "A");
    assert!(h.engine.dirty_changes().await.is_empty());
    assert_eq!(h.engine.get_item("A").await.unwrap().title, "start");
}

#[tokio::test]
async fn retry_failed_operations_resends() {
    let h = harness(SyncConfig::default().with_max_retries(0));
    h.seed(&[item("A", "start")]).await;
    h.remote.fail("A", RemoteError::Network("down".into()));

    h.engine
        .update_item("A", ItemPatch::new().title("X"))
        .await
        .unwrap();
    h.engine.force_sync_now().await.unwrap();
    assert_eq!(h.engine.failed_operations().await.len(), 1);

    h.remote.heal("A");
    assert_eq!(h.engine.retry_failed_operations().await, 1);

    assert!(h.engine.failed_operations().await.is_empty());
    assert_eq!(h.remote.item("A").unwrap().title, "X");
    assert_eq!(h.engine.get_item("A").await.unwrap().title, "X");
}

#[tokio::test]
async fn clearing_the_queue_reverts_local_changes() {
    let h = harness(SyncConfig::default());
    h.seed(&[item("A", "start")]).await;

    h.engine
        .update_item("A", ItemPatch::new().title("X"))
        .await
        .unwrap();
    h.engine.create_item(item("N", "new")).await;

    assert_eq!(h.engine.clear_sync_queue().await, 2);
    assert!(h.engine.pending_operations().await.is_empty());
    assert!(h.engine.dirty_changes().await.is_empty());
    assert_eq!(h.engine.get_item("A").await.unwrap().title, "start");
    assert!(h.engine.get_item("N").await.is_none());
}

// ============================================================================
// Connectivity and cache
// ============================================================================

#[tokio::test]
async fn offline_cycles_are_skipped_until_reconnect() {
    let h = harness(SyncConfig::default());
    h.seed(&[item("A", "start")]).await;

    assert!(h.engine.set_online(false).await.is_none());
    h.engine
        .update_item("A", ItemPatch::new().title("offline edit"))
        .await
        .unwrap();

    let report = h.engine.force_sync_now().await.unwrap();
    assert_eq!(report.status, CycleStatus::Skipped);
    assert_eq!(h.remote.update_calls(), 0);
    assert!(!h.engine.get_sync_stats().await.is_online);

    let report = h.engine.set_online(true).await.unwrap();
    assert_eq!(report.trigger, SyncTrigger::Online);
    assert_eq!(report.status, CycleStatus::Success);
    assert_eq!(h.remote.item("A").unwrap().title, "offline edit");
}

#[tokio::test]
async fn dirty_entries_survive_eviction() {
    let h = harness(SyncConfig::default().with_max_cache_size(2));
    h.seed(&[item("A", "a"), item("B", "b")]).await;
    h.engine
        .stage_edit("A", ItemPatch::new().title("a2"))
        .await
        .unwrap();
    h.engine
        .stage_edit("B", ItemPatch::new().title("b2"))
        .await
        .unwrap();

    h.engine
        .observe_items([item("C", "c"), item("D", "d")])
        .await;

    let stats = h.engine.get_sync_stats().await;
    assert!(stats.cache_size > 2);
    assert_eq!(stats.dirty, 2);
    assert_eq!(h.engine.get_item("A").await.unwrap().title, "a2");
    assert_eq!(h.engine.get_item("B").await.unwrap().title, "b2");

    h.engine.force_sync_now().await.unwrap();
    let stats = h.engine.get_sync_stats().await;
    assert_eq!(stats.dirty, 0);
    assert!(stats.cache_size <= 2);
    assert_eq!(h.remote.item("A").unwrap().title, "a2");
}

#[tokio::test]
async fn clear_cache_keeps_unsynced_edits() {
    let h = harness(SyncConfig::default());
    h.seed(&[item("A", "a"), item("B", "b")]).await;
    h.engine
        .stage_edit("A", ItemPatch::new().title("a2"))
        .await
        .unwrap();

    h.engine.clear_cache().await;
    assert_eq!(h.engine.get_sync_stats().await.cache_size, 1);
    assert!(h.engine.get_item("B").await.is_none());
    assert_eq!(h.engine.get_item("A").await.unwrap().title, "a2");
}

#[tokio::test]
async fn disabled_overlay_shows_confirmed_creates_only() {
    let h = harness(SyncConfig::default());
    h.engine.set_enable_optimistic_updates(false).await;

    h.engine.create_item(item("N", "new")).await;
    assert!(h.engine.get_item("N").await.is_none());

    h.engine.force_sync_now().await.unwrap();
    assert_eq!(h.engine.get_item("N").await.unwrap().title, "new");
}

#[tokio::test]
async fn disabled_overlay_edits_fold_into_queued_create() {
    let h = harness(SyncConfig::default());
    h.engine.set_enable_optimistic_updates(false).await;

    h.engine.create_item(item("N", "new")).await;
    let outcome = h
        .engine
        .update_item("N", ItemPatch::new().title("renamed"))
        .await
        .unwrap();
    assert!(matches!(outcome, EnqueueOutcome::Coalesced(_)));
    assert_eq!(h.engine.pending_operations().await.len(), 1);

    let report = h.engine.force_sync_now().await.unwrap();
    assert_eq!(report.status, CycleStatus::Success);
    assert_eq!(h.remote.item("N").unwrap().title, "renamed");
    assert_eq!(h.engine.get_item("N").await.unwrap().title, "renamed");
}

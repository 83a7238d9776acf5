//! The sync orchestrator.
//!
//! [`SyncEngine`] owns the change queue, the dirty tracker, the optimistic
//! overlay and the conflict resolver, and drives them through sync cycles:
//!
//! 1. Dirty changes without queued operations are pushed in batches of
//!    `dirty_batch_size` as parallel updates.
//! 2. Queued operations are drained in batches of `queue_batch_size`,
//!    grouped create, update, delete.
//! 3. Each result is reconciled: success confirms, staleness raises a
//!    conflict, anything else is retried or failed.
//! 4. The canonical item list is refreshed and the state persisted.
//!
//! Cycles never overlap. A trigger that arrives while one is running is
//! folded into a single follow-up cycle.

use crate::batch::{settle_all, Settled};
use crate::error::Result;
use crate::{
    CanonicalStore, ChangeQueue, Clock, ConflictInfo, ConflictResolver, ConflictStrategy,
    ContentHash, ContentItem, CycleReport, CycleStatus, DirtyTracker, EnqueueOutcome, Error,
    ErrorKind, HashManager, ItemId, ItemPatch, MemoryStorage, MergeFn, OperationId, OperationKind,
    OperationStatus, OperationType, OptimisticOverlay, RemoteError, RemoteService, Resolution,
    ResolutionMode, Scheduler, Storage, SyncConfig, SyncEvent, SyncOperation, SyncSnapshot,
    SyncStats, SyncTrigger, SystemClock, TaskHandle, Tentative, Timestamp, TokioScheduler,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 64;

/// Collaborators injected into a [`SyncEngine`].
#[derive(Clone)]
pub struct SyncDeps {
    pub remote: Arc<dyn RemoteService>,
    pub store: Arc<dyn CanonicalStore>,
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn Scheduler>,
    /// Used by the `merge` conflict strategy
    pub merge: Option<MergeFn>,
}

impl SyncDeps {
    /// Dependencies with in-memory storage, the system clock and tokio timers.
    pub fn new(remote: Arc<dyn RemoteService>, store: Arc<dyn CanonicalStore>) -> Self {
        Self {
            remote,
            store,
            storage: Arc::new(MemoryStorage::new()),
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(TokioScheduler),
            merge: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_merge_fn(mut self, merge: MergeFn) -> Self {
        self.merge = Some(merge);
        self
    }
}

struct EngineState {
    queue: ChangeQueue,
    cache: DirtyTracker,
    overlay: OptimisticOverlay,
    conflicts: ConflictResolver,
    last_sync: Option<Timestamp>,
    online: bool,
}

impl EngineState {
    fn has_work(&self) -> bool {
        self.queue
            .has_dispatchable_excluding(&self.blocked_operations())
            || self.dirty_candidates().next().is_some()
    }

    /// Operations held back while their item has an open conflict.
    fn blocked_operations(&self) -> HashSet<OperationId> {
        self.queue
            .operations()
            .iter()
            .filter(|op| self.conflicts.has_conflict(&op.item_id))
            .map(|op| op.id.clone())
            .collect()
    }

    /// Dirty items synced by the dirty-change phase. Items with queued
    /// operations or open conflicts are handled by those paths instead.
    fn dirty_candidates(&self) -> impl Iterator<Item = &ItemId> + '_ {
        self.cache
            .dirty_entries()
            .map(|(item_id, _)| item_id)
            .filter(move |item_id| {
                !self.queue.has_ops_for(item_id) && !self.conflicts.has_conflict(item_id)
            })
    }

    /// What the user currently sees for an item.
    fn local_version(&self, item_id: &str) -> Option<ContentItem> {
        match self.overlay.get(item_id).map(|entry| &entry.tentative) {
            Some(Tentative::Item(item)) => Some(item.clone()),
            Some(Tentative::Deleted) => None,
            None => self.cache.local_view(item_id),
        }
    }

    /// Revert an item to its confirmed version. When the cache dropped the
    /// item meanwhile, the pre-mutation value kept by the overlay is put back.
    fn abandon_local_changes(&mut self, item_id: &str, now: Timestamp) {
        let rolled_back = self.overlay.rollback_optimistic_update(item_id);
        self.cache.discard_dirty_changes(&[item_id]);
        if let Some(previous) = rolled_back.and_then(|entry| entry.previous) {
            if self.cache.get(item_id).is_none() {
                debug!(item_id = %item_id, "Restored pre-mutation version");
                self.cache.observe(previous, now);
            }
        }
    }

    /// Keep the local side of an open conflict in step with later edits.
    fn track_conflict_edit(&mut self, item_id: &str) {
        if !self.conflicts.has_conflict(item_id) {
            return;
        }
        if let Some(local) = self.local_version(item_id) {
            self.conflicts.update_local(item_id, local);
            debug!(item_id = %item_id, "Edit recorded on open conflict");
        }
    }
}

#[derive(Default)]
struct CycleGate {
    running: bool,
    rerun: bool,
}

#[derive(Default)]
struct Timers {
    debounce: Option<Box<dyn TaskHandle>>,
    interval: Option<Box<dyn TaskHandle>>,
}

/// A dirty change on its way to the server.
struct DirtyWork {
    item_id: ItemId,
    patch: ItemPatch,
    revision: u64,
    base_hash: ContentHash,
}

/// A dequeued operation with the dirty revision it was sent against.
struct Dispatch {
    op: SyncOperation,
    revision: Option<u64>,
}

/// The sync orchestrator. Create one per session with [`SyncEngine::new`]
/// and share the returned `Arc`.
pub struct SyncEngine {
    config: SyncConfig,
    hasher: HashManager,
    remote: Arc<dyn RemoteService>,
    store: Arc<dyn CanonicalStore>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<EngineState>,
    persist_lock: Mutex<()>,
    gate: StdMutex<CycleGate>,
    timers: StdMutex<Timers>,
    events: StdMutex<Option<broadcast::Sender<SyncEvent>>>,
    shut_down: AtomicBool,
    this: Weak<SyncEngine>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncEngine {
    pub fn new(config: SyncConfig, deps: SyncDeps) -> Arc<Self> {
        let mut conflicts = ConflictResolver::new();
        if let Some(merge) = deps.merge {
            conflicts = conflicts.with_merge_fn(merge);
        }
        if config.conflict_strategy == ConflictStrategy::Merge && !conflicts.has_merge_fn() {
            warn!("Merge conflict strategy without a merge function, conflicts wait for manual resolution");
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new_cyclic(|this| Self {
            state: Mutex::new(EngineState {
                queue: ChangeQueue::new(config.max_retries),
                cache: DirtyTracker::new(config.max_cache_size),
                overlay: OptimisticOverlay::new(config.enable_optimistic_updates),
                conflicts,
                last_sync: None,
                online: true,
            }),
            config,
            hasher: HashManager::new(),
            remote: deps.remote,
            store: deps.store,
            storage: deps.storage,
            clock: deps.clock,
            scheduler: deps.scheduler,
            persist_lock: Mutex::new(()),
            gate: StdMutex::new(CycleGate::default()),
            timers: StdMutex::new(Timers::default()),
            events: StdMutex::new(Some(events)),
            shut_down: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Load the persisted queue, cache and last sync time.
    ///
    /// Returns `Ok(false)` when nothing was stored or storage is unreadable;
    /// the engine then runs from memory. A stored snapshot that fails
    /// validation is an error.
    pub async fn restore(&self) -> Result<bool> {
        let raw = match self.storage.get(&self.config.storage_key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted sync state, starting empty");
                return Ok(false);
            }
        };
        let Some(raw) = raw else {
            return Ok(false);
        };

        let snapshot = SyncSnapshot::from_json(&raw)?;
        let mut state = self.state.lock().await;
        state.queue = snapshot.queue(self.config.max_retries);
        state.cache = snapshot.tracker(self.config.max_cache_size);
        state.last_sync = snapshot.last_sync;
        state.overlay.clear_optimistic_updates();
        info!(
            operations = state.queue.len(),
            dirty = state.cache.dirty_count(),
            cached = state.cache.cache_size(),
            "Restored sync state"
        );
        Ok(true)
    }

    /// Start the periodic background sync.
    pub fn start(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        if let Some(previous) = lock(&self.timers).interval.take() {
            previous.cancel();
        }
        self.schedule_tick();
        info!(
            interval_ms = self.config.sync_interval.as_millis() as u64,
            "Sync engine started"
        );
        Ok(())
    }

    /// Stop scheduling cycles and close every event subscription. A cycle
    /// already in flight runs to completion.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut timers = lock(&self.timers);
            for handle in [timers.debounce.take(), timers.interval.take()]
                .into_iter()
                .flatten()
            {
                handle.cancel();
            }
        }
        lock(&self.events).take();
        info!("Sync engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Subscribe to lifecycle events. After shutdown the receiver is closed.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        match lock(&self.events).as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Record connectivity. Going online runs a sync; while offline cycles
    /// are skipped and work stays queued.
    pub async fn set_online(&self, online: bool) -> Option<CycleReport> {
        let was_online = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut state.online, online)
        };
        info!(online, "Connectivity changed");
        if online && !was_online {
            self.run_cycles(SyncTrigger::Online).await
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Record server versions of items, e.g. from an initial fetch.
    pub async fn observe_items(&self, items: impl IntoIterator<Item = ContentItem>) {
        let now = self.clock.now_millis();
        {
            let mut state = self.state.lock().await;
            for item in items {
                state.cache.observe(item, now);
            }
        }
        self.persist().await;
    }

    /// Create an item locally and queue it for upload. The item is not
    /// cached until the server confirms it.
    pub async fn create_item(&self, item: ContentItem) -> EnqueueOutcome {
        let now = self.clock.now_millis();
        let item_id = item.id.clone();
        let outcome = {
            let mut state = self.state.lock().await;
            let outcome = state.queue.enqueue(SyncOperation::create(item.clone(), now));
            state.overlay.apply_optimistic_update(
                &item_id,
                Tentative::Item(item),
                None,
                outcome.operation_id().cloned(),
                now,
            );
            outcome
        };
        debug!(item_id = %item_id, "Item created locally");
        self.after_mutation().await;
        outcome
    }

    /// Edit an item: render it immediately, mark it dirty and queue an
    /// update.
    pub async fn update_item(&self, item_id: &str, patch: ItemPatch) -> Result<EnqueueOutcome> {
        let now = self.clock.now_millis();
        let fields = patch.fields();
        let outcome = {
            let mut state = self.state.lock().await;
            if state.overlay.is_pending_delete(item_id) {
                return Err(Error::UnknownItem(item_id.to_string()));
            }

            // Latest local version: tentative, confirmed plus dirty edits, or
            // the payload of a create that has not been confirmed yet.
            let current = match state.overlay.get_optimistic_content(item_id) {
                Some(current) => Some(current.clone()),
                None => state
                    .cache
                    .local_view(item_id)
                    .or_else(|| state.queue.unconfirmed_create(item_id).cloned()),
            };
            let current = current.ok_or_else(|| Error::UnknownItem(item_id.to_string()))?;

            let previous = state.cache.get(item_id).map(|entry| entry.data.clone());
            let base_hash = previous
                .as_ref()
                .map(|item| self.hasher.hash(item))
                .transpose()?;
            if previous.is_some() {
                state.cache.set_dirty_change(item_id, patch.clone())?;
            }

            let tentative = patch.applied(&current);
            let outcome = state
                .queue
                .enqueue(SyncOperation::update(item_id, patch, base_hash, now));
            state.overlay.apply_optimistic_update(
                item_id,
                Tentative::Item(tentative),
                previous,
                outcome.operation_id().cloned(),
                now,
            );
            state.track_conflict_edit(item_id);
            outcome
        };
        debug!(item_id = %item_id, fields = ?fields, "Item updated locally");
        self.after_mutation().await;
        Ok(outcome)
    }

    /// Delete an item. Deleting an item whose create is still queued drops
    /// both without contacting the server.
    pub async fn delete_item(&self, item_id: &str) -> Result<EnqueueOutcome> {
        let now = self.clock.now_millis();
        let outcome = {
            let mut state = self.state.lock().await;
            let cached = state.cache.get(item_id).map(|entry| entry.data.clone());
            if cached.is_none() && !state.overlay.contains(item_id) {
                return Err(Error::UnknownItem(item_id.to_string()));
            }

            let base_hash = cached
                .as_ref()
                .map(|item| self.hasher.hash(item))
                .transpose()?;
            let outcome = state
                .queue
                .enqueue(SyncOperation::delete(item_id, base_hash, now));
            if let EnqueueOutcome::Cancelled(_) = outcome {
                state.overlay.rollback_optimistic_update(item_id);
                state.cache.remove(item_id);
            } else {
                state.overlay.apply_optimistic_update(
                    item_id,
                    Tentative::Deleted,
                    cached,
                    outcome.operation_id().cloned(),
                    now,
                );
            }
            outcome
        };
        debug!(item_id = %item_id, "Item deleted locally");
        self.after_mutation().await;
        Ok(outcome)
    }

    /// Record an autosave-style edit without queueing an operation. It is
    /// synced by the dirty-change phase of the next cycle.
    ///
    /// Items that already have queued operations (or a pending optimistic
    /// entry) take the [`update_item`](Self::update_item) path so the edit
    /// stays ordered behind them.
    pub async fn stage_edit(&self, item_id: &str, patch: ItemPatch) -> Result<()> {
        let fields = patch.fields();
        let routed = {
            let mut state = self.state.lock().await;
            if state.queue.has_ops_for(item_id) || state.overlay.contains(item_id) {
                Some(patch)
            } else {
                state.cache.set_dirty_change(item_id, patch)?;
                state.track_conflict_edit(item_id);
                None
            }
        };

        if let Some(patch) = routed {
            self.update_item(item_id, patch).await?;
            return Ok(());
        }
        debug!(item_id = %item_id, fields = ?fields, "Edit staged");
        self.after_mutation().await;
        Ok(())
    }

    async fn after_mutation(&self) {
        self.persist().await;
        self.schedule_debounced();
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The item as the user should see it: the optimistic version if one
    /// exists, otherwise the confirmed version with unsynced edits applied.
    pub async fn get_item(&self, item_id: &str) -> Option<ContentItem> {
        self.state.lock().await.local_version(item_id)
    }

    /// The tentative version of an item, if one is pending.
    pub async fn get_optimistic_content(&self, item_id: &str) -> Option<ContentItem> {
        self.state
            .lock()
            .await
            .overlay
            .get_optimistic_content(item_id)
            .cloned()
    }

    /// Unsynced edits by item.
    pub async fn dirty_changes(&self) -> HashMap<ItemId, ItemPatch> {
        self.state.lock().await.cache.get_dirty_changes()
    }

    /// Operations waiting to be sent.
    pub async fn pending_operations(&self) -> Vec<SyncOperation> {
        let state = self.state.lock().await;
        state.queue.pending_operations().into_iter().cloned().collect()
    }

    /// Operations that exhausted their retries or were rejected.
    pub async fn failed_operations(&self) -> Vec<SyncOperation> {
        let state = self.state.lock().await;
        state.queue.failed_operations().into_iter().cloned().collect()
    }

    /// Unresolved conflicts, oldest first.
    pub async fn pending_conflicts(&self) -> Vec<ConflictInfo> {
        let state = self.state.lock().await;
        state
            .conflicts
            .pending_conflicts()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn last_sync(&self) -> Option<Timestamp> {
        self.state.lock().await.last_sync
    }

    pub async fn get_sync_stats(&self) -> SyncStats {
        let is_syncing = lock(&self.gate).running;
        let state = self.state.lock().await;
        SyncStats {
            is_online: state.online,
            is_syncing,
            last_sync: state.last_sync,
            queue: state.queue.stats(),
            dirty: state.cache.dirty_count(),
            conflicts: state.conflicts.len(),
            cache_size: state.cache.cache_size(),
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop every queued operation and revert the affected items to their
    /// confirmed versions. Returns how many operations were dropped.
    pub async fn clear_sync_queue(&self) -> usize {
        let now = self.clock.now_millis();
        let dropped = {
            let mut state = self.state.lock().await;
            let dropped = state.queue.clear();
            let items: BTreeSet<&ItemId> = dropped.iter().map(|op| &op.item_id).collect();
            for item_id in items {
                state.abandon_local_changes(item_id, now);
            }
            dropped.len()
        };
        info!(dropped, "Cleared sync queue");
        self.persist().await;
        dropped
    }

    /// Requeue terminally failed operations and sync. Returns how many were
    /// requeued.
    pub async fn retry_failed_operations(&self) -> usize {
        let requeued = self.state.lock().await.queue.retry_failed();
        if requeued > 0 {
            info!(requeued, "Retrying failed operations");
            self.persist().await;
            self.run_cycles(SyncTrigger::Retry).await;
        }
        requeued
    }

    /// Enable or disable optimistic rendering for future mutations.
    pub async fn set_enable_optimistic_updates(&self, enabled: bool) {
        self.state.lock().await.overlay.set_enabled(enabled);
    }

    /// Drop clean cache entries. Items with unsynced edits are kept.
    pub async fn clear_cache(&self) {
        self.state.lock().await.cache.clear_cache();
        self.persist().await;
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Resolve a conflict by keeping the local version (re-uploaded over
    /// the remote one) or accepting the remote version.
    pub async fn resolve_conflict(&self, item_id: &str, use_local: bool) -> Result<()> {
        let mode = if use_local {
            ConflictStrategy::LocalFirst
        } else {
            ConflictStrategy::RemoteFirst
        };
        self.resolve_conflict_as(item_id, mode).await.map(|_| ())
    }

    /// Resolve a conflict with any mode. `Manual` leaves it pending and
    /// returns `false`.
    pub async fn resolve_conflict_as(&self, item_id: &str, mode: ResolutionMode) -> Result<bool> {
        let now = self.clock.now_millis();
        let resolved = {
            let mut state = self.state.lock().await;
            match state.conflicts.resolve_conflict(item_id, mode)? {
                Some((info, resolution)) => {
                    self.apply_resolution(&mut state, info, resolution, now);
                    true
                }
                None => false,
            }
        };
        if resolved {
            self.after_mutation().await;
        }
        Ok(resolved)
    }

    /// Resolve a conflict with a version the caller merged by hand.
    pub async fn resolve_conflict_with(&self, item_id: &str, merged: ContentItem) -> Result<()> {
        let now = self.clock.now_millis();
        {
            let mut state = self.state.lock().await;
            let (info, resolution) = state.conflicts.resolve_with(item_id, merged)?;
            self.apply_resolution(&mut state, info, resolution, now);
        }
        self.after_mutation().await;
        Ok(())
    }

    fn apply_resolution(
        &self,
        state: &mut EngineState,
        info: ConflictInfo,
        resolution: Resolution,
        now: Timestamp,
    ) {
        let item_id = info.item_id.clone();
        match resolution {
            Resolution::AcceptRemote(remote) => {
                state.queue.remove_for_item(&item_id);
                state.cache.confirm(remote, now);
                state.abandon_local_changes(&item_id, now);
                info!(item_id = %item_id, "Conflict resolved with the remote version");
            }
            Resolution::KeepLocal(chosen) | Resolution::Merged(chosen) => {
                let base_hash = match self.hasher.hash(&info.remote) {
                    Ok(hash) => Some(hash),
                    Err(e) => {
                        warn!(item_id = %item_id, error = %e, "Remote version cannot be fingerprinted");
                        None
                    }
                };
                state.cache.confirm(info.remote.clone(), now);

                let patch = ItemPatch::from_item(&chosen);
                if let Err(e) = state.cache.set_dirty_change(&item_id, patch.clone()) {
                    warn!(item_id = %item_id, error = %e, "Could not mark resolved item dirty");
                }
                let outcome = state
                    .queue
                    .enqueue(SyncOperation::update(item_id.clone(), patch, base_hash, now));

                if let Some(new_op) = outcome.operation_id().cloned() {
                    state.overlay.apply_optimistic_update(
                        &item_id,
                        Tentative::Item(chosen),
                        Some(info.remote.clone()),
                        Some(new_op.clone()),
                        now,
                    );
                    if let Some(old_op) = &info.operation_id {
                        state.overlay.replace_operation(&item_id, old_op, new_op);
                    }
                }
                info!(item_id = %item_id, "Conflict resolved, local version queued for upload");
            }
        }
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Run a sync cycle now.
    ///
    /// Returns the report of the last cycle run. Returns `None` without
    /// waiting when a cycle is already running; that cycle is then followed
    /// by exactly one more.
    pub async fn force_sync_now(&self) -> Option<CycleReport> {
        self.run_cycles(SyncTrigger::Forced).await
    }

    fn schedule_debounced(&self) {
        if self.is_shut_down() {
            return;
        }
        let engine = self.this.clone();
        let handle = self.scheduler.schedule(
            self.config.debounce,
            Box::new(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.spawn_cycle(SyncTrigger::Debounced);
                }
            }),
        );
        if let Some(previous) = lock(&self.timers).debounce.replace(handle) {
            previous.cancel();
        }
    }

    fn schedule_tick(&self) {
        if self.is_shut_down() {
            return;
        }
        let engine = self.this.clone();
        let handle = self.scheduler.schedule(
            self.config.sync_interval,
            Box::new(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.schedule_tick();
                    engine.spawn_cycle(SyncTrigger::Interval);
                }
            }),
        );
        // The replaced handle belongs to the tick that is firing right now.
        lock(&self.timers).interval = Some(handle);
    }

    fn spawn_cycle(&self, trigger: SyncTrigger) {
        if let Some(engine) = self.this.upgrade() {
            tokio::spawn(async move {
                engine.run_cycles(trigger).await;
            });
        }
    }

    async fn run_cycles(&self, trigger: SyncTrigger) -> Option<CycleReport> {
        if !self.enter_cycle() {
            debug!(trigger = %trigger, "Sync cycle already running, coalesced");
            return None;
        }

        let mut trigger = trigger;
        loop {
            let report = self.run_cycle(trigger).await;
            if !self.leave_cycle() {
                return Some(report);
            }
            trigger = SyncTrigger::Coalesced;
        }
    }

    fn enter_cycle(&self) -> bool {
        let mut gate = lock(&self.gate);
        if gate.running {
            gate.rerun = true;
            return false;
        }
        if self.is_shut_down() {
            return false;
        }
        gate.running = true;
        true
    }

    /// Returns `true` when a coalesced trigger asks for another cycle.
    fn leave_cycle(&self) -> bool {
        let mut gate = lock(&self.gate);
        if gate.rerun && !self.is_shut_down() {
            gate.rerun = false;
            return true;
        }
        gate.running = false;
        gate.rerun = false;
        false
    }

    // ------------------------------------------------------------------
    // Sync cycle
    // ------------------------------------------------------------------

    async fn run_cycle(&self, trigger: SyncTrigger) -> CycleReport {
        let started_at = self.clock.now_millis();
        {
            let state = self.state.lock().await;
            if !state.online {
                debug!(trigger = %trigger, "Offline, skipping sync cycle");
                return CycleReport::new(trigger, started_at);
            }
            if !state.has_work() {
                debug!(trigger = %trigger, "Nothing to sync");
                return CycleReport::new(trigger, started_at);
            }
        }

        self.emit(SyncEvent::Started { trigger });
        debug!(trigger = %trigger, "Sync cycle started");

        let mut report = CycleReport::new(trigger, started_at);
        self.sync_dirty_changes(&mut report).await;
        self.drain_queue(&mut report).await;

        let finished_at = self.clock.now_millis();
        report.finish(finished_at);
        self.state.lock().await.last_sync = Some(finished_at);

        self.refresh_canonical().await;
        self.persist().await;

        info!(
            trigger = %trigger,
            status = ?report.status,
            succeeded = report.succeeded,
            failed = report.failed,
            conflicts = report.conflicts,
            "Sync cycle finished"
        );

        if report.status == CycleStatus::Error {
            self.emit(SyncEvent::Error {
                message: format!(
                    "sync failed: {} failed, {} conflicted",
                    report.failed, report.conflicts
                ),
                report: report.clone(),
            });
        } else {
            let stats = self.get_sync_stats().await;
            self.emit(SyncEvent::Completed {
                report: report.clone(),
                stats,
            });
        }
        report
    }

    async fn sync_dirty_changes(&self, report: &mut CycleReport) {
        let work = self.collect_dirty_work().await;
        for chunk in work.chunks(self.config.dirty_batch_size.max(1)) {
            let results = settle_all(chunk.iter().map(|work| {
                let update =
                    self.remote
                        .update_item(&work.item_id, &work.patch, Some(&work.base_hash));
                (work, update)
            }))
            .await;

            for Settled { key, outcome } in results {
                self.settle_dirty_change(key, outcome, report).await;
            }
        }
    }

    async fn collect_dirty_work(&self) -> Vec<DirtyWork> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        let mut candidates: Vec<ItemId> = state.dirty_candidates().cloned().collect();
        candidates.sort();

        let mut work = Vec::with_capacity(candidates.len());
        for item_id in candidates {
            let (Some(entry), Some(change)) =
                (state.cache.get(&item_id), state.cache.dirty_change(&item_id))
            else {
                continue;
            };
            let patch = change.patch.clone();
            let revision = change.revision;

            match self.hasher.hash(&entry.data) {
                Ok(base_hash) => work.push(DirtyWork {
                    item_id,
                    patch,
                    revision,
                    base_hash,
                }),
                Err(e) => {
                    error!(item_id = %item_id, error = %e, "Dirty item cannot be fingerprinted");
                    let op = SyncOperation::update(item_id.clone(), patch, None, now);
                    state.queue.enqueue_failed(op, e.to_string());
                    state.abandon_local_changes(&item_id, now);
                }
            }
        }
        work
    }

    async fn settle_dirty_change(
        &self,
        work: &DirtyWork,
        outcome: std::result::Result<ContentItem, RemoteError>,
        report: &mut CycleReport,
    ) {
        match outcome {
            Ok(confirmed) => {
                let now = self.clock.now_millis();
                let mut state = self.state.lock().await;
                state.cache.confirm(confirmed, now);
                state.cache.clear_dirty_if_unchanged(&work.item_id, work.revision);
                state.overlay.retire_if_idle(&work.item_id);
                report.succeeded += 1;
                debug!(item_id = %work.item_id, "Dirty change synced");
            }
            Err(RemoteError::Conflict(_)) => {
                match self.raise_conflict(&work.item_id, None, &work.patch).await {
                    Ok(()) => report.conflicts += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(item_id = %work.item_id, error = %e, "Conflict snapshot unavailable, will retry");
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::Network => {
                report.failed += 1;
                warn!(item_id = %work.item_id, error = %e, "Dirty change failed, will retry");
            }
            Err(e) => {
                report.failed += 1;
                error!(item_id = %work.item_id, error = %e, "Dirty change rejected");
                let now = self.clock.now_millis();
                let op = SyncOperation::update(
                    work.item_id.clone(),
                    work.patch.clone(),
                    Some(work.base_hash.clone()),
                    now,
                );
                let mut state = self.state.lock().await;
                state.queue.enqueue_failed(op, e.to_string());
                state.abandon_local_changes(&work.item_id, now);
            }
        }
    }

    async fn drain_queue(&self, report: &mut CycleReport) {
        // Operations sent once this cycle are not sent again until the next.
        let mut attempted: HashSet<OperationId> = HashSet::new();
        loop {
            let batch = self.next_batch(&attempted).await;
            if batch.is_empty() {
                break;
            }
            attempted.extend(batch.iter().map(|dispatch| dispatch.op.id.clone()));

            for op_type in [
                OperationType::Create,
                OperationType::Update,
                OperationType::Delete,
            ] {
                let group: Vec<&Dispatch> = batch
                    .iter()
                    .filter(|dispatch| dispatch.op.op_type() == op_type)
                    .collect();
                if group.is_empty() {
                    continue;
                }

                let results = settle_all(
                    group
                        .into_iter()
                        .map(|dispatch| (dispatch, self.dispatch(&dispatch.op))),
                )
                .await;
                for Settled { key, outcome } in results {
                    self.settle_operation(key, outcome, report).await;
                }
            }
        }
    }

    async fn next_batch(&self, attempted: &HashSet<OperationId>) -> Vec<Dispatch> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        let mut skip = state.blocked_operations();
        skip.extend(attempted.iter().cloned());
        let ops = state
            .queue
            .dequeue_batch_excluding(self.config.queue_batch_size.max(1), &skip);

        let mut batch = Vec::with_capacity(ops.len());
        for mut op in ops {
            // Send against the latest confirmed version, which may have moved
            // since enqueue when earlier operations for the item completed.
            if op.op_type() != OperationType::Create {
                if let Some(entry) = state.cache.get(&op.item_id) {
                    match self.hasher.hash(&entry.data) {
                        Ok(hash) => op.base_hash = Some(hash),
                        Err(e) => {
                            error!(op_id = %op.id, item_id = %op.item_id, error = %e, "Item cannot be fingerprinted");
                            state.queue.mark_rejected(&op.id, e.to_string());
                            state.abandon_local_changes(&op.item_id, now);
                            continue;
                        }
                    }
                }
            }
            let revision = state.cache.dirty_revision(&op.item_id);
            batch.push(Dispatch { op, revision });
        }
        batch
    }

    async fn dispatch(
        &self,
        op: &SyncOperation,
    ) -> std::result::Result<Option<ContentItem>, RemoteError> {
        match &op.kind {
            OperationKind::Create(item) => self.remote.create_item(item).await.map(Some),
            OperationKind::Update(patch) => self
                .remote
                .update_item(&op.item_id, patch, op.base_hash.as_ref())
                .await
                .map(Some),
            OperationKind::Delete => match self.remote.delete_item(&op.item_id).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    async fn settle_operation(
        &self,
        dispatch: &Dispatch,
        outcome: std::result::Result<Option<ContentItem>, RemoteError>,
        report: &mut CycleReport,
    ) {
        let op = &dispatch.op;
        match outcome {
            Ok(confirmed) => {
                let now = self.clock.now_millis();
                let mut state = self.state.lock().await;
                Self::complete_operation(&mut state, dispatch, confirmed, now);
                report.succeeded += 1;
            }
            Err(RemoteError::Conflict(_)) if op.op_type() == OperationType::Update => {
                let no_patch = ItemPatch::new();
                let patch = match &op.kind {
                    OperationKind::Update(patch) => patch,
                    _ => &no_patch,
                };
                match self.raise_conflict(&op.item_id, Some(&op.id), patch).await {
                    Ok(()) => report.conflicts += 1,
                    Err(e) => {
                        report.failed += 1;
                        self.record_failure(op, &format!("conflict snapshot unavailable: {}", e))
                            .await;
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::Network | ErrorKind::Conflict) => {
                report.failed += 1;
                self.record_failure(op, &e.to_string()).await;
            }
            Err(e) => {
                report.failed += 1;
                error!(op_id = %op.id, item_id = %op.item_id, error = %e, "Operation rejected");
                let mut state = self.state.lock().await;
                state.queue.mark_rejected(&op.id, e.to_string());
                state.abandon_local_changes(&op.item_id, self.clock.now_millis());
            }
        }
    }

    fn complete_operation(
        state: &mut EngineState,
        dispatch: &Dispatch,
        confirmed: Option<ContentItem>,
        now: Timestamp,
    ) {
        let op = &dispatch.op;
        if state.queue.mark_completed(&op.id).is_none() {
            debug!(op_id = %op.id, "Operation was cleared while in flight");
        }

        let mut item_id = op.item_id.clone();
        match (&op.kind, confirmed) {
            (OperationKind::Delete, _) => {
                state.cache.remove(&item_id);
            }
            (_, Some(item)) => {
                if item.id != item_id {
                    debug!(old_id = %item_id, new_id = %item.id, "Server assigned a new item id");
                    state.queue.remap_item(&item_id, &item.id);
                    state.overlay.remap_item(&item_id, &item.id);
                    state.cache.remove(&item_id);
                    item_id = item.id.clone();
                }
                state.cache.confirm(item, now);
            }
            (_, None) => {}
        }

        if !state.queue.has_ops_for(&item_id) {
            if let Some(revision) = dispatch.revision {
                state.cache.clear_dirty_if_unchanged(&item_id, revision);
            }
        }
        state.overlay.settle(&item_id, &op.id);
        debug!(op_id = %op.id, item_id = %item_id, op_type = %op.op_type(), "Operation synced");
    }

    async fn record_failure(&self, op: &SyncOperation, reason: &str) {
        let mut state = self.state.lock().await;
        match state.queue.mark_failed(&op.id, reason) {
            Some(OperationStatus::Failed) => {
                error!(op_id = %op.id, item_id = %op.item_id, error = %reason, "Operation failed permanently");
                state.abandon_local_changes(&op.item_id, self.clock.now_millis());
            }
            Some(_) => {
                warn!(op_id = %op.id, item_id = %op.item_id, error = %reason, "Operation failed, will retry");
            }
            None => {
                debug!(op_id = %op.id, "Failed operation is no longer queued");
            }
        }
    }

    /// Fetch the server version of a rejected item and record the conflict,
    /// resolving it right away unless the strategy is manual.
    async fn raise_conflict(
        &self,
        item_id: &str,
        op_id: Option<&OperationId>,
        patch: &ItemPatch,
    ) -> std::result::Result<(), RemoteError> {
        let remote = self.remote.fetch_item(item_id).await?;
        let now = self.clock.now_millis();
        let strategy = self.config.conflict_strategy;

        let auto_resolution = {
            let mut state = self.state.lock().await;
            if let Some(op_id) = op_id {
                state.queue.remove(op_id);
            }

            let local = state
                .local_version(item_id)
                .unwrap_or_else(|| patch.applied(&remote));
            let mut info = ConflictInfo::new(local, remote, now);
            if let Some(op_id) = op_id {
                info = info.with_operation(op_id.clone());
            }
            if state.conflicts.add_conflict(info).is_some() {
                debug!(item_id = %item_id, "Superseded an older conflict");
            }
            warn!(item_id = %item_id, strategy = %strategy, "Conflict detected");

            match strategy {
                ConflictStrategy::Manual => None,
                mode => match state.conflicts.resolve_conflict(item_id, mode) {
                    Ok(Some((info, resolution))) => {
                        let auto = info.auto_resolution_mode;
                        self.apply_resolution(&mut state, info, resolution, now);
                        auto
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(item_id = %item_id, error = %e, "Automatic resolution unavailable, left for manual resolution");
                        None
                    }
                },
            }
        };

        self.emit(SyncEvent::ConflictDetected {
            item_id: item_id.to_string(),
            auto_resolution,
        });
        Ok(())
    }

    async fn refresh_canonical(&self) {
        match self.store.refresh_all().await {
            Ok(items) => {
                let now = self.clock.now_millis();
                let count = items.len();
                self.state.lock().await.cache.reconcile(items, now);
                debug!(items = count, "Canonical item list refreshed");
            }
            Err(e) => warn!(error = %e, "Failed to refresh canonical item list"),
        }
    }

    // ------------------------------------------------------------------
    // Persistence and events
    // ------------------------------------------------------------------

    async fn persist(&self) {
        // Writes go out in capture order.
        let _writer = self.persist_lock.lock().await;
        let snapshot = {
            let state = self.state.lock().await;
            SyncSnapshot::capture(
                &state.queue,
                &state.cache,
                state.last_sync,
                self.clock.now_millis(),
            )
        };

        let result = match snapshot.to_json() {
            Ok(json) => self
                .storage
                .set(&self.config.storage_key, json)
                .await
                .map_err(Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist sync state, continuing in memory");
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(sender) = lock(&self.events).as_ref() {
            // No subscribers is fine.
            let _ = sender.send(event);
        }
    }
}

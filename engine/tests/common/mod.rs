//! Mock collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use syncwell_engine::{
    CanonicalStore, ContentHash, ContentItem, HashManager, ItemPatch, ManualClock,
    ManualScheduler, MemoryStorage, RemoteError, RemoteService, Storage, SyncConfig, SyncDeps,
    SyncEngine, SyncEvent,
};
use tokio::sync::{broadcast, Notify};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A recorded call to the mock remote.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Fetch(String),
    Create(String),
    Update(String, ItemPatch),
    Delete(String),
}

#[derive(Default)]
struct RemoteState {
    items: BTreeMap<String, ContentItem>,
    calls: Vec<Call>,
    failures: HashMap<String, RemoteError>,
    server_ids: Option<usize>,
    refreshes: usize,
    refresh_down: bool,
}

/// In-memory server that checks base hashes like a real one would.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<RemoteState>,
    hasher: HashManager,
    held: AtomicBool,
    entered: Notify,
    release: Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    pub fn seed(&self, items: impl IntoIterator<Item = ContentItem>) {
        let mut state = self.state();
        for item in items {
            state.items.insert(item.id.clone(), item);
        }
    }

    pub fn item(&self, id: &str) -> Option<ContentItem> {
        self.state().items.get(id).cloned()
    }

    /// Change an item as another client would.
    pub fn edit_remotely(&self, id: &str, edit: impl FnOnce(&mut ContentItem)) {
        let mut state = self.state();
        let item = state.items.get_mut(id).expect("item exists remotely");
        edit(item);
    }

    /// Fail every write for `id` with `error` until healed.
    pub fn fail(&self, id: &str, error: RemoteError) {
        self.state().failures.insert(id.to_string(), error);
    }

    pub fn heal(&self, id: &str) {
        self.state().failures.remove(id);
    }

    /// Make `refresh_all` fail, so the engine keeps only what it reconciled
    /// itself.
    pub fn break_refresh(&self) {
        self.state().refresh_down = true;
    }

    /// Make creates return `srv-<n>` ids instead of the submitted one.
    pub fn assign_server_ids(&self) {
        self.state().server_ids = Some(0);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn update_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Update(..)))
            .count()
    }

    pub fn refresh_count(&self) -> usize {
        self.state().refreshes
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Block updates until [`release_updates`](Self::release_updates).
    pub fn hold_updates(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub async fn wait_for_held_update(&self) {
        self.entered.notified().await;
    }

    pub fn release_updates(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    fn begin(&self, call: Call) -> Result<(), RemoteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut state = self.state();
        let id = match &call {
            Call::Fetch(id) | Call::Create(id) | Call::Update(id, _) | Call::Delete(id) => id.clone(),
        };
        let fetch = matches!(call, Call::Fetch(_));
        state.calls.push(call);
        match state.failures.get(&id) {
            Some(error) if !fetch => Err(error.clone()),
            _ => Ok(()),
        }
    }

    async fn yield_then_end(&self) {
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn fetch_item(&self, id: &str) -> Result<ContentItem, RemoteError> {
        let result = self
            .begin(Call::Fetch(id.to_string()))
            .and_then(|_| self.item(id).ok_or_else(|| RemoteError::NotFound(id.to_string())));
        self.yield_then_end().await;
        result
    }

    async fn create_item(&self, item: &ContentItem) -> Result<ContentItem, RemoteError> {
        let result = self.begin(Call::Create(item.id.clone())).map(|_| {
            let mut state = self.state();
            let mut created = item.clone();
            if let Some(n) = state.server_ids.as_mut() {
                *n += 1;
                created.id = format!("srv-{}", n);
            }
            state.items.insert(created.id.clone(), created.clone());
            created
        });
        self.yield_then_end().await;
        result
    }

    async fn update_item(
        &self,
        id: &str,
        patch: &ItemPatch,
        base_hash: Option<&ContentHash>,
    ) -> Result<ContentItem, RemoteError> {
        if self.held.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }

        let result = self
            .begin(Call::Update(id.to_string(), patch.clone()))
            .and_then(|_| {
                let mut state = self.state();
                let current = state
                    .items
                    .get_mut(id)
                    .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
                if let Some(base) = base_hash {
                    let server_hash = self
                        .hasher
                        .hash(&*current)
                        .map_err(|e| RemoteError::Validation(e.to_string()))?;
                    if &server_hash != base {
                        return Err(RemoteError::Conflict(id.to_string()));
                    }
                }
                patch.apply_to(current);
                current.updated_at += 1;
                Ok(current.clone())
            });
        self.yield_then_end().await;
        result
    }

    async fn delete_item(&self, id: &str) -> Result<(), RemoteError> {
        let result = self.begin(Call::Delete(id.to_string())).and_then(|_| {
            self.state()
                .items
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))
        });
        self.yield_then_end().await;
        result
    }
}

#[async_trait]
impl CanonicalStore for MockRemote {
    async fn refresh_all(&self) -> Result<Vec<ContentItem>, RemoteError> {
        let mut state = self.state();
        state.refreshes += 1;
        if state.refresh_down {
            return Err(RemoteError::Network("listing unavailable".into()));
        }
        Ok(state.items.values().cloned().collect())
    }
}

/// An engine wired to mocks, with manual time.
pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub remote: Arc<MockRemote>,
    pub scheduler: ManualScheduler,
    pub clock: Arc<ManualClock>,
}

pub fn harness(config: SyncConfig) -> Harness {
    harness_with(config, MockRemote::new(), Arc::new(MemoryStorage::new()))
}

pub fn harness_with(
    config: SyncConfig,
    remote: Arc<MockRemote>,
    storage: Arc<dyn Storage>,
) -> Harness {
    init_tracing();
    let scheduler = ManualScheduler::new();
    let clock = Arc::new(ManualClock::new(1_000));
    let deps = SyncDeps::new(remote.clone(), remote.clone())
        .with_storage(storage)
        .with_clock(clock.clone())
        .with_scheduler(Arc::new(scheduler.clone()));
    Harness {
        engine: SyncEngine::new(config, deps),
        remote,
        scheduler,
        clock,
    }
}

impl Harness {
    /// Put the same items on the server and in the engine's cache.
    pub async fn seed(&self, items: &[ContentItem]) {
        self.remote.seed(items.iter().cloned());
        self.engine.observe_items(items.iter().cloned()).await;
        self.clock.advance(Duration::from_millis(10));
    }
}

/// Drain every event received so far.
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait for the next `Completed` or `Error` event.
pub async fn next_cycle_end(rx: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event @ (SyncEvent::Completed { .. } | SyncEvent::Error { .. })) => {
                    return event
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .expect("sync cycle finished in time")
}

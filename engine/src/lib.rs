//! # Syncwell Engine
//!
//! A client-side synchronization engine for applications that edit content
//! locally and reconcile it with a remote authoritative store.
//!
//! Local mutations are rendered immediately through an optimistic overlay,
//! recorded in a durable retryable queue, and drained to the remote service in
//! batched sync cycles. Rejected stale writes are surfaced as conflicts that can
//! be resolved automatically or by the user.
//!
//! ## Components
//!
//! - [`HashManager`] - stable content fingerprints used to detect staleness
//! - [`ChangeQueue`] - ordered, coalescing queue of pending [`SyncOperation`]s
//! - [`DirtyTracker`] - bounded cache of confirmed items plus unsynced edits
//! - [`OptimisticOverlay`] - tentative local versions shown while in flight
//! - [`ConflictResolver`] - holds local/remote divergence until resolved
//! - [`SyncEngine`] - the orchestrator tying everything into sync cycles
//!
//! ## Collaborators
//!
//! The engine never talks to a network or a disk directly. It is constructed
//! with injected implementations of:
//!
//! - [`RemoteService`] - fetch/create/update/delete against the server
//! - [`CanonicalStore`] - the application's canonical item list
//! - [`Storage`] - durable key-value storage for the queue and cache
//! - [`Clock`] and [`Scheduler`] - time and timers, swappable in tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use syncwell_engine::{
//!     CanonicalStore, ContentItem, ItemPatch, RemoteService, SyncConfig, SyncDeps, SyncEngine,
//! };
//!
//! # async fn run(remote: Arc<dyn RemoteService>, store: Arc<dyn CanonicalStore>) {
//! let engine = SyncEngine::new(SyncConfig::default(), SyncDeps::new(remote, store));
//! engine.restore().await.ok();
//! engine.start().expect("engine is running");
//!
//! engine.observe_items(vec![ContentItem::new("lesson-1", "Intro")]).await;
//! engine
//!     .update_item("lesson-1", ItemPatch::new().title("Introduction"))
//!     .await
//!     .unwrap();
//!
//! // Rendered immediately, synced in the background.
//! let item = engine.get_item("lesson-1").await.unwrap();
//! assert_eq!(item.title, "Introduction");
//! # }
//! ```

pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod error;
pub mod events;
pub mod hash;
pub mod item;
pub mod operation;
pub mod optimistic;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod snapshot;
pub mod storage;

// Re-export main types at crate root
pub use batch::{settle_all, Settled};
pub use cache::{CacheEntry, DirtyChange, DirtyTracker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use conflict::{
    AutoResolution, ConflictInfo, ConflictResolver, ConflictStrategy, MergeFn, Resolution,
    ResolutionMode,
};
pub use error::{Error, ErrorKind, HashError, RemoteError, StorageError};
pub use events::{CycleReport, CycleStatus, SyncEvent, SyncStats, SyncTrigger};
pub use hash::{ContentHash, HashManager};
pub use item::{ContentItem, ItemPatch};
pub use operation::{OperationKind, OperationStatus, OperationType, SyncOperation};
pub use optimistic::{OptimisticEntry, OptimisticOverlay, Tentative};
pub use orchestrator::{SyncDeps, SyncEngine};
pub use queue::{ChangeQueue, EnqueueOutcome, QueueStats};
pub use remote::{CanonicalStore, RemoteService};
pub use scheduler::{ManualScheduler, Scheduler, TaskHandle, TokioScheduler};
pub use snapshot::{SyncSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use storage::{FileStorage, MemoryStorage, Storage};

/// Type aliases for clarity
pub type ItemId = String;
pub type OperationId = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

//! Timer abstraction for debounced and periodic sync triggers.
//!
//! A scheduled callback only *triggers* work; it must not run a sync cycle
//! inline. Cancelling a timer therefore never cancels an in-flight cycle.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Callback fired when a timer elapses.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled callback.
pub trait TaskHandle: Send + Sync {
    /// Prevent the callback from firing. No effect once it has fired.
    fn cancel(&self);
}

/// Runs callbacks after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, after: Duration, callback: Callback) -> Box<dyn TaskHandle>;
}

/// Scheduler backed by tokio timers. Must be used inside a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

struct TokioTask(AbortHandle);

impl TaskHandle for TokioTask {
    fn cancel(&self) {
        self.0.abort();
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, after: Duration, callback: Callback) -> Box<dyn TaskHandle> {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            callback();
        });
        Box::new(TokioTask(handle.abort_handle()))
    }
}

struct ManualTask {
    id: u64,
    due: Duration,
    callback: Callback,
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    next_id: u64,
    tasks: Vec<ManualTask>,
}

/// Scheduler driven by explicit calls to [`advance`](ManualScheduler::advance).
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

struct ManualHandle {
    id: u64,
    state: Arc<Mutex<ManualState>>,
}

impl TaskHandle for ManualHandle {
    fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tasks.retain(|task| task.id != self.id);
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward and fire every callback that became due, in due
    /// order. Returns how many fired.
    pub fn advance(&self, by: Duration) -> usize {
        let due: Vec<ManualTask> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.elapsed += by;
            let now = state.elapsed;
            let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.tasks)
                .into_iter()
                .partition(|task| task.due <= now);
            state.tasks = pending;
            due.sort_by_key(|task| (task.due, task.id));
            due
        };

        // Callbacks may schedule again, so the lock is released first.
        let fired = due.len();
        for task in due {
            (task.callback)();
        }
        fired
    }

    /// Number of callbacks waiting to fire.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, after: Duration, callback: Callback) -> Box<dyn TaskHandle> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_id += 1;
        let id = state.next_id;
        let due = state.elapsed + after;
        state.tasks.push(ManualTask { id, due, callback });
        Box::new(ManualHandle {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

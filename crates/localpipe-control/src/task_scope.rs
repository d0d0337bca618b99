//! Cancellable task scope
//!
//! Tracks the background tasks spawned on behalf of one owner (a service, a
//! test, a CLI command) and cancels them together.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::debug;

/// A cancellable scope that owns spawned background tasks
#[derive(Clone, Debug, Default)]
pub struct TaskScope {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TaskScope {
    /// Create a new, independent scope
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Create a child scope.
    ///
    /// Cancelling the parent cancels the child. The child tracks its own
    /// tasks, so `shutdown()` on the child only waits for those.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn a task inside this scope.
    ///
    /// The task resolves to `None` if the scope is cancelled before `fut`
    /// completes; `fut` is dropped at that point.
    pub fn spawn<F, T>(&self, name: &'static str, fut: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                out = fut => Some(out),
                _ = token.cancelled() => {
                    debug!(task = name, "Task cancelled by scope");
                    None
                }
            }
        })
    }

    /// Spawn a task that watches [`TaskScope::cancelled`] on its own.
    ///
    /// The scope tracks the task but never drops it early, so the task can
    /// run its cleanup after cancellation.
    pub fn spawn_cooperative<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.tracker.spawn(fut)
    }

    /// Cancel every task in this scope and in its children
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the scope is cancelled
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Number of tasks spawned in this scope that are still running
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel the scope and wait until all of its tasks have finished
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Task scope shut down");
    }
}

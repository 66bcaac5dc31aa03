//! Lifetime extension for work that outlives the event that started it.
//!
//! A handler that answers a request before its side work is done (a
//! stale-while-revalidate refresh, a background cache update) registers that
//! work here. The host must not recycle the worker until [`LifetimeTracker::settle`]
//! resolves.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Tracks spawned side tasks of a worker.
#[derive(Debug, Clone, Default)]
pub struct LifetimeTracker {
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl LifetimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` and keep the worker alive until it finishes.
    pub fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.lock().push(handle);
    }

    /// Number of tasks registered and not yet collected by `settle`.
    pub fn pending(&self) -> usize {
        self.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every registered task, including tasks registered while
    /// waiting. Returns how many tasks were awaited.
    pub async fn settle(&self) -> usize {
        let mut settled = 0;
        loop {
            let batch: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock());
            if batch.is_empty() {
                break;
            }
            settled += batch.len();
            for result in join_all(batch).await {
                if let Err(e) = result {
                    warn!(error = %e, "Background task did not complete");
                }
            }
        }
        trace!(settled, "Worker settled");
        settled
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_settle_waits_for_tasks() {
        let tracker = LifetimeTracker::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            tracker.wait_until(async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(tracker.settle().await, 3);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_settle_includes_nested_tasks() {
        let tracker = LifetimeTracker::new();
        let done = Arc::new(AtomicUsize::new(0));

        let inner_tracker = tracker.clone();
        let inner_done = done.clone();
        tracker.wait_until(async move {
            inner_tracker.wait_until(async move {
                inner_done.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(tracker.settle().await, 2);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settle_with_nothing_pending() {
        assert_eq!(LifetimeTracker::new().settle().await, 0);
    }
}

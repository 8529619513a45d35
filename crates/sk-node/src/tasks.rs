//! Background task bookkeeping for graceful shutdown

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A set of spawned tasks that can be waited on with a deadline and
/// dropped once the deadline passes
#[derive(Clone, Default)]
pub struct TaskGroup {
    tracker: TaskTracker,
    abort: CancellationToken,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let abort = self.abort.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {}
                _ = task => {}
            }
        });
    }

    /// Wait up to `grace` for every task to finish on its own, then drop
    /// the rest. Returns false if anything had to be dropped.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return true;
        }
        tracing::warn!(
            remaining = self.tracker.len(),
            "Tasks still running after {:?}, dropping them",
            grace
        );
        self.abort.cancel();
        self.tracker.wait().await;
        false
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cooperative_tasks_finish_in_time() {
        let group = TaskGroup::new();
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let cancel = cancel.clone();
            group.spawn(async move { cancel.cancelled().await });
        }
        assert_eq!(group.len(), 3);

        cancel.cancel();
        assert!(group.shutdown(Duration::from_secs(1)).await);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_stuck_task_dropped_after_grace() {
        let group = TaskGroup::new();
        group.spawn(std::future::pending());

        let started = std::time::Instant::now();
        assert!(!group.shutdown(Duration::from_millis(50)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(group.is_empty());
    }
}

//! Task group for the node's background loops
//!
//! Every loop gets a child of one `CancellationToken`; shutdown cancels it
//! and waits for the loops to return before shared state is torn down.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct TaskGroup {
    token: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Token loops select on
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn `fut` unless the group is already shutting down
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // checked under the lock so `shutdown` cannot take the set in between
        let mut tasks = self.tasks();
        if self.token.is_cancelled() {
            log::debug!("Task group closed, not spawning {}", name);
            return;
        }
        tasks.spawn(async move {
            log::debug!("{} started", name);
            fut.await;
            log::debug!("{} exited", name);
        });
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every task and wait up to `grace` for them to return;
    /// stragglers are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.token.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks());

        let drained = tokio::time::timeout(grace, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        log::error!("Background task panicked: {}", e);
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            log::warn!("{} background tasks did not stop in time, aborting", tasks.len());
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_waits_for_loops() {
        let group = TaskGroup::new();
        let exited = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let token = group.token();
            let exited = exited.clone();
            group.spawn("loop", async move {
                token.cancelled().await;
                exited.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(group.len(), 3);

        group.shutdown(Duration::from_secs(1)).await;
        assert_eq!(exited.load(Ordering::SeqCst), 3);
        assert!(group.is_empty());

        // no new work after shutdown
        group.spawn("late", async {});
        assert!(group.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_racing_shutdown_is_never_orphaned() {
        let group = Arc::new(TaskGroup::new());
        let spawner = {
            let group = group.clone();
            tokio::spawn(async move {
                while !group.is_cancelled() {
                    let token = group.token();
                    group.spawn("late", async move { token.cancelled().await });
                    tokio::task::yield_now().await;
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        group.shutdown(Duration::from_secs(1)).await;
        spawner.await.unwrap();
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_stuck_task_aborted() {
        let group = TaskGroup::new();
        group.spawn("stuck", std::future::pending());
        group.shutdown(Duration::from_millis(20)).await;
        assert!(group.is_empty());
    }
}

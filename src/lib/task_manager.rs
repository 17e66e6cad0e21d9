//! Tracks the background tasks spawned by the server so shutdown can join
//! them instead of leaking them.

use std::sync::Mutex as StdMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Manages a collection of spawned tokio tasks.
///
/// Every long-lived task (job consumers, user directory loops, session I/O,
/// the metrics exporter) is spawned through this manager, so `stop()` can
/// wait for all of them to wind down.
pub struct TaskManager {
    tasks: StdMutex<Vec<(JoinHandle<()>, String)>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Spawns a named task and adds it to the managed collection.
    pub fn spawn<F>(&self, name: &str, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push((handle, name.to_string()));
        }
    }

    /// Waits for all managed tasks to complete.
    pub async fn join_all(&self) {
        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        for (handle, name) in handles {
            debug!("Joining task: {}", name);
            let _ = handle.await;
        }
    }

    /// Aborts all managed tasks without waiting for them.
    pub async fn abort_all(&self) {
        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        for (handle, name) in handles {
            handle.abort();
            warn!("Killed task: {}", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_all_waits_for_tasks() {
        let manager = TaskManager::new();
        let (tx, rx) = async_channel::bounded(1);
        manager.spawn("sender", async move {
            tx.send(42u32).await.unwrap();
        });
        manager.join_all().await;
        assert_eq!(rx.try_recv().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_abort_all_cancels_pending_tasks() {
        let manager = TaskManager::new();
        manager.spawn("sleeper", async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        manager.abort_all().await;
        // a second join must not hang on the aborted task
        manager.join_all().await;
    }
}

//! Tracks every long-running cooperative task by name.
//!
//! A finished task removes itself from the tracking map through a weak
//! back-reference, so the map never keeps the supervisor alive on its own.
//! Task errors are logged with the task's name instead of vanishing.

use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct NamedTask {
    name: String,
    handle: JoinHandle<()>,
}

pub struct TaskSupervisor {
    tasks: Mutex<HashMap<u64, NamedTask>>,
    next_id: AtomicU64,
    token: CancellationToken,
}

impl TaskSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(TaskSupervisor {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            token: CancellationToken::new(),
        })
    }

    /// Token every spawned loop selects on.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(self: &Arc<Self>, name: &str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task_name = name.to_string();
        let weak: Weak<TaskSupervisor> = Arc::downgrade(self);

        let log_name = task_name.clone();
        let handle = tokio::spawn(async move {
            match future.await {
                Ok(()) => log::debug!("task '{log_name}' finished"),
                Err(e) => log::error!("task '{log_name}' failed: {e}"),
            }
            if let Some(supervisor) = weak.upgrade() {
                supervisor.remove(id);
            }
        });

        self.insert(id, NamedTask {
            name: task_name,
            handle,
        });
    }

    fn insert(&self, id: u64, task: NamedTask) {
        match self.tasks.lock() {
            Ok(mut guard) => {
                guard.insert(id, task);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id, task);
            }
        }
    }

    fn remove(&self, id: u64) {
        match self.tasks.lock() {
            Ok(mut guard) => {
                guard.remove(&id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&id);
            }
        }
    }

    pub fn task_count(&self) -> usize {
        match self.tasks.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Cancel everything, await each task up to `grace`, abort stragglers.
    /// Idempotent.
    pub async fn shutdown(&self, grace: Duration) {
        self.token.cancel();
        let tasks: Vec<NamedTask> = {
            match self.tasks.lock() {
                Ok(mut guard) => guard.drain().map(|(_, task)| task).collect(),
                Err(poisoned) => poisoned.into_inner().drain().map(|(_, task)| task).collect(),
            }
        };
        for task in tasks {
            let mut handle = task.handle;
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => log::error!("task '{}' ended abnormally: {e}", task.name),
                Err(_) => {
                    log::warn!("task '{}' ignored cancellation within {grace:?}, aborting", task.name);
                    handle.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoxError;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_completed_task_removes_itself() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("short", async { Ok(()) });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.task_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_task_removed_and_logged() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("broken", async {
            Err(VoxError::State("boom".to_string()))
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.task_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_cooperative_loops() {
        let supervisor = TaskSupervisor::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();
        let token = supervisor.cancel_token();
        supervisor.spawn("looper", async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        stopped_clone.store(true, Ordering::SeqCst);
                        return Ok(());
                    }
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        });
        assert_eq!(supervisor.task_count(), 1);
        supervisor.shutdown(Duration::from_secs(1)).await;
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(supervisor.task_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stubborn_task() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("stubborn", async {
            std::future::pending::<()>().await;
            Ok(())
        });
        let started = std::time::Instant::now();
        supervisor.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(supervisor.task_count(), 0);
    }
}

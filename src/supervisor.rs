//! # Long-lived background task supervision.
//!
//! [`TaskSupervisor`] owns a [`TaskSet`] of fire-and-forget background
//! tasks (work-source watchers, maintenance loops) and a reaper loop that
//! logs their outcomes. Unlike queue processing, these tasks have no
//! delivery to settle; supervision here means observing exits, never
//! restarting.
//!
//! ```text
//!   spawn/add ──▶ TaskSet ──▶ run(): wait ──▶ log outcome
//!                    │
//!                  close(grace): drain, abort stragglers
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::TaskError;
use crate::sync::{flatten_join, TaskHandle, TaskSet};

/// Supervises fire-and-forget background tasks.
pub struct TaskSupervisor {
    tasks: Arc<TaskSet>,
    grace: Duration,
}

impl TaskSupervisor {
    /// Creates a supervisor that allows tasks `grace` to stop voluntarily
    /// during [`close`](Self::close).
    pub fn new(grace: Duration) -> Self {
        Self {
            tasks: Arc::new(TaskSet::new()),
            grace,
        }
    }

    /// Spawns `future` as a supervised background task.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> TaskHandle
    where
        F: std::future::Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.tasks.spawn(name, future)
    }

    /// Adopts an already-running task into supervision.
    pub fn add(&self, name: impl Into<String>, join: JoinHandle<Result<(), TaskError>>) -> TaskHandle {
        self.tasks.add(name, join)
    }

    /// Stops and untracks one task, waiting for it to wind down.
    ///
    /// No-op when the task already finished or was removed.
    pub async fn remove(&self, handle: &TaskHandle) {
        let Some(join) = self.tasks.remove(handle) else {
            return;
        };
        join.abort();
        match flatten_join(join.await) {
            Ok(()) | Err(TaskError::Canceled) => {}
            Err(err) => {
                error!(
                    task = handle.name(),
                    label = err.as_label(),
                    error = %err,
                    "background task failed while being removed",
                );
            }
        }
    }

    /// Names of all currently supervised tasks, for diagnostics.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.all_names()
    }

    /// Reaper loop: waits for task exits and logs each outcome.
    ///
    /// Supervised tasks are expected to run until shutdown, so even a
    /// clean exit is logged at warn. Returns when the set is emptied by
    /// [`close`](Self::close); run it as its own task.
    pub async fn run(&self) {
        loop {
            self.tasks.wait_non_empty().await;
            let finished = self.tasks.wait().await;
            if finished.is_empty() {
                return;
            }
            for task in finished {
                match task.outcome {
                    Ok(()) => {
                        warn!(task = task.handle.name(), "background task completed");
                    }
                    Err(err) if err.is_cancellation() => {
                        debug!(task = task.handle.name(), "background task cancelled");
                    }
                    Err(err) => {
                        error!(
                            task = task.handle.name(),
                            label = err.as_label(),
                            error = %err,
                            "background task failed",
                        );
                    }
                }
            }
        }
    }

    /// Stops all supervised tasks.
    ///
    /// Waits up to the configured grace for voluntary exits, then aborts
    /// the stragglers. Idempotent.
    pub async fn close(&self) {
        self.tasks.close(self.grace).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn test_remove_stops_running_task() {
        let supervisor = TaskSupervisor::new(Duration::from_secs(1));
        let handle = supervisor.spawn("stuck", async {
            std::future::pending::<()>().await;
            Ok(())
        });

        supervisor.remove(&handle).await;
        assert!(supervisor.task_names().is_empty());

        // Removing again is a no-op.
        supervisor.remove(&handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_after_close_empties_set() {
        let supervisor = Arc::new(TaskSupervisor::new(Duration::ZERO));
        supervisor.spawn("loop", async {
            std::future::pending::<()>().await;
            Ok(())
        });

        let reaper = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.run().await })
        };
        time::sleep(Duration::from_millis(1)).await;

        supervisor.close().await;
        reaper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_task_failures() {
        let supervisor = Arc::new(TaskSupervisor::new(Duration::ZERO));
        supervisor.spawn("bad", async {
            Err(TaskError::Fail {
                error: "broken".into(),
            })
        });

        let reaper = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.run().await })
        };
        time::sleep(Duration::from_millis(1)).await;

        // The failure was reaped and logged; the loop is still alive.
        assert!(supervisor.task_names().is_empty());
        assert!(!reaper.is_finished());

        supervisor.spawn("hold", async {
            std::future::pending::<()>().await;
            Ok(())
        });
        supervisor.close().await;
        reaper.await.unwrap();
    }
}

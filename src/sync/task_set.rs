//! # Wait for any of a dynamically changing set of tasks.
//!
//! [`TaskSet`] tracks running tasks and exposes "suspend until at least one
//! tracked task finishes," correct even when tasks are added or removed
//! while a wait is in flight.
//!
//! ## Race-freedom
//!
//! A membership change signals the set's notification. `wait()` registers
//! interest in that notification *before* scanning the tracked tasks and
//! re-arms whenever it fires, so an add/remove that lands between the scan
//! and the suspension wakes the waiter instead of being lost.
//!
//! ## Rules
//! - Individual task failures are never raised to `wait()` callers; they
//!   come back as finished (possibly-failed) outcomes.
//! - Finished tasks are removed from the set before being returned.
//! - Each completion is delivered to exactly one waiter.
//! - `wait()` returns an empty batch only when the set is empty at scan
//!   time (empty at entry, or emptied by removals while waiting).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tokio::time;
use tracing::{error, warn};

use crate::error::TaskError;

use super::hold;

/// Identifies one task tracked by a [`TaskSet`].
///
/// Cheap to clone; carries a stable name for diagnostics plus an internal
/// id. Equality is by id, so two handles compare equal only when they refer
/// to the same tracked task.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    id: u64,
    name: Arc<str>,
}

impl TaskHandle {
    /// Returns the stable, human-readable task name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskHandle {}

/// A task that finished while tracked, with its outcome.
#[derive(Debug)]
pub struct FinishedTask {
    /// Handle of the finished task.
    pub handle: TaskHandle,
    /// How the task ended. Panics and aborts surface as [`TaskError`]s.
    pub outcome: Result<(), TaskError>,
}

struct Tracked {
    handle: TaskHandle,
    join: JoinHandle<Result<(), TaskError>>,
}

/// Tracks a mutable set of running tasks.
///
/// See the module docs for the wait/membership contract.
pub struct TaskSet {
    tracked: Mutex<HashMap<u64, Tracked>>,
    changed: Notify,
    next_id: AtomicU64,
}

impl TaskSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            tracked: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Spawns `future` on the runtime and tracks it.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> TaskHandle
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.add(name, tokio::spawn(future))
    }

    /// Adopts an already-running task.
    pub fn add(&self, name: impl Into<String>, join: JoinHandle<Result<(), TaskError>>) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle {
            id,
            name: Arc::from(name.into()),
        };
        hold(&self.tracked).insert(
            id,
            Tracked {
                handle: handle.clone(),
                join,
            },
        );
        self.changed.notify_waiters();
        handle
    }

    /// Untracks a task and hands its join handle back to the caller.
    ///
    /// The task keeps running; callers that want it stopped abort the
    /// returned handle. Returns `None` when the task is no longer tracked
    /// (it finished, or was removed already).
    pub fn remove(&self, handle: &TaskHandle) -> Option<JoinHandle<Result<(), TaskError>>> {
        let removed = hold(&self.tracked).remove(&handle.id);
        if removed.is_some() {
            self.changed.notify_waiters();
        }
        removed.map(|t| t.join)
    }

    /// Returns `true` when no tasks are tracked.
    pub fn is_empty(&self) -> bool {
        hold(&self.tracked).is_empty()
    }

    /// Returns the number of tracked tasks.
    pub fn len(&self) -> usize {
        hold(&self.tracked).len()
    }

    /// Read-only snapshot of tracked task names, for diagnostics.
    pub fn all_names(&self) -> Vec<String> {
        hold(&self.tracked)
            .values()
            .map(|t| t.handle.name().to_string())
            .collect()
    }

    /// Suspends until at least one tracked task finishes.
    ///
    /// Finished tasks are removed from the set and returned with their
    /// outcomes. Membership changes concurrent with the wait are observed:
    /// a newly added task can satisfy the wait, and a wait whose set is
    /// emptied by removals returns an empty batch.
    pub async fn wait(&self) -> Vec<FinishedTask> {
        let mut notified = Box::pin(self.changed.notified());
        notified.as_mut().enable();

        futures::future::poll_fn(|cx| loop {
            // Drain membership wakeups and re-arm before each scan, so a
            // change landing after the scan still wakes this poll.
            if notified.as_mut().poll(cx).is_ready() {
                notified.set(self.changed.notified());
                notified.as_mut().enable();
                continue;
            }

            let mut tracked = hold(&self.tracked);
            if tracked.is_empty() {
                return Poll::Ready(Vec::new());
            }

            let mut finished = Vec::new();
            tracked.retain(|_, t| match Pin::new(&mut t.join).poll(cx) {
                Poll::Ready(res) => {
                    finished.push(FinishedTask {
                        handle: t.handle.clone(),
                        outcome: flatten_join(res),
                    });
                    false
                }
                Poll::Pending => true,
            });

            if finished.is_empty() {
                return Poll::Pending;
            }
            return Poll::Ready(finished);
        })
        .await
    }

    /// Suspends until the set is non-empty.
    pub async fn wait_non_empty(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Shuts the set down.
    ///
    /// Waits up to `grace` for tracked tasks to finish voluntarily, then
    /// aborts the stragglers and collects every final outcome. Tasks that
    /// failed or were cut short are logged, never raised. Idempotent.
    pub async fn close(&self, grace: Duration) {
        let drained: Vec<Tracked> = {
            let mut tracked = hold(&self.tracked);
            tracked.drain().map(|(_, t)| t).collect()
        };
        self.changed.notify_waiters();
        if drained.is_empty() {
            return;
        }

        let aborts: Vec<_> = drained.iter().map(|t| t.join.abort_handle()).collect();
        let mut outcomes: FuturesUnordered<_> = drained
            .into_iter()
            .map(|t| async move { (t.handle, flatten_join(t.join.await)) })
            .collect();

        let deadline = time::Instant::now() + grace;
        let mut collected = Vec::new();
        loop {
            match time::timeout_at(deadline, outcomes.next()).await {
                Ok(Some(done)) => collected.push(done),
                Ok(None) => break,
                Err(_) => {
                    for abort in &aborts {
                        abort.abort();
                    }
                    break;
                }
            }
        }
        while let Some(done) = outcomes.next().await {
            collected.push(done);
        }

        for (handle, outcome) in collected {
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_cancellation() => {
                    warn!(task = handle.name(), "task did not stop in time; aborted");
                }
                Err(err) => {
                    error!(
                        task = handle.name(),
                        label = err.as_label(),
                        error = %err,
                        "task failed during close",
                    );
                }
            }
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapses a join result into the task outcome.
pub(crate) fn flatten_join(res: Result<Result<(), TaskError>, JoinError>) -> Result<(), TaskError> {
    match res {
        Ok(outcome) => outcome,
        Err(join) if join.is_cancelled() => Err(TaskError::Canceled),
        Err(join) => Err(TaskError::Panicked {
            error: join.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_finished_task() {
        let set = TaskSet::new();
        set.spawn("one", async { Ok(()) });

        let finished = set.wait().await;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].handle.name(), "one");
        assert!(finished[0].outcome.is_ok());
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_wait_on_empty_set_returns_empty() {
        let set = TaskSet::new();
        assert!(set.wait().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_observes_concurrent_spawn() {
        let set = Arc::new(TaskSet::new());
        set.spawn("long", async {
            std::future::pending::<()>().await;
            Ok(())
        });

        let waiter = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.wait().await })
        };
        // Let the waiter register and start waiting on "long".
        time::sleep(Duration::from_millis(1)).await;

        set.spawn("late", async { Ok(()) });
        let finished = waiter.await.unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].handle.name(), "late");

        set.close(Duration::ZERO).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_task_is_not_reported() {
        let set = Arc::new(TaskSet::new());
        let handle = set.spawn("gone", async {
            time::sleep(Duration::from_millis(5)).await;
            Ok(())
        });

        let join = set.remove(&handle).expect("still tracked");
        assert!(set.is_empty());
        assert!(set.remove(&handle).is_none());

        // The removed task still runs to completion on its own.
        assert!(join.await.unwrap().is_ok());
        assert!(set.wait().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_completion_is_reported_once() {
        let set = TaskSet::new();
        for i in 0..3u64 {
            let delay = Duration::from_millis(10 * (i + 1));
            set.spawn(format!("t{i}"), async move {
                time::sleep(delay).await;
                Ok(())
            });
        }

        let mut names = Vec::new();
        while !set.is_empty() {
            for finished in set.wait().await {
                names.push(finished.handle.name().to_string());
            }
        }
        names.sort();
        assert_eq!(names, ["t0", "t1", "t2"]);
    }

    #[tokio::test]
    async fn test_panic_surfaces_as_outcome() {
        let set = TaskSet::new();
        set.spawn("boom", async {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });

        let finished = set.wait().await;
        assert_eq!(finished.len(), 1);
        assert!(matches!(
            finished[0].outcome,
            Err(TaskError::Panicked { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_aborts_stragglers_after_grace() {
        let set = TaskSet::new();
        set.spawn("stuck", async {
            std::future::pending::<()>().await;
            Ok(())
        });

        let started = time::Instant::now();
        set.close(Duration::from_secs(1)).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(set.is_empty());

        // Second close on the emptied set returns immediately.
        set.close(Duration::from_secs(1)).await;
    }
}

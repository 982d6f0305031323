//! # Fair multiplexing of queue fetches.
//!
//! [`Scheduler`] runs one fetch task per registered queue inside a
//! [`TaskSet`] and hands fetched messages to the single dispatch loop.
//! A queue whose fetch yielded a message is re-armed immediately, so slow
//! queues never starve fast ones and an idle queue costs nothing.
//!
//! ```text
//!   add(queue) ──▶ fetch task ──▶ buffer ──▶ next() ──▶ dispatch
//!                     ▲                        │
//!                     └──────── re-arm ────────┘
//! ```
//!
//! A fetch that returns `None` retires its queue: the queue is closed and
//! unregistered. `next` returns `None` only after `close`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pipeline::ExecutableMessage;
use crate::queue::ExecutableQueue;
use crate::sync::{hold, TaskHandle, TaskSet};

/// Multiplexes fetches across registered queues.
pub struct Scheduler {
    inner: Arc<SchedInner>,
    grace: Duration,
}

struct SchedInner {
    slots: Mutex<HashMap<String, Slot>>,
    fetched: Mutex<VecDeque<(String, Option<ExecutableMessage>)>>,
    tasks: TaskSet,
    closing: CancellationToken,
}

struct Slot {
    queue: Arc<ExecutableQueue>,
    fetch: TaskHandle,
}

impl Scheduler {
    /// Creates an empty scheduler whose close allows fetches `grace` to
    /// wind down.
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(SchedInner {
                slots: Mutex::new(HashMap::new()),
                fetched: Mutex::new(VecDeque::new()),
                tasks: TaskSet::new(),
                closing: CancellationToken::new(),
            }),
            grace,
        }
    }

    /// Registers `queue` and starts fetching from it.
    ///
    /// A queue under an already-registered name is ignored.
    pub fn add(&self, queue: ExecutableQueue) {
        if self.inner.closing.is_cancelled() {
            warn!(queue = queue.name(), "scheduler closing; queue ignored");
            return;
        }
        let name = queue.name().to_string();
        let queue = Arc::new(queue);
        let mut slots = hold(&self.inner.slots);
        if slots.contains_key(&name) {
            warn!(queue = %name, "queue already scheduled; ignored");
            return;
        }
        let fetch = spawn_fetch(&self.inner, &queue);
        slots.insert(name, Slot { queue, fetch });
    }

    /// Unregisters the queue named `name` and closes it.
    ///
    /// A message already fetched from the queue is still delivered.
    pub async fn remove(&self, name: &str) {
        let Some(slot) = hold(&self.inner.slots).remove(name) else {
            return;
        };
        if let Some(join) = self.inner.tasks.remove(&slot.fetch) {
            join.abort();
        }
        slot.queue.close().await;
    }

    /// Names of registered queues, for diagnostics.
    pub fn queue_names(&self) -> Vec<String> {
        hold(&self.inner.slots).keys().cloned().collect()
    }

    /// Returns the next fetched message.
    ///
    /// Suspends while every registered queue is idle, and keeps waiting
    /// through queue churn. Returns `None` only once the scheduler is
    /// closed.
    pub async fn next(&self) -> Option<ExecutableMessage> {
        loop {
            let entry = hold(&self.inner.fetched).pop_front();
            if let Some((name, fetched)) = entry {
                match fetched {
                    Some(message) => {
                        self.rearm(&name);
                        return Some(message);
                    }
                    None => {
                        self.retire(&name).await;
                        continue;
                    }
                }
            }

            if self.inner.tasks.is_empty() {
                if self.inner.closing.is_cancelled() {
                    return None;
                }
                tokio::select! {
                    _ = self.inner.closing.cancelled() => return None,
                    _ = self.inner.tasks.wait_non_empty() => {}
                }
                continue;
            }
            // Fetch results land in the buffer before the task finishes,
            // so one drained wait means the next loop pass pops something.
            self.inner.tasks.wait().await;
        }
    }

    fn rearm(&self, name: &str) {
        let mut slots = hold(&self.inner.slots);
        if let Some(slot) = slots.get_mut(name) {
            slot.fetch = spawn_fetch(&self.inner, &slot.queue);
        }
    }

    async fn retire(&self, name: &str) {
        let removed = hold(&self.inner.slots).remove(name);
        if let Some(slot) = removed {
            debug!(queue = %name, "queue exhausted; retired");
            slot.queue.close().await;
        }
    }

    /// Closes every queue and stops fetching. Idempotent.
    pub async fn close(&self) {
        self.inner.closing.cancel();
        let slots: Vec<Slot> = {
            let mut slots = hold(&self.inner.slots);
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            slot.queue.close().await;
        }
        self.inner.tasks.close(self.grace).await;
    }
}

fn spawn_fetch(inner: &Arc<SchedInner>, queue: &Arc<ExecutableQueue>) -> TaskHandle {
    let name = queue.name().to_string();
    let inner_for_task = Arc::clone(inner);
    let queue = Arc::clone(queue);
    inner.tasks.spawn(format!("fetch:{name}"), async move {
        let fetched = queue.next().await;
        hold(&inner_for_task.fetched).push_back((name, fetched));
        Ok(())
    })
}

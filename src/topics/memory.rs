//! # In-process topics over bounded channels.
//!
//! [`MemoryRegistry`] hands out [`MemoryTopic`]s backed by named bounded
//! mpsc queues. Topics sharing a name share the queue, so one side of a
//! test or an embedded deployment can publish what another consumes
//! without a broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::TopicError;
use crate::message::{TopicDelivery, TopicMessage};
use crate::sync::hold;

use super::Topic;

/// Registry of named in-process queues.
///
/// Cheap to clone; clones share the queue namespace.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    queues: Arc<Mutex<HashMap<String, MemoryQueue>>>,
}

#[derive(Clone)]
struct MemoryQueue {
    tx: mpsc::Sender<TopicMessage>,
    rx: Arc<AsyncMutex<mpsc::Receiver<TopicMessage>>>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a topic on the queue named `name`, creating the queue with
    /// `capacity` slots if it does not exist yet.
    pub fn topic(&self, name: &str, capacity: usize) -> Arc<MemoryTopic> {
        let queue = {
            let mut queues = hold(&self.queues);
            queues
                .entry(name.to_string())
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(capacity);
                    MemoryQueue {
                        tx,
                        rx: Arc::new(AsyncMutex::new(rx)),
                    }
                })
                .clone()
        };
        Arc::new(MemoryTopic {
            name: name.to_string(),
            tx: queue.tx,
            rx: queue.rx,
            closed: CancellationToken::new(),
        })
    }

    /// Drops every queue. Topics already built keep their handles.
    pub fn reset(&self) {
        hold(&self.queues).clear();
    }

    /// Suspends until every queue is empty.
    ///
    /// Emptiness is observed through sender capacity, so a message held by
    /// an in-flight `next` still counts as drained.
    pub async fn join_all(&self) {
        loop {
            let drained = {
                let queues = hold(&self.queues);
                queues
                    .values()
                    .all(|q| q.tx.capacity() == q.tx.max_capacity())
            };
            if drained {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A topic over one named in-process queue.
pub struct MemoryTopic {
    name: String,
    tx: mpsc::Sender<TopicMessage>,
    rx: Arc<AsyncMutex<mpsc::Receiver<TopicMessage>>>,
    closed: CancellationToken,
}

#[async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&self) -> Option<TopicDelivery> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            received = async {
                let mut rx = self.rx.lock().await;
                rx.recv().await
            } => received.map(TopicDelivery::new),
        }
    }

    async fn publish(&self, message: TopicMessage, wait: bool) -> Result<bool, TopicError> {
        if self.closed.is_cancelled() {
            return Err(TopicError::Closed);
        }
        if wait {
            self.tx
                .send(message)
                .await
                .map_err(|_| TopicError::Closed)?;
            return Ok(true);
        }
        match self.tx.try_send(message) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TopicError::Closed),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

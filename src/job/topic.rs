//! The job topic: an inventory exposed as a consume-only message source.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::TopicError;
use crate::message::{TopicDelivery, TopicMessage};
use crate::sync::DelayedThrottle;
use crate::topics::Topic;

use super::{Cursor, Inventory, JobStore};

/// Consume-only topic yielding one inventory item per `next`.
///
/// ## Cursor handling
/// - The stored cursor is loaded lazily on the first `next`.
/// - Each yielded item moves the cursor; saves are throttled, so a burst
///   of yields becomes one store write with the latest position.
/// - Exhaustion and `close` flush the pending save.
///
/// ## Failure handling
/// Store and inventory failures end the job: the error is logged and
/// every later `next` returns `None`. Publishing is not supported.
pub struct JobTopic {
    name: String,
    inventory: Arc<dyn Inventory>,
    store: Arc<dyn JobStore>,
    saves: DelayedThrottle<Cursor>,
    state: Mutex<JobState>,
}

struct JobState {
    started: bool,
    cursor: Option<Cursor>,
    buffer: VecDeque<super::InventoryItem>,
    done: bool,
}

impl JobTopic {
    /// Creates a job named `name` over `inventory`, persisting progress
    /// through `store` at most once per `save_delay`.
    pub fn new(
        name: impl Into<String>,
        inventory: Arc<dyn Inventory>,
        store: Arc<dyn JobStore>,
        save_delay: Duration,
    ) -> Self {
        let name = name.into();
        let saves = {
            let store = Arc::clone(&store);
            let job = name.clone();
            DelayedThrottle::new(save_delay, move |cursor: Cursor| {
                let store = Arc::clone(&store);
                let job = job.clone();
                async move {
                    if let Err(err) = store.save_cursor(cursor).await {
                        error!(job = %job, error = %err, "cursor save failed");
                    }
                }
            })
        };
        Self {
            name,
            inventory,
            store,
            saves,
            state: Mutex::new(JobState {
                started: false,
                cursor: None,
                buffer: VecDeque::new(),
                done: false,
            }),
        }
    }

    async fn finish(&self, state: &mut JobState) {
        state.done = true;
        self.saves.flush().await;
        if let Err(err) = self.store.flush().await {
            error!(job = %self.name, error = %err, "cursor flush failed");
        }
    }
}

#[async_trait]
impl Topic for JobTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&self) -> Option<TopicDelivery> {
        let mut state = self.state.lock().await;
        if state.done {
            return None;
        }

        if !state.started {
            state.started = true;
            match self.store.load_cursor().await {
                Ok(cursor) => state.cursor = cursor,
                Err(err) => {
                    error!(job = %self.name, error = %err, "cursor load failed; job stopped");
                    state.done = true;
                    return None;
                }
            }
        }

        if state.buffer.is_empty() {
            match self.inventory.next_batch(state.cursor.clone()).await {
                Ok(batch) if batch.is_empty() => {
                    info!(job = %self.name, "inventory exhausted");
                    self.finish(&mut state).await;
                    return None;
                }
                Ok(batch) => state.buffer.extend(batch),
                Err(err) => {
                    error!(job = %self.name, error = %err, "inventory fetch failed; job stopped");
                    self.finish(&mut state).await;
                    return None;
                }
            }
        }

        let item = state.buffer.pop_front()?;
        state.cursor = Some(item.cursor.clone());
        drop(state);

        self.saves.call(item.cursor.clone()).await;

        let mut message = TopicMessage::new(item.args)
            .with_metadata("job", json!(self.name))
            .with_metadata("cursor", json!(item.cursor));
        message.id = item.id;
        Some(TopicDelivery::new(message))
    }

    async fn publish(&self, _message: TopicMessage, _wait: bool) -> Result<bool, TopicError> {
        Err(TopicError::PublishUnsupported)
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        if !state.done {
            self.finish(&mut state).await;
        }
    }
}

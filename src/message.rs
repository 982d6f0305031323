//! # Messages and deliveries.
//!
//! [`TopicMessage`] is the unit of work flowing through topics: a JSON
//! argument map plus routing tags and free-form metadata. [`TopicDelivery`]
//! pairs a received message with its acknowledgement, so processing can
//! settle the broker delivery exactly once.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

type SettleFn = Box<dyn FnOnce(bool) -> BoxFuture<'static, ()> + Send>;

/// A unit of work carried by a topic.
///
/// `args` feed the pipeline, `tags` select output routes, `metadata` is
/// carried verbatim for bookkeeping (job cursors, trace ids).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopicMessage {
    /// Unique message id; generated when not supplied by the producer.
    #[serde(default = "new_message_id")]
    pub id: String,

    /// Arguments handed to the pipeline, merged over the queue defaults.
    pub args: Map<String, Value>,

    /// Routing tags: processing outputs are published to the channels
    /// named here.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Free-form metadata carried alongside the message.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl TopicMessage {
    /// Creates a message with a fresh id and the given arguments.
    pub fn new(args: Map<String, Value>) -> Self {
        Self {
            id: new_message_id(),
            args,
            tags: BTreeMap::new(),
            metadata: Map::new(),
        }
    }

    /// Attaches metadata, replacing any existing value under `key`.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A message received from a topic, with its pending acknowledgement.
///
/// The settle callback runs exactly once: explicitly through
/// [`settle`](Self::settle), or as a negative settle on drop when the
/// consumer forgot. Topics without broker-side acknowledgement produce
/// deliveries with no callback.
pub struct TopicDelivery {
    /// The received message.
    pub message: TopicMessage,
    settle: Option<SettleFn>,
}

impl TopicDelivery {
    /// Wraps a message that needs no acknowledgement.
    pub fn new(message: TopicMessage) -> Self {
        Self {
            message,
            settle: None,
        }
    }

    /// Wraps a message whose acknowledgement runs `settle(success)`.
    pub fn with_ack<F>(message: TopicMessage, settle: F) -> Self
    where
        F: FnOnce(bool) -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            message,
            settle: Some(Box::new(settle)),
        }
    }

    /// Acknowledges the delivery: `true` confirms, `false` rejects.
    pub async fn settle(mut self, success: bool) {
        if let Some(settle) = self.settle.take() {
            settle(success).await;
        }
    }
}

impl Drop for TopicDelivery {
    fn drop(&mut self) {
        let Some(settle) = self.settle.take() else {
            return;
        };
        warn!(message = %self.message.id, "delivery dropped unsettled; rejecting");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(settle(false));
        }
    }
}

impl std::fmt::Debug for TopicDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicDelivery")
            .field("message", &self.message)
            .field("settled", &self.settle.is_none())
            .finish()
    }
}

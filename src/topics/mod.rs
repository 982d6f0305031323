//! # Topic abstraction and factory.
//!
//! A [`Topic`] is a named, async message source and sink. The engine only
//! ever talks to this trait; concrete kinds (broker queues, in-memory
//! channels, job feeds) are registered in a [`TopicFactory`] and built
//! from declarative [`TopicOptions`] delivered by the work source.

mod memory;
mod remote;

pub use memory::{MemoryRegistry, MemoryTopic};
pub use remote::{
    BackoffSchedule, Channel, Connector, Delivery, MemoryConnector, PublishOutcome, RemoteTopic,
    RemoteTopicOptions,
};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::TopicError;
use crate::message::{TopicDelivery, TopicMessage};

/// A named message source and sink.
///
/// ## Contract
/// - `next` suspends until a delivery is available and returns `None`
///   only when the topic is closed or exhausted.
/// - `publish` with `wait = true` suspends until the message is accepted;
///   with `wait = false` it returns `Ok(false)` instead of waiting.
/// - `close` stops the topic; pending and future `next` calls return
///   `None`, publishes fail with [`TopicError::Closed`].
#[async_trait]
pub trait Topic: Send + Sync + 'static {
    /// The topic's name, unique within its registry.
    fn name(&self) -> &str;

    /// Receives the next delivery, or `None` when closed or exhausted.
    async fn next(&self) -> Option<TopicDelivery>;

    /// Publishes a message. Returns `Ok(true)` when accepted, `Ok(false)`
    /// when declined without waiting (`wait = false` and the topic is
    /// full or busy).
    async fn publish(&self, message: TopicMessage, wait: bool) -> Result<bool, TopicError>;

    /// Closes the topic.
    async fn close(&self);
}

/// Declarative description of a topic to build.
#[derive(Clone, Debug, Deserialize)]
pub struct TopicOptions {
    /// Name for the built topic.
    pub name: String,

    /// Kind-specific options, interpreted by the registered builder.
    #[serde(default)]
    pub options: serde_json::Value,
}

type TopicBuilder = Box<dyn Fn(TopicOptions) -> Result<Arc<dyn Topic>, TopicError> + Send + Sync>;

/// Registry of topic kinds.
///
/// The work source names topics by kind; the factory maps each kind to a
/// builder closure. Builders own their transport handles (connectors,
/// registries, stores) through capture.
#[derive(Default)]
pub struct TopicFactory {
    builders: HashMap<String, TopicBuilder>,
}

impl TopicFactory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `build` for topics of `kind`, replacing any previous
    /// builder under that kind.
    pub fn register<F>(&mut self, kind: impl Into<String>, build: F)
    where
        F: Fn(TopicOptions) -> Result<Arc<dyn Topic>, TopicError> + Send + Sync + 'static,
    {
        self.builders.insert(kind.into(), Box::new(build));
    }

    /// Builds a topic of `kind` from `options`.
    pub fn build(&self, kind: &str, options: TopicOptions) -> Result<Arc<dyn Topic>, TopicError> {
        let builder = self.builders.get(kind).ok_or_else(|| TopicError::UnknownKind {
            kind: kind.to_string(),
        })?;
        builder(options)
    }

    /// Registered kinds, for diagnostics.
    pub fn kinds(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_is_an_error() {
        let factory = TopicFactory::new();
        let options = TopicOptions {
            name: "q".into(),
            options: serde_json::Value::Null,
        };
        assert!(matches!(
            factory.build("nope", options),
            Err(TopicError::UnknownKind { kind }) if kind == "nope"
        ));
    }

    #[test]
    fn test_builder_rejects_invalid_options() {
        let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new(16));
        let mut factory = TopicFactory::new();
        factory.register("remote", move |opts| {
            let parsed: RemoteTopicOptions = serde_json::from_value(opts.options)
                .map_err(|err| TopicError::InvalidOptions {
                    error: err.to_string(),
                })?;
            Ok(Arc::new(RemoteTopic::new(opts.name, Arc::clone(&connector), parsed))
                as Arc<dyn Topic>)
        });

        let bad = TopicOptions {
            name: "q".into(),
            options: serde_json::json!({ "queue": 42 }),
        };
        assert!(matches!(
            factory.build("remote", bad),
            Err(TopicError::InvalidOptions { .. })
        ));

        let good = TopicOptions {
            name: "q".into(),
            options: serde_json::json!({ "queue": "q" }),
        };
        assert!(factory.build("remote", good).is_ok());
    }

    #[test]
    fn test_registered_builder_receives_options() {
        let registry = MemoryRegistry::new();
        let mut factory = TopicFactory::new();
        factory.register("memory", move |opts| Ok(registry.topic(&opts.name, 16)));

        let topic = factory
            .build(
                "memory",
                TopicOptions {
                    name: "jobs".into(),
                    options: serde_json::Value::Null,
                },
            )
            .unwrap();
        assert_eq!(topic.name(), "jobs");
    }
}

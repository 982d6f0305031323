//! # Work sources: declarative descriptions of what to run.
//!
//! A [`WorkSource`] tells the broker which queues, background tasks, and
//! resources should exist. Each [`WorkSync`] is a diff against the
//! broker's current state; the broker reconciles by applying additions
//! before removals, so a same-sync replace never leaves a gap.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{TaskError, WorkSourceError};
use crate::pipeline::QueuePipeline;
use crate::resources::Resource;
use crate::sync::hold;

/// Additions and removals for one kind of managed object.
pub struct SyncDiff<T> {
    /// Objects to create.
    pub add: Vec<T>,
    /// Names of objects to drop.
    pub drop: Vec<String>,
}

impl<T> Default for SyncDiff<T> {
    fn default() -> Self {
        Self {
            add: Vec::new(),
            drop: Vec::new(),
        }
    }
}

impl<T> SyncDiff<T> {
    /// `true` when the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.drop.is_empty()
    }
}

/// Declarative reference to a topic: a registered kind plus its options.
#[derive(Clone, Debug, Deserialize)]
pub struct TopicSpec {
    /// Topic kind, resolved through the topic factory.
    pub kind: String,

    /// Topic name.
    pub name: String,

    /// Kind-specific options.
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Declarative description of a queue.
#[derive(Clone, Debug)]
pub struct QueueDefinition {
    /// Queue name.
    pub name: String,

    /// Input topic to consume.
    pub input: TopicSpec,

    /// Pipeline to run per message.
    pub pipeline: QueuePipeline,

    /// Output routes: channel name to topics.
    pub output: HashMap<String, Vec<TopicSpec>>,
}

type TaskFactory = Box<dyn Fn() -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// Declarative description of a background task.
pub struct TaskDefinition {
    /// Task name.
    pub name: String,

    /// Produces the task future; called once when the task is added.
    pub make: TaskFactory,
}

impl TaskDefinition {
    /// Describes a task named `name` built by `make`.
    pub fn new<F, Fut>(name: impl Into<String>, make: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        use futures::FutureExt;
        Self {
            name: name.into(),
            make: Box::new(move || make().boxed()),
        }
    }
}

/// One reconciliation step from the work source.
#[derive(Default)]
pub struct WorkSync {
    /// Queue changes.
    pub queues: SyncDiff<QueueDefinition>,
    /// Background task changes.
    pub tasks: SyncDiff<TaskDefinition>,
    /// Resource changes; drops name `type/name` pairs.
    pub resources: SyncDiff<Resource>,
}

impl WorkSync {
    /// `true` when the sync changes nothing.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty() && self.tasks.is_empty() && self.resources.is_empty()
    }
}

/// Supplies the broker with work to reconcile.
///
/// `sync` may block until changes are available; the broker additionally
/// paces calls with its sync interval.
#[async_trait]
pub trait WorkSource: Send + Sync + 'static {
    /// Produces the next diff. An empty diff means nothing changed.
    async fn sync(&self) -> Result<WorkSync, WorkSourceError>;

    /// Releases work-source resources. Default: nothing to release.
    async fn close(&self) {}
}

/// Work source handing out one fixed sync, then empty diffs.
///
/// For embedded deployments whose workload is known at startup.
pub struct StaticWorkSource {
    initial: Mutex<Option<WorkSync>>,
}

impl StaticWorkSource {
    /// Serves `work` on the first sync.
    pub fn new(work: WorkSync) -> Self {
        Self {
            initial: Mutex::new(Some(work)),
        }
    }
}

#[async_trait]
impl WorkSource for StaticWorkSource {
    async fn sync(&self) -> Result<WorkSync, WorkSourceError> {
        Ok(hold(&self.initial).take().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_serves_work_once() {
        let mut work = WorkSync::default();
        work.resources.add.push(Resource {
            name: "gpu0".into(),
            type_name: "gpu".into(),
            data: serde_json::Value::Null,
        });
        let source = StaticWorkSource::new(work);

        let first = source.sync().await.unwrap();
        assert_eq!(first.resources.add.len(), 1);

        let second = source.sync().await.unwrap();
        assert!(second.is_empty());
    }
}

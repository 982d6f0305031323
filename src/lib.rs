//! # conveyor
//!
//! **Conveyor** is a worker-side job-processing engine for Rust.
//!
//! It consumes messages from pluggable topics, runs pipelines over them
//! within concurrency and resource limits, and keeps its set of queues,
//! background tasks, and resources reconciled against a declarative work
//! source. The crate is designed as a building block for media and data
//! processing workers.
//!
//! ## Architecture
//! ```text
//!                       ┌─────────────────┐
//!                       │   WorkSource    │  (declarative syncs)
//!                       └────────┬────────┘
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Broker (reconciler + dispatch loop)                         │
//! │  - TopicFactory (builds topics from registered kinds)        │
//! │  - TaskSupervisor (long-lived background tasks)              │
//! │  - ResourcesManager (leasable named resources)               │
//! └───────┬────────────────────────────────────────────┬─────────┘
//!         ▼                                            ▼
//! ┌─────────────────┐                         ┌─────────────────┐
//! │   Scheduler     │                         │ ExecutorManager │
//! │ one fetch task  │ ──ExecutableMessage──▶  │ cap + leases,   │
//! │ per queue       │                         │ runs pipelines  │
//! └───────┬─────────┘                         └────────┬────────┘
//!         ▼                                            ▼
//! ┌─────────────────┐                         ┌─────────────────┐
//! │ ExecutableQueue │                         │    Executor     │
//! │ topic+pipeline  │                         │ (user pipeline) │
//! │ +routes+parker  │                         └────────┬────────┘
//! └───────┬─────────┘                                  │ outputs
//!         ▼                                            ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Topics: RemoteTopic (broker queue, reconnect + retry),      │
//! │          MemoryTopic (in-process), JobTopic (inventory walk) │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Message lifecycle
//! ```text
//! topic.next() ──▶ TopicDelivery ──▶ merge queue args ──▶ scheduler
//!    │                                                      │
//!    │              ┌── park queue while cap/resources short
//!    │              ▼
//!    │        executor.process(PipelineMessage)
//!    │              │
//!    │              ├─ Ok(outputs) ──▶ publish via routes ──▶ ack
//!    │              └─ Err          ──▶ log               ──▶ nack
//!    └── deliveries settle exactly once (drop rejects)
//! ```
//!
//! ## Features
//! | Area            | Description                                             | Key types / traits                         |
//! |-----------------|---------------------------------------------------------|--------------------------------------------|
//! | **Topics**      | Pluggable message sources/sinks, built by kind.         | [`Topic`], [`TopicFactory`], [`RemoteTopic`] |
//! | **Jobs**        | Inventory walks with persisted resume cursors.          | [`JobTopic`], [`Inventory`], [`JobStore`]  |
//! | **Scheduling**  | Fair fetch multiplexing with queue flow control.        | [`Scheduler`], [`ExecutableQueue`], [`Parker`] |
//! | **Execution**   | Capped pipeline runs with resource leases.              | [`Executor`], [`ExecutorManager`], [`ResourcesManager`] |
//! | **Supervision** | Background task tracking and graceful shutdown.         | [`TaskSupervisor`], [`TaskSet`]            |
//! | **Reconciling** | Declarative workload applied add-first, drop-second.    | [`Broker`], [`WorkSource`], [`WorkSync`]   |
//! | **Errors**      | One enum per failure domain.                            | [`BrokerError`], [`TopicError`], [`TaskError`] |
//!
//! ## Example
//! ```rust
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use conveyor::{
//!     BrokerBuilder, InProcessExecutor, MemoryRegistry, PipelineInfo, PipelineMessage,
//!     PipelineOutput, QueueDefinition, QueuePipeline, StaticWorkSource, SyncDiff,
//!     TopicFactory, TopicMessage, TopicSpec, WorkSync,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // In-process topics; real deployments register broker-backed kinds.
//!     let registry = MemoryRegistry::new();
//!     let mut factory = TopicFactory::new();
//!     {
//!         let registry = registry.clone();
//!         factory.register("memory", move |opts| Ok(registry.topic(&opts.name, 16)));
//!     }
//!
//!     // One queue: consume "in", run "echo", route outputs to "done".
//!     let mut output = HashMap::new();
//!     output.insert(
//!         "done".to_string(),
//!         vec![TopicSpec { kind: "memory".into(), name: "done".into(), options: serde_json::Value::Null }],
//!     );
//!     let work = WorkSync {
//!         queues: SyncDiff {
//!             add: vec![QueueDefinition {
//!                 name: "work".into(),
//!                 input: TopicSpec { kind: "memory".into(), name: "in".into(), options: serde_json::Value::Null },
//!                 pipeline: QueuePipeline {
//!                     info: PipelineInfo { name: "echo".into(), resources: Default::default() },
//!                     args: Default::default(),
//!                 },
//!                 output,
//!             }],
//!             drop: Vec::new(),
//!         },
//!         ..WorkSync::default()
//!     };
//!
//!     let broker = Arc::new(
//!         BrokerBuilder::new()
//!             .with_work_source(Arc::new(StaticWorkSource::new(work)))
//!             .with_executor(Arc::new(InProcessExecutor::new(
//!                 |message: PipelineMessage| async move {
//!                     Ok(vec![PipelineOutput { channel: "done".into(), message: message.message }])
//!                 },
//!             )))
//!             .with_topic_factory(factory)
//!             .build()?,
//!     );
//!
//!     let running = {
//!         let broker = Arc::clone(&broker);
//!         tokio::spawn(async move { broker.run().await })
//!     };
//!
//!     registry.topic("in", 16).publish(TopicMessage::new(Default::default()), true).await?;
//!     let delivery = registry.topic("done", 16).next().await.expect("one output");
//!     delivery.settle(true).await;
//!
//!     broker.stop();
//!     running.await??;
//!     Ok(())
//! }
//! ```

mod broker;
mod config;
mod error;
mod executor;
mod job;
mod message;
mod pipeline;
mod queue;
mod resources;
mod scheduler;
mod supervisor;
mod sync;
mod topics;
mod work;

// ---- Public re-exports ----

pub use broker::{Broker, BrokerBuilder};
pub use config::Config as BrokerConfig;
pub use error::{
    BrokerError, ExecutorError, JobError, TaskError, TopicError, TransportError, WorkSourceError,
};
pub use executor::{Executor, ExecutorManager, InProcessExecutor};
pub use job::{Cursor, Inventory, InventoryItem, JobStore, JobTopic, MemoryJobStore, RangeInventory};
pub use message::{TopicDelivery, TopicMessage};
pub use pipeline::{ExecutableMessage, PipelineInfo, PipelineMessage, PipelineOutput, QueuePipeline};
pub use queue::ExecutableQueue;
pub use resources::{Resource, ResourceLease, ResourcesManager};
pub use scheduler::Scheduler;
pub use supervisor::TaskSupervisor;
pub use sync::{
    DelayedThrottle, FinishedTask, Memoized, Parker, ReservationLock, ReservationToken, TaskHandle,
    TaskSet,
};
pub use topics::{
    BackoffSchedule, Channel, Connector, Delivery, MemoryConnector, MemoryRegistry, MemoryTopic,
    PublishOutcome, RemoteTopic, RemoteTopicOptions, Topic, TopicFactory, TopicOptions,
};
pub use work::{
    QueueDefinition, StaticWorkSource, SyncDiff, TaskDefinition, TopicSpec, WorkSource, WorkSync,
};

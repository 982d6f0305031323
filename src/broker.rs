//! # The broker: reconciliation and dispatch.
//!
//! [`Broker`] ties the engine together. It periodically pulls a
//! [`WorkSync`] from the work source and reconciles queues, background
//! tasks, and resources against it, while a dispatch loop moves fetched
//! messages from the scheduler into the executor.
//!
//! ```text
//!   WorkSource ──sync──▶ reconcile ──▶ Scheduler ──▶ dispatch ──▶ Executor
//!                            │              ▲
//!                            ├─ tasks ──▶ TaskSupervisor
//!                            └─ resources ▶ ResourcesManager
//! ```
//!
//! ## Reconciliation order
//!
//! Within one sync, additions are applied before removals (queues, then
//! tasks, then resources). A sync that replaces an object under the same
//! name therefore never leaves a window where nothing serves it.
//!
//! ## Lifecycle
//!
//! `run` drives everything and returns on [`stop`](Broker::stop) or on a
//! fatal sync failure; either way every component is closed before it
//! returns. A broker runs once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{BrokerError, TopicError};
use crate::executor::{Executor, ExecutorManager};
use crate::queue::ExecutableQueue;
use crate::resources::ResourcesManager;
use crate::scheduler::Scheduler;
use crate::supervisor::TaskSupervisor;
use crate::sync::{hold, TaskHandle};
use crate::topics::{Topic, TopicFactory, TopicOptions};
use crate::work::{QueueDefinition, WorkSource, WorkSync};

/// Assembles a [`Broker`].
///
/// `work_source` and `executor` are required; everything else has a
/// default.
#[derive(Default)]
pub struct BrokerBuilder {
    config: Config,
    work_source: Option<Arc<dyn WorkSource>>,
    executor: Option<Arc<dyn Executor>>,
    topic_factory: Option<TopicFactory>,
}

impl BrokerBuilder {
    /// Starts a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the work source. Required.
    pub fn with_work_source(mut self, source: Arc<dyn WorkSource>) -> Self {
        self.work_source = Some(source);
        self
    }

    /// Sets the pipeline executor. Required.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the topic factory used to build queue topics.
    pub fn with_topic_factory(mut self, factory: TopicFactory) -> Self {
        self.topic_factory = Some(factory);
        self
    }

    /// Builds the broker.
    pub fn build(self) -> Result<Broker, BrokerError> {
        let work_source = self.work_source.ok_or(BrokerError::Misconfigured {
            missing: "work_source",
        })?;
        let executor = self.executor.ok_or(BrokerError::Misconfigured {
            missing: "executor",
        })?;

        let resources = ResourcesManager::new();
        Ok(Broker {
            executor: ExecutorManager::new(executor, resources.clone(), &self.config),
            scheduler: Scheduler::new(self.config.grace),
            supervisor: TaskSupervisor::new(self.config.grace),
            topic_factory: self.topic_factory.unwrap_or_default(),
            sync_tasks: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            resources,
            work_source,
            config: self.config,
        })
    }
}

/// The engine orchestrator. Built by [`BrokerBuilder`].
pub struct Broker {
    config: Config,
    work_source: Arc<dyn WorkSource>,
    topic_factory: TopicFactory,
    scheduler: Scheduler,
    supervisor: TaskSupervisor,
    resources: ResourcesManager,
    executor: ExecutorManager,
    sync_tasks: Mutex<HashMap<String, TaskHandle>>,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl Broker {
    /// Runs the broker until [`stop`](Self::stop) or a fatal failure.
    ///
    /// Every component is closed before this returns. A broker runs once;
    /// later calls return [`BrokerError::AlreadyRunning`].
    pub async fn run(&self) -> Result<(), BrokerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyRunning);
        }
        info!("broker starting");
        self.executor.start();

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Ok(()),
            result = self.sync_loop() => result,
            _ = self.dispatch_loop() => Ok(()),
            _ = self.supervisor.run() => Ok(()),
        };
        match &result {
            Ok(()) => info!("broker stopping"),
            Err(err) => error!(error = %err, "broker stopping after failure"),
        }

        self.close().await;
        result
    }

    /// Requests shutdown. Idempotent; `run` unwinds and closes.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Pulls syncs from the work source and reconciles.
    async fn sync_loop(&self) -> Result<(), BrokerError> {
        loop {
            let work = self.work_source.sync().await?;
            if !work.is_empty() {
                self.apply_sync(work).await;
            }
            time::sleep(self.config.sync_interval).await;
        }
    }

    /// Moves fetched messages into the executor.
    async fn dispatch_loop(&self) {
        while let Some(message) = self.scheduler.next().await {
            self.executor.submit(message).await;
        }
    }

    /// Applies one sync: additions first, then removals.
    async fn apply_sync(&self, work: WorkSync) {
        for definition in work.queues.add {
            let name = definition.name.clone();
            match self.build_queue(definition) {
                Ok(queue) => self.scheduler.add(queue),
                Err(err) => error!(queue = %name, error = %err, "queue build failed; skipped"),
            }
        }
        for definition in work.tasks.add {
            let mut sync_tasks = hold(&self.sync_tasks);
            if sync_tasks.contains_key(&definition.name) {
                warn!(task = %definition.name, "task already running; ignored");
                continue;
            }
            let handle = self.supervisor.spawn(definition.name.clone(), (definition.make)());
            sync_tasks.insert(definition.name, handle);
        }
        for resource in work.resources.add {
            self.resources.add(resource);
        }

        for name in work.queues.drop {
            self.scheduler.remove(&name).await;
        }
        for name in work.tasks.drop {
            let handle = hold(&self.sync_tasks).remove(&name);
            match handle {
                Some(handle) => self.supervisor.remove(&handle).await,
                None => warn!(task = %name, "unknown task dropped; ignored"),
            }
        }
        for name in work.resources.drop {
            match name.split_once('/') {
                Some((type_name, resource)) => self.resources.remove(type_name, resource),
                None => warn!(resource = %name, "resource drop without type prefix; ignored"),
            }
        }
    }

    /// Builds a queue and its topics from a definition.
    fn build_queue(&self, definition: QueueDefinition) -> Result<ExecutableQueue, TopicError> {
        let input = self.topic_factory.build(
            &definition.input.kind,
            TopicOptions {
                name: definition.input.name,
                options: definition.input.options,
            },
        )?;

        let mut output: HashMap<String, Vec<Arc<dyn Topic>>> = HashMap::new();
        for (channel, specs) in definition.output {
            let mut topics = Vec::with_capacity(specs.len());
            for spec in specs {
                topics.push(self.topic_factory.build(
                    &spec.kind,
                    TopicOptions {
                        name: spec.name,
                        options: spec.options,
                    },
                )?);
            }
            output.insert(channel, topics);
        }

        Ok(ExecutableQueue::new(
            definition.name,
            input,
            definition.pipeline,
            output,
        ))
    }

    /// Closes every component, isolating failures to their step.
    async fn close(&self) {
        self.scheduler.close().await;
        self.supervisor.close().await;
        self.work_source.close().await;
        self.executor.close().await;
        info!("broker closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkSourceError;
    use crate::executor::InProcessExecutor;
    use crate::message::TopicMessage;
    use crate::pipeline::{PipelineInfo, PipelineMessage, PipelineOutput, QueuePipeline};
    use crate::resources::Resource;
    use crate::topics::MemoryRegistry;
    use crate::work::{StaticWorkSource, SyncDiff, TaskDefinition, TopicSpec};
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn memory_factory(registry: &MemoryRegistry) -> TopicFactory {
        let registry = registry.clone();
        let mut factory = TopicFactory::new();
        factory.register("memory", move |opts| Ok(registry.topic(&opts.name, 16)));
        factory
    }

    fn echo_executor() -> Arc<InProcessExecutor> {
        Arc::new(InProcessExecutor::new(|message: PipelineMessage| async move {
            Ok(vec![PipelineOutput {
                channel: "out".into(),
                message: TopicMessage::new(message.message.args),
            }])
        }))
    }

    fn resize_queue() -> QueueDefinition {
        let mut resources = BTreeMap::new();
        resources.insert("gpu".to_string(), "gpu".to_string());
        let mut output = HashMap::new();
        output.insert(
            "out".to_string(),
            vec![TopicSpec {
                kind: "memory".into(),
                name: "out".into(),
                options: Value::Null,
            }],
        );
        QueueDefinition {
            name: "resize".into(),
            input: TopicSpec {
                kind: "memory".into(),
                name: "in".into(),
                options: Value::Null,
            },
            pipeline: QueuePipeline {
                info: PipelineInfo {
                    name: "resize".into(),
                    resources,
                },
                args: map(json!({"quality": 80})),
            },
            output,
        }
    }

    fn broker_over(registry: &MemoryRegistry, work: WorkSync) -> Broker {
        BrokerBuilder::new()
            .with_work_source(Arc::new(StaticWorkSource::new(work)))
            .with_executor(echo_executor())
            .with_topic_factory(memory_factory(registry))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_work_source_and_executor() {
        assert!(matches!(
            BrokerBuilder::new().with_executor(echo_executor()).build(),
            Err(BrokerError::Misconfigured { missing: "work_source" })
        ));
        assert!(matches!(
            BrokerBuilder::new()
                .with_work_source(Arc::new(StaticWorkSource::new(WorkSync::default())))
                .build(),
            Err(BrokerError::Misconfigured { missing: "executor" })
        ));
    }

    #[tokio::test]
    async fn test_messages_flow_from_input_to_output() {
        let registry = MemoryRegistry::new();
        let work = WorkSync {
            queues: SyncDiff {
                add: vec![resize_queue()],
                drop: Vec::new(),
            },
            resources: SyncDiff {
                add: vec![Resource {
                    name: "gpu0".into(),
                    type_name: "gpu".into(),
                    data: json!({"device": 0}),
                }],
                drop: Vec::new(),
            },
            ..WorkSync::default()
        };
        let broker = Arc::new(broker_over(&registry, work));

        let running = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.run().await })
        };

        registry
            .topic("in", 16)
            .publish(TopicMessage::new(map(json!({"file": "a.png"}))), true)
            .await
            .unwrap();

        let produced = registry.topic("out", 16).next().await.unwrap();
        let args = &produced.message.args;
        assert_eq!(args["file"], "a.png");
        assert_eq!(args["quality"], 80);
        assert_eq!(args["gpu"]["name"], "gpu0");
        assert_eq!(args["gpu"]["data"]["device"], 0);
        produced.settle(true).await;

        broker.stop();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let registry = MemoryRegistry::new();
        let broker = Arc::new(broker_over(&registry, WorkSync::default()));

        let running = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.run().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(broker.run().await, Err(BrokerError::AlreadyRunning)));

        broker.stop();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sync_failure_stops_the_broker() {
        struct FailingSource;

        #[async_trait]
        impl WorkSource for FailingSource {
            async fn sync(&self) -> Result<WorkSync, WorkSourceError> {
                Err(WorkSourceError::Unavailable {
                    error: "manager unreachable".into(),
                })
            }
        }

        let broker = BrokerBuilder::new()
            .with_work_source(Arc::new(FailingSource))
            .with_executor(echo_executor())
            .build()
            .unwrap();

        assert!(matches!(broker.run().await, Err(BrokerError::Sync(_))));
    }

    #[tokio::test]
    async fn test_same_sync_applies_adds_before_drops() {
        let registry = MemoryRegistry::new();
        let broker = broker_over(&registry, WorkSync::default());

        let work = WorkSync {
            queues: SyncDiff {
                add: vec![resize_queue()],
                drop: vec!["resize".into()],
            },
            ..WorkSync::default()
        };
        broker.apply_sync(work).await;

        // The drop saw the queue the same sync added.
        assert!(broker.scheduler.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_background_tasks_follow_syncs() {
        let registry = MemoryRegistry::new();
        let broker = broker_over(&registry, WorkSync::default());

        let work = WorkSync {
            tasks: SyncDiff {
                add: vec![TaskDefinition::new("tick", || async {
                    std::future::pending::<()>().await;
                    Ok(())
                })],
                drop: Vec::new(),
            },
            ..WorkSync::default()
        };
        broker.apply_sync(work).await;
        assert_eq!(broker.supervisor.task_names(), ["tick"]);

        let work = WorkSync {
            tasks: SyncDiff {
                add: Vec::new(),
                drop: vec!["tick".into()],
            },
            ..WorkSync::default()
        };
        broker.apply_sync(work).await;
        assert!(broker.supervisor.task_names().is_empty());
    }

    #[tokio::test]
    async fn test_resource_drop_uses_type_prefix() {
        let registry = MemoryRegistry::new();
        let broker = broker_over(&registry, WorkSync::default());

        let work = WorkSync {
            resources: SyncDiff {
                add: vec![Resource {
                    name: "gpu0".into(),
                    type_name: "gpu".into(),
                    data: Value::Null,
                }],
                drop: Vec::new(),
            },
            ..WorkSync::default()
        };
        broker.apply_sync(work).await;
        assert_eq!(broker.resources.available("gpu"), 1);

        let work = WorkSync {
            resources: SyncDiff {
                add: Vec::new(),
                drop: vec!["gpu/gpu0".into()],
            },
            ..WorkSync::default()
        };
        broker.apply_sync(work).await;
        assert_eq!(broker.resources.available("gpu"), 0);
    }
}

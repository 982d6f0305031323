//! # Pipeline execution.
//!
//! [`Executor`] is the seam to whatever actually runs pipelines; the
//! in-process implementation spawns the handler so panics stay contained.
//! [`ExecutorManager`] drives executions: it gates on the concurrency cap
//! and resource leases (parking the originating queue while it waits),
//! runs the pipeline, publishes routed outputs, and settles the delivery.
//!
//! ```text
//!   submit ──▶ cap? ──▶ leases? ──▶ process ──▶ route outputs
//!                │          │                       │
//!              park       park                 settle + release
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::ExecutorError;
use crate::pipeline::{ExecutableMessage, PipelineMessage, PipelineOutput};
use crate::resources::{ResourceLease, ResourcesManager};
use crate::sync::{hold, TaskSet};
use crate::topics::Topic;

/// Runs pipelines.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Runs the pipeline once and returns the messages it produced.
    async fn process(&self, message: PipelineMessage) -> Result<Vec<PipelineOutput>, ExecutorError>;
}

type PipelineFn = Box<
    dyn Fn(PipelineMessage) -> BoxFuture<'static, Result<Vec<PipelineOutput>, ExecutorError>>
        + Send
        + Sync,
>;

/// Executor running pipelines as local tasks.
///
/// Each run is spawned, so a panicking pipeline surfaces as
/// [`ExecutorError::Panicked`] instead of tearing down the caller.
pub struct InProcessExecutor {
    handler: PipelineFn,
}

impl InProcessExecutor {
    /// Wraps `handler` as the pipeline implementation.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(PipelineMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Vec<PipelineOutput>, ExecutorError>>
            + Send
            + 'static,
    {
        Self {
            handler: Box::new(move |message| handler(message).boxed()),
        }
    }
}

#[async_trait]
impl Executor for InProcessExecutor {
    async fn process(&self, message: PipelineMessage) -> Result<Vec<PipelineOutput>, ExecutorError> {
        match tokio::spawn((self.handler)(message)).await {
            Ok(result) => result,
            Err(join) if join.is_cancelled() => Err(ExecutorError::Canceled),
            Err(join) => Err(ExecutorError::Panicked {
                error: join.to_string(),
            }),
        }
    }
}

/// Drives pipeline executions within the configured limits.
pub struct ExecutorManager {
    executor: Arc<dyn Executor>,
    resources: ResourcesManager,
    slots: Option<Arc<Semaphore>>,
    tasks: Arc<TaskSet>,
    grace: Duration,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorManager {
    /// Creates a manager running pipelines on `executor` with resources
    /// from `resources`, capped per `config`.
    pub fn new(executor: Arc<dyn Executor>, resources: ResourcesManager, config: &Config) -> Self {
        Self {
            executor,
            resources,
            slots: config
                .concurrency_limit()
                .map(|n| Arc::new(Semaphore::new(n))),
            tasks: Arc::new(TaskSet::new()),
            grace: config.grace,
            drain: Mutex::new(None),
        }
    }

    /// Starts the completion drain. Idempotent.
    ///
    /// Execution outcomes are logged where they happen; the drain only
    /// reaps finished tasks and reports panics.
    pub fn start(&self) {
        let mut drain = hold(&self.drain);
        if drain.is_some() {
            return;
        }
        let tasks = Arc::clone(&self.tasks);
        *drain = Some(tokio::spawn(async move {
            loop {
                tasks.wait_non_empty().await;
                for finished in tasks.wait().await {
                    match finished.outcome {
                        Ok(()) => {}
                        Err(err) if err.is_cancellation() => {
                            debug!(task = finished.handle.name(), "execution cancelled");
                        }
                        Err(err) => {
                            error!(
                                task = finished.handle.name(),
                                label = err.as_label(),
                                error = %err,
                                "execution task failed",
                            );
                        }
                    }
                }
            }
        }));
    }

    /// Accepts `executable` for execution.
    ///
    /// Suspends until a concurrency slot and all required resources are
    /// held, parking the originating queue while anything is short. The
    /// execution itself runs as a background task; this returns as soon
    /// as it is spawned.
    pub async fn submit(&self, executable: ExecutableMessage) {
        let permit = match &self.slots {
            Some(slots) => match Arc::clone(slots).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    executable.park();
                    // Slots are never closed.
                    let permit = Arc::clone(slots)
                        .acquire_owned()
                        .await
                        .expect("executor slots are never closed");
                    executable.unpark();
                    Some(permit)
                }
            },
            None => None,
        };

        let mut leases: Vec<(String, ResourceLease)> = Vec::new();
        for (arg, type_name) in &executable.pipeline().info.resources {
            let lease = match self.resources.try_acquire(type_name) {
                Some(lease) => lease,
                None => {
                    debug!(
                        queue = executable.queue_name(),
                        r#type = %type_name,
                        "no resource available; queue parked",
                    );
                    executable.park();
                    let lease = self.resources.acquire(type_name).await;
                    executable.unpark();
                    lease
                }
            };
            leases.push((arg.clone(), lease));
        }

        let executor = Arc::clone(&self.executor);
        let task_name = format!("process:{}", executable.id());
        self.tasks.spawn(task_name, async move {
            let _permit = permit;
            let (delivery, mut pipeline, output) = executable.into_parts();

            for (arg, lease) in &leases {
                let resource = lease.resource();
                pipeline.message.args.insert(
                    arg.clone(),
                    json!({
                        "name": resource.name,
                        "type": resource.type_name,
                        "data": resource.data,
                    }),
                );
            }

            let message_id = pipeline.message.id.clone();
            let pipeline_name = pipeline.info.name.clone();
            let success = match executor.process(pipeline).await {
                Ok(outputs) => route_outputs(&message_id, outputs, &output).await,
                Err(err) => {
                    error!(
                        message = %message_id,
                        pipeline = %pipeline_name,
                        error = %err,
                        "pipeline failed",
                    );
                    false
                }
            };
            delivery.settle(success).await;
            drop(leases);
            Ok(())
        });
    }

    /// Number of executions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Stops the drain and the in-flight executions. Idempotent.
    pub async fn close(&self) {
        if let Some(drain) = hold(&self.drain).take() {
            drain.abort();
        }
        self.tasks.close(self.grace).await;
    }
}

/// Publishes `outputs` through the routing table.
///
/// Returns `false` when any output could not be published, so the
/// delivery is rejected and the message retried.
async fn route_outputs(
    message_id: &str,
    outputs: Vec<PipelineOutput>,
    routes: &HashMap<String, Vec<Arc<dyn Topic>>>,
) -> bool {
    let mut success = true;
    for produced in outputs {
        let Some(topics) = routes.get(&produced.channel) else {
            warn!(
                message = %message_id,
                channel = %produced.channel,
                "no route for output channel; dropped",
            );
            continue;
        };
        for topic in topics {
            if let Err(err) = topic.publish(produced.message.clone(), true).await {
                error!(
                    message = %message_id,
                    channel = %produced.channel,
                    topic = topic.name(),
                    error = %err,
                    "output publish failed",
                );
                success = false;
            }
        }
    }
    success
}

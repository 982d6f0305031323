//! # A queue: input topic, pipeline, and output routes.
//!
//! [`ExecutableQueue`] binds one input [`Topic`] to a pipeline and a
//! routing table. Fetching honors the queue's [`Parker`]: while any
//! in-flight message (or the executor) keeps the gate closed, no new
//! message is pulled from the input.

use std::collections::HashMap;
use std::sync::Arc;

use crate::pipeline::{merge_args, ExecutableMessage, PipelineMessage, QueuePipeline};
use crate::sync::Parker;
use crate::topics::Topic;

/// One configured queue.
pub struct ExecutableQueue {
    name: String,
    topic: Arc<dyn Topic>,
    pipeline: QueuePipeline,
    output: HashMap<String, Vec<Arc<dyn Topic>>>,
    parker: Parker,
}

impl ExecutableQueue {
    /// Binds `topic` to `pipeline` with `output` routes.
    pub fn new(
        name: impl Into<String>,
        topic: Arc<dyn Topic>,
        pipeline: QueuePipeline,
        output: HashMap<String, Vec<Arc<dyn Topic>>>,
    ) -> Self {
        Self {
            name: name.into(),
            topic,
            pipeline,
            output,
            parker: Parker::new(),
        }
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue's flow-control gate.
    pub fn parker(&self) -> &Parker {
        &self.parker
    }

    /// Fetches the next message, merged and packaged for execution.
    ///
    /// Waits for the flow-control gate first, so a parked queue fetches
    /// nothing. Returns `None` when the input topic is closed or
    /// exhausted.
    pub async fn next(&self) -> Option<ExecutableMessage> {
        self.parker.wait().await;
        let delivery = self.topic.next().await?;

        let mut message = delivery.message.clone();
        message.args = merge_args(&self.pipeline.args, &message.args);
        let pipeline = PipelineMessage {
            info: self.pipeline.info.clone(),
            message,
        };
        Some(ExecutableMessage::new(
            delivery,
            pipeline,
            self.output.clone(),
            self.parker.clone(),
            self.name.clone(),
        ))
    }

    /// Closes the input topic; in-flight messages settle normally.
    pub async fn close(&self) {
        self.topic.close().await;
    }
}

//! # Pipeline descriptors and executable work items.
//!
//! A queue binds an input topic to a [`QueuePipeline`]; each received
//! message becomes a [`PipelineMessage`] (pipeline info + message) and,
//! wrapped with its delivery, routing table, and flow-control gate, an
//! [`ExecutableMessage`] ready for the executor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::{TopicDelivery, TopicMessage};
use crate::sync::Parker;
use crate::topics::Topic;

/// Identity of a pipeline and the resource types it needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineInfo {
    /// Pipeline name, as known to the executor.
    pub name: String,

    /// Resource requirements: argument name to resource type.
    ///
    /// Before execution, one resource of each named type is leased and its
    /// description is merged into the message args under the given name.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

/// A pipeline bound to a queue, with queue-level default arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuePipeline {
    /// The pipeline to run for every message on the queue.
    pub info: PipelineInfo,

    /// Default arguments; message args override them key by key.
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// What the executor runs: a pipeline applied to one merged message.
#[derive(Clone, Debug)]
pub struct PipelineMessage {
    /// The pipeline to run.
    pub info: PipelineInfo,

    /// The message, with queue defaults already merged into its args.
    pub message: TopicMessage,
}

/// One message produced by a pipeline run, addressed to an output channel.
#[derive(Clone, Debug)]
pub struct PipelineOutput {
    /// Logical output channel name, resolved through the queue's routing
    /// table.
    pub channel: String,

    /// The message to publish.
    pub message: TopicMessage,
}

/// A received message packaged for execution.
///
/// Carries everything the executor needs: the pipeline-merged message,
/// the delivery to settle, the output routing table, and the queue's
/// flow-control gate.
pub struct ExecutableMessage {
    delivery: TopicDelivery,
    pipeline: PipelineMessage,
    output: HashMap<String, Vec<Arc<dyn Topic>>>,
    parker: Parker,
    queue_name: String,
}

impl ExecutableMessage {
    pub(crate) fn new(
        delivery: TopicDelivery,
        pipeline: PipelineMessage,
        output: HashMap<String, Vec<Arc<dyn Topic>>>,
        parker: Parker,
        queue_name: String,
    ) -> Self {
        Self {
            delivery,
            pipeline,
            output,
            parker,
            queue_name,
        }
    }

    /// The id of the underlying message.
    pub fn id(&self) -> &str {
        &self.pipeline.message.id
    }

    /// Name of the queue this message arrived on.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// The pipeline invocation to execute.
    pub fn pipeline(&self) -> &PipelineMessage {
        &self.pipeline
    }

    /// Parks the originating queue on behalf of this message.
    pub fn park(&self) {
        self.parker.park(self.pipeline.message.id.clone());
    }

    /// Releases this message's hold on the originating queue.
    pub fn unpark(&self) {
        self.parker.unpark(&self.pipeline.message.id);
    }

    /// Splits into the delivery, the pipeline invocation, and the routing
    /// table.
    pub fn into_parts(
        self,
    ) -> (
        TopicDelivery,
        PipelineMessage,
        HashMap<String, Vec<Arc<dyn Topic>>>,
    ) {
        (self.delivery, self.pipeline, self.output)
    }
}

/// Merges queue default args under message args.
///
/// Message keys win on conflict.
pub(crate) fn merge_args(
    defaults: &Map<String, Value>,
    message: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = defaults.clone();
    for (key, value) in message {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

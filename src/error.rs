//! Error types used across the engine.
//!
//! One enum per failure domain:
//!
//! - [`TaskError`]: outcomes of supervised background tasks.
//! - [`TransportError`]: failures at the broker transport seam.
//! - [`TopicError`]: failures raised by topic consume/publish.
//! - [`JobError`]: cursor-store and inventory failures.
//! - [`ExecutorError`]: pipeline execution failures.
//! - [`WorkSourceError`]: work-manager sync failures.
//! - [`BrokerError`]: orchestrator-level failures.
//!
//! The frequently-logged types provide `as_label()` returning a short
//! stable snake_case label for log fields.

use thiserror::Error;

/// Outcome of a supervised background task.
///
/// Tasks tracked by a `TaskSet` finish with `Ok(())` or one of these.
/// Individual task failures are never raised to `wait()` callers; they
/// are returned as finished outcomes and logged by the supervisor.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TaskError {
    /// Task execution failed.
    #[error("task failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// Task panicked; the panic was caught at the join boundary.
    #[error("task panicked: {error}")]
    Panicked {
        /// The panic payload, stringified.
        error: String,
    },

    /// Task was aborted or cancelled before completion.
    #[error("task cancelled")]
    Canceled,
}

impl TaskError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Fail { .. } => "task_failed",
            TaskError::Panicked { .. } => "task_panicked",
            TaskError::Canceled => "task_canceled",
        }
    }

    /// `true` when the task ended by cancellation rather than by failing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }
}

/// Failures at the broker transport seam.
///
/// Produced by `Connector`/`Channel` implementations. Clonable because a
/// single connect attempt may be observed by many concurrent publishers
/// through the shared memoized channel slot.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Establishing the connection or channel failed.
    #[error("connect failed: {error}")]
    Connect {
        /// The underlying error message.
        error: String,
    },

    /// The channel or connection is closed.
    #[error("transport closed")]
    Closed,

    /// An established channel failed mid-operation.
    #[error("transport failure: {error}")]
    Failed {
        /// The underlying error message.
        error: String,
    },
}

impl TransportError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TransportError::Connect { .. } => "transport_connect",
            TransportError::Closed => "transport_closed",
            TransportError::Failed { .. } => "transport_failed",
        }
    }
}

/// Failures raised by topic consume/publish.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TopicError {
    /// The topic has been closed; no further publishes are accepted.
    #[error("topic closed")]
    Closed,

    /// The topic is consume-only and does not accept publishes.
    #[error("publish not supported by this topic")]
    PublishUnsupported,

    /// A transport-level failure surfaced through the topic.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Message encoding or decoding failed.
    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    /// No builder registered for the requested topic kind.
    #[error("unknown topic kind: {kind}")]
    UnknownKind {
        /// The type tag that had no registered builder.
        kind: String,
    },

    /// Builder options did not match the topic kind's schema.
    #[error("invalid topic options: {error}")]
    InvalidOptions {
        /// The underlying deserialization error message.
        error: String,
    },
}

/// Cursor-store and inventory failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum JobError {
    /// The cursor store rejected a load, save, or flush.
    #[error("job store failure: {error}")]
    Store {
        /// The underlying error message.
        error: String,
    },

    /// The inventory failed to produce a batch.
    #[error("inventory failure: {error}")]
    Inventory {
        /// The underlying error message.
        error: String,
    },

    /// A stored cursor could not be interpreted by the inventory.
    #[error("bad cursor: {cursor}")]
    BadCursor {
        /// The cursor value that failed to parse.
        cursor: String,
    },
}

/// Pipeline execution failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The pipeline reported an error.
    #[error("pipeline failed: {error}")]
    Pipeline {
        /// The underlying error message.
        error: String,
    },

    /// The pipeline panicked inside the executor.
    #[error("pipeline panicked: {error}")]
    Panicked {
        /// The panic payload, stringified.
        error: String,
    },

    /// Execution was cancelled before completion.
    #[error("execution cancelled")]
    Canceled,
}

/// Work-manager sync failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WorkSourceError {
    /// The work source could not produce a sync.
    #[error("work source unavailable: {error}")]
    Unavailable {
        /// The underlying error message.
        error: String,
    },
}

/// Orchestrator-level failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BrokerError {
    /// `run()` was called while the broker was already running.
    #[error("broker already running")]
    AlreadyRunning,

    /// The sync loop could not reach the work source.
    #[error(transparent)]
    Sync(#[from] WorkSourceError),

    /// The broker was built without a required component.
    #[error("broker misconfigured: missing {missing}")]
    Misconfigured {
        /// Name of the missing component.
        missing: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_labels_are_stable() {
        assert_eq!(TaskError::Fail { error: "x".into() }.as_label(), "task_failed");
        assert_eq!(TaskError::Canceled.as_label(), "task_canceled");
    }

    #[test]
    fn test_cancellation_is_not_failure() {
        assert!(TaskError::Canceled.is_cancellation());
        assert!(!TaskError::Fail { error: "x".into() }.is_cancellation());
    }

    #[test]
    fn test_transport_error_is_clonable_for_shared_slots() {
        let err = TransportError::Connect { error: "refused".into() };
        let copy = err.clone();
        assert_eq!(copy.as_label(), "transport_connect");
    }
}

//! Typed failures surfaced by the pipeline.
//!
//! Components propagate `anyhow::Error` internally; a `PipelineError` placed
//! inside one keeps its identity and is recovered at the executor boundary
//! with [`PipelineError::from_anyhow`].

use crate::types::CheckpointId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The selected state backend could not be initialized.
    #[error("failed to initialize {backend} state backend: {source:#}")]
    BackendConstruction {
        backend: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A single checkpoint attempt failed. Recoverable.
    #[error("checkpoint {checkpoint_id} failed: {reason}")]
    CheckpointFailure {
        checkpoint_id: CheckpointId,
        reason: String,
    },

    /// Consecutive checkpoint failures exceeded the tolerated streak.
    #[error("{consecutive} consecutive checkpoint failures (tolerable: {tolerable}), last: {last_reason}")]
    TooManyCheckpointFailures {
        consecutive: u32,
        tolerable: u32,
        last_reason: String,
    },

    /// The sink could not durably write an output record.
    #[error("failed to publish to topic {topic}: {source:#}")]
    PublishFailure {
        topic: String,
        #[source]
        source: anyhow::Error,
    },

    /// Graph build or execution start failed.
    #[error("pipeline startup failed: {0:#}")]
    RuntimeStartup(#[source] anyhow::Error),

    /// A task failed at runtime with an error outside the typed categories.
    #[error("task {task} failed: {source:#}")]
    TaskFailure {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// The environment was asked to execute a second graph.
    #[error("pipeline has already been started by this environment")]
    AlreadyStarted,
}

impl PipelineError {
    /// Recover a typed error carried inside `err`, or wrap it as a task failure.
    pub fn from_anyhow(task: impl Into<String>, err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(typed) => typed,
            Err(other) => PipelineError::TaskFailure {
                task: task.into(),
                source: other,
            },
        }
    }

    /// Whether this is a publish failure from the sink.
    pub fn is_publish_failure(&self) -> bool {
        matches!(self, PipelineError::PublishFailure { .. })
    }
}

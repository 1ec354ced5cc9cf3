use std::sync::Arc;

use crate::config::CheckpointPolicy;
use crate::connector::{BrokerSink, BrokerSource};
use crate::error::PipelineError;
use crate::runtime::{self, JobHandle, JobOutcome, Transform};
use crate::state::StateBackend;

/// Bounded data channel size between the source and the operator task.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A complete pipeline: source, transform and sink bound to one state
/// backend and, optionally, one checkpoint policy.
///
/// Starting a graph consumes it, so the same graph cannot run twice.
pub struct PipelineGraph<IN, OUT> {
    pub(crate) job_name: String,
    pub(crate) source: BrokerSource<IN>,
    pub(crate) transform: Box<dyn Transform<IN, OUT>>,
    pub(crate) sink: BrokerSink<OUT>,
    pub(crate) backend: Arc<dyn StateBackend>,
    pub(crate) policy: Option<CheckpointPolicy>,
    pub(crate) channel_capacity: usize,
}

impl<IN, OUT> PipelineGraph<IN, OUT>
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    pub fn new(
        job_name: impl Into<String>,
        source: BrokerSource<IN>,
        transform: impl Transform<IN, OUT> + 'static,
        sink: BrokerSink<OUT>,
        backend: Arc<dyn StateBackend>,
    ) -> Self {
        Self::with_boxed_transform(job_name, source, Box::new(transform), sink, backend)
    }

    pub fn with_boxed_transform(
        job_name: impl Into<String>,
        source: BrokerSource<IN>,
        transform: Box<dyn Transform<IN, OUT>>,
        sink: BrokerSink<OUT>,
        backend: Arc<dyn StateBackend>,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            source,
            transform,
            sink,
            backend,
            policy: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Take periodic checkpoints according to `policy`.
    pub fn with_checkpointing(mut self, policy: CheckpointPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn checkpoint_policy(&self) -> Option<&CheckpointPolicy> {
        self.policy.as_ref()
    }

    pub fn state_backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Start the job and return immediately.
    pub fn launch(self) -> Result<JobHandle, PipelineError> {
        runtime::launch(self)
    }

    /// Start the job and block until it ends.
    pub fn execute(self) -> Result<JobOutcome, PipelineError> {
        self.launch()?.join()
    }
}

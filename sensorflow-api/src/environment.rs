use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use sensorflow_core::config::{CheckpointPolicy, JobConfiguration, BYTES_PER_MB, DEFAULT_STATE_BACKEND_MB};
use sensorflow_core::connector::BrokerSource;
use sensorflow_core::error::PipelineError;
use sensorflow_core::graph::PipelineGraph;
use sensorflow_core::runtime::{JobHandle, JobOutcome};
use sensorflow_core::state::{self, MemoryStateBackend, StateBackend};

use crate::datastream::DataStream;

/// Shared mutable state for building the pipeline.
pub(crate) struct EnvInner {
    pub job_name: String,
    pub state_backend: Option<Arc<dyn StateBackend>>,
    pub checkpoint_policy: Option<CheckpointPolicy>,
    pub started: bool,
}

impl EnvInner {
    /// The configured backend, or the default bounded memory backend.
    pub fn state_backend(&mut self) -> Arc<dyn StateBackend> {
        let backend = self.state_backend.get_or_insert_with(|| {
            Arc::new(MemoryStateBackend::new(
                DEFAULT_STATE_BACKEND_MB as usize * BYTES_PER_MB,
            ))
        });
        Arc::clone(backend)
    }
}

/// The entry point for building a pipeline job.
///
/// Configure the state backend and checkpointing, add the source via
/// [`add_source`](Self::add_source), attach a transform and a sink on the
/// returned [`DataStream`], and hand the resulting graph to
/// [`execute`](Self::execute). An environment runs one graph in its lifetime.
pub struct StreamExecutionEnvironment {
    pub(crate) inner: Rc<RefCell<EnvInner>>,
}

impl StreamExecutionEnvironment {
    /// Create a new execution environment for a job with the given name.
    pub fn new(job_name: &str) -> Self {
        Self {
            inner: Rc::new(RefCell::new(EnvInner {
                job_name: job_name.to_string(),
                state_backend: None,
                checkpoint_policy: None,
                started: false,
            })),
        }
    }

    /// Environment with the backend and checkpoint policy of `config`.
    pub fn from_config(config: &JobConfiguration) -> Result<Self, PipelineError> {
        let env = Self::new(&config.job_name);
        env.set_state_backend(state::select(config)?);
        env.enable_checkpointing(config.checkpoint_policy.clone());
        Ok(env)
    }

    pub fn job_name(&self) -> String {
        self.inner.borrow().job_name.clone()
    }

    pub fn set_state_backend(&self, backend: Arc<dyn StateBackend>) -> &Self {
        self.inner.borrow_mut().state_backend = Some(backend);
        self
    }

    pub fn state_backend(&self) -> Arc<dyn StateBackend> {
        self.inner.borrow_mut().state_backend()
    }

    pub fn enable_checkpointing(&self, policy: CheckpointPolicy) -> &Self {
        self.inner.borrow_mut().checkpoint_policy = Some(policy);
        self
    }

    pub fn checkpoint_policy(&self) -> Option<CheckpointPolicy> {
        self.inner.borrow().checkpoint_policy.clone()
    }

    /// Start the pipeline from a broker source.
    pub fn add_source<T>(&self, source: BrokerSource<T>) -> DataStream<T>
    where
        T: Send + 'static,
    {
        DataStream {
            env: Rc::clone(&self.inner),
            source,
        }
    }

    /// Run `graph` to the end.
    ///
    /// Fails with [`PipelineError::AlreadyStarted`] if this environment
    /// already started a graph.
    pub fn execute<IN, OUT>(&self, graph: PipelineGraph<IN, OUT>) -> Result<JobOutcome, PipelineError>
    where
        IN: Send + 'static,
        OUT: Send + 'static,
    {
        self.launch(graph)?.join()
    }

    /// Start `graph` and return a handle to the running job.
    pub fn launch<IN, OUT>(&self, graph: PipelineGraph<IN, OUT>) -> Result<JobHandle, PipelineError>
    where
        IN: Send + 'static,
        OUT: Send + 'static,
    {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.started {
                return Err(PipelineError::AlreadyStarted);
            }
            inner.started = true;
        }
        tracing::info!(
            job = graph.job_name(),
            backend = graph.state_backend().name(),
            checkpoint_interval_ms = graph.checkpoint_policy().map(CheckpointPolicy::interval_ms),
            "executing pipeline"
        );
        graph.launch()
    }
}

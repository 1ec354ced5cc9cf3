use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use sensorflow_core::connector::{BrokerSink, BrokerSource};
use sensorflow_core::graph::PipelineGraph;
use sensorflow_core::runtime::{MapTransform, Transform};

use crate::environment::EnvInner;

/// Records of type `T` read from a broker source.
///
/// Created by [`StreamExecutionEnvironment::add_source`](crate::environment::StreamExecutionEnvironment::add_source).
/// Call [`process`](Self::process) or [`map`](Self::map) to attach the
/// transform stage.
pub struct DataStream<T> {
    pub(crate) env: Rc<RefCell<EnvInner>>,
    pub(crate) source: BrokerSource<T>,
}

impl<T> DataStream<T>
where
    T: Send + 'static,
{
    /// Route every record through `transform`.
    pub fn process<OUT, Tr>(self, transform: Tr) -> TransformedStream<T, OUT>
    where
        OUT: Send + 'static,
        Tr: Transform<T, OUT> + 'static,
    {
        TransformedStream {
            env: self.env,
            source: self.source,
            transform: Box::new(transform),
        }
    }

    /// Stateless one-to-one transform.
    pub fn map<OUT, F>(self, f: F) -> TransformedStream<T, OUT>
    where
        OUT: Send + 'static,
        F: FnMut(T) -> Result<OUT> + Send + 'static,
    {
        self.process(MapTransform::new(f))
    }
}

/// A stream with its transform stage attached, waiting for a sink.
pub struct TransformedStream<IN, OUT> {
    env: Rc<RefCell<EnvInner>>,
    source: BrokerSource<IN>,
    transform: Box<dyn Transform<IN, OUT>>,
}

impl<IN, OUT> TransformedStream<IN, OUT>
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    /// Close the pipeline with `sink` and bind it to the environment's state
    /// backend and checkpoint policy.
    pub fn sink_to(self, sink: BrokerSink<OUT>) -> PipelineGraph<IN, OUT> {
        let mut inner = self.env.borrow_mut();
        let graph = PipelineGraph::with_boxed_transform(
            inner.job_name.clone(),
            self.source,
            self.transform,
            sink,
            inner.state_backend(),
        );
        match inner.checkpoint_policy.clone() {
            Some(policy) => graph.with_checkpointing(policy),
            None => graph,
        }
    }
}

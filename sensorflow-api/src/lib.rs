//! # SensorFlow API
//!
//! Builder API for checkpointed broker-to-broker pipelines.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sensorflow_api::environment::StreamExecutionEnvironment;
//! use sensorflow_core::config::CheckpointPolicy;
//! use sensorflow_core::connector::{
//!     BincodeSchema, BrokerSink, BrokerSource, DeliveryGuarantee, MemoryBroker,
//! };
//!
//! let broker = MemoryBroker::named("local").unwrap();
//! let env = StreamExecutionEnvironment::new("doubler");
//! env.enable_checkpointing(CheckpointPolicy::every_minutes(1).unwrap());
//!
//! let source = BrokerSource::subscribe(&broker, "in", "doubler", BincodeSchema::<u32>::new())
//!     .unwrap();
//! let sink = BrokerSink::new(
//!     Arc::new(broker.clone()),
//!     "out",
//!     BincodeSchema::<u32>::new(),
//!     DeliveryGuarantee::ExactlyOnce,
//! )
//! .unwrap();
//!
//! let graph = env
//!     .add_source(source)
//!     .map(|x: u32| Ok(x * 2))
//!     .sink_to(sink);
//! env.execute(graph).unwrap();
//! ```
//!
//! - [`environment`]: [`StreamExecutionEnvironment`](environment::StreamExecutionEnvironment):
//!   state backend, checkpointing and the single execution of a job.
//! - [`datastream`]: [`DataStream`](datastream::DataStream) and
//!   [`TransformedStream`](datastream::TransformedStream): source to transform to sink.

pub mod datastream;
pub mod environment;

pub use sensorflow_core;

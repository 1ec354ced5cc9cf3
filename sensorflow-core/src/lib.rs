//! # SensorFlow Core
//!
//! Runtime for a single checkpointed streaming pipeline: broker source,
//! transform, broker sink.
//!
//! - [`config`]: flag resolution into an immutable
//!   [`JobConfiguration`](config::JobConfiguration).
//! - [`state`]: state backends that store completed checkpoints.
//! - [`checkpoint`]: the barrier checkpoint protocol and its coordinator.
//! - [`connector`]: broker client seam, in-process broker, codecs, and the
//!   checkpoint-aware [`BrokerSource`](connector::BrokerSource) and
//!   [`BrokerSink`](connector::BrokerSink).
//! - [`time`]: event time extraction and watermarks.
//! - [`runtime`]: tasks, transforms and the job executor.
//! - [`graph`]: [`PipelineGraph`](graph::PipelineGraph), the unit that is launched.

pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod error;
pub mod graph;
pub mod runtime;
pub mod state;
pub mod time;
pub mod types;

pub use error::PipelineError;

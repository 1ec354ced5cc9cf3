//! Job configuration: raw flag values in, an immutable [`JobConfiguration`] out.
//!
//! Resolution is pure. It never touches the filesystem or the broker; any
//! invalid input is reported as a [`ConfigError`] before a pipeline is built.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

mod job;
mod policy;
mod raw;

pub use job::*;
pub use policy::*;
pub use raw::*;

/// Default in-memory snapshot capacity, in MB-equivalent units.
pub const DEFAULT_STATE_BACKEND_MB: u64 = 20;

/// Default checkpoint cadence, in minutes.
pub const DEFAULT_CHECKPOINT_INTERVAL_MINUTES: u64 = 10;

/// Bytes per MB-equivalent unit of `state-backend-mbsize`.
pub const BYTES_PER_MB: usize = 1024 * 1024;

pub const DEFAULT_INPUT_TOPIC: &str = "sensor-readings";
pub const DEFAULT_OUTPUT_TOPIC: &str = "sensor-moments";
pub const DEFAULT_JOB_NAME: &str = "sensor-moments";

/// Flag names understood by the resolver.
pub mod flags {
    pub const BOOTSTRAP_SERVER: &str = "bootstrap-server";
    pub const STATE_BACKEND: &str = "state-backend";
    pub const STATE_BACKEND_MBSIZE: &str = "state-backend-mbsize";
    pub const CHECKPOINTS_INTERVAL: &str = "flink-checkpoints-interval";
    pub const CHECKPOINTS_DIR: &str = "flink-checkpoints-dir";
    pub const INPUT_TOPIC: &str = "input-topic";
    pub const OUTPUT_TOPIC: &str = "output-topic";
    pub const JOB_NAME: &str = "job-name";
}

/// Configuration validation failure. Always fatal, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required option --{0}")]
    MissingRequiredField(String),

    #[error("unsupported state backend '{0}' (expected 'memory' or 'durable')")]
    UnsupportedBackendKind(String),

    #[error("invalid value '{value}' for --{field}: {reason}")]
    MalformedValue {
        field: String,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;

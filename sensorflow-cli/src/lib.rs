//! Job driver for the sensor moments pipeline.
//!
//! [`driver::run`] resolves the flags, builds the source → moments → sink
//! graph and runs it. The `sensorflow` binary wraps it with argument parsing,
//! logging and the exit code.

pub mod driver;
pub mod moments;

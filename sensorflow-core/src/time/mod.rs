//! Event time: timestamp extraction and watermark generation at the source.

use crate::types::{EventTime, Watermark};
use std::time::Duration;

mod watermark;

pub use watermark::*;

#[cfg(test)]
#[path = "tests/time_tests.rs"]
mod tests;

//! Checkpoint protocol: trigger, acknowledgement, finalization and restore.

use crate::error::PipelineError;
use crate::runtime::TaskId;
use crate::state::StateBackend;
use crate::types::{Barrier, CheckpointId, EventTime};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

mod coordinator;
mod events;
mod metadata;

pub use coordinator::*;
pub use events::*;
pub use metadata::*;

#[cfg(test)]
#[path = "tests/checkpoint_tests.rs"]
mod tests;

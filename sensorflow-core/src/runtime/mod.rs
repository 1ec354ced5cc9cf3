//! Task runtime: the source task, the operator task (transform chained with
//! the sink) and the executor that runs both next to the checkpoint
//! coordinator loop.
//!
//! ```text
//! source task ──data channel (bounded)──▶ operator task
//!      ▲                                      ▲
//!      └──── control ──── coordinator ──── control
//!                            ▲
//!                 acks / lifecycle events
//! ```

use crate::channel::{local_channel, LocalChannelReceiver, LocalChannelSender};
use crate::checkpoint::{
    CheckpointCoordinator, TaskCheckpointAbort, TaskCheckpointAck, TaskCheckpointEvent,
};
use crate::config::{CheckpointPolicy, CheckpointingMode};
use crate::connector::{BrokerSink, BrokerSource, DeliveryGuarantee, SourceBatch};
use crate::error::PipelineError;
use crate::graph::PipelineGraph;
use crate::types::{Barrier, CheckpointId, EventTime, StreamElement, StreamRecord, Watermark};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{never, select, tick, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

mod executor;
mod task;
mod transform;

pub use executor::*;
pub use task::*;
pub use transform::*;

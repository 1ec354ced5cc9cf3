//! Broker connectors: the client seam, the Kafka client, the in-process
//! broker, record codecs, and the checkpoint-aware source and sink adapters.
//!
//! The pipeline never talks to a broker directly. It goes through
//! [`BrokerClient`], which hands out consumers and (optionally transactional)
//! producers. [`connect`] resolves an address to a client.

use crate::error::PipelineError;
use crate::time::{WatermarkEmitter, WatermarkStrategy};
use crate::types::{CheckpointId, EventTime, StreamRecord, Watermark};
use ahash::RandomState;
use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

mod broker;
mod kafka;
mod memory;
mod schema;
mod sink;
mod source;

pub use broker::*;
pub use kafka::*;
pub use memory::*;
pub use schema::*;
pub use sink::*;
pub use source::*;

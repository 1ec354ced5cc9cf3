//! # State Backends
//!
//! Where completed checkpoints live between a snapshot and a restore.
//!
//! - [`MemoryStateBackend`]: snapshots held in process memory, bounded by a
//!   configured capacity. Survives a task failure, not a process crash.
//! - [`DurableStateBackend`]: snapshots written to a directory tree, with
//!   incremental (content-addressed) task state.
//!
//! Task threads never wait on a backend: they hand their snapshot bytes to
//! the coordinator thread, which does all backend I/O.

use crate::checkpoint::{CheckpointMetadata, CompletedCheckpoint};
use crate::config::{JobConfiguration, StateBackendChoice};
use crate::error::PipelineError;
use crate::runtime::TaskId;
use crate::types::CheckpointId;
use anyhow::{anyhow, Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

mod durable;
mod memory;

pub use durable::DurableStateBackend;
pub use memory::MemoryStateBackend;

/// Storage for completed checkpoints.
///
/// The coordinator writes every task state of a checkpoint first and its
/// metadata last; only checkpoints with metadata are listed or restored.
pub trait StateBackend: Send + Sync {
    /// Short backend name for logs and errors.
    fn name(&self) -> &'static str;

    /// First I/O of the backend. Called once when the job starts.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Whether snapshots are persisted off the processing path.
    fn async_snapshots(&self) -> bool;

    /// Whether unchanged task state is shared between checkpoints.
    fn incremental_snapshots(&self) -> bool;

    fn save_task_state(
        &self,
        checkpoint_id: CheckpointId,
        task_id: TaskId,
        state: Vec<u8>,
    ) -> Result<()>;

    fn save_checkpoint(&self, metadata: CheckpointMetadata) -> Result<()>;

    fn load_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<CheckpointMetadata>;

    fn load_task_state(&self, checkpoint_id: CheckpointId, task_id: TaskId) -> Result<Vec<u8>>;

    /// Ids of completed checkpoints, ascending.
    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>>;

    /// Drop whatever was written for a checkpoint that did not complete.
    fn discard(&self, checkpoint_id: CheckpointId) -> Result<()>;

    /// Keep only the newest `keep_last_n` completed checkpoints.
    fn purge(&self, keep_last_n: usize) -> Result<()>;

    fn load_completed(&self, checkpoint_id: CheckpointId) -> Result<CompletedCheckpoint> {
        let metadata = self.load_checkpoint(checkpoint_id)?;
        let mut task_states = HashMap::with_capacity(metadata.task_ids.len());
        for task_id in &metadata.task_ids {
            task_states.insert(*task_id, self.load_task_state(checkpoint_id, *task_id)?);
        }
        Ok(CompletedCheckpoint {
            metadata,
            task_states,
        })
    }

    /// Load the newest readable completed checkpoint with all of its task
    /// states. Unreadable ones are skipped; when every one fails the error
    /// of the newest is returned.
    fn latest_completed(&self) -> Result<Option<CompletedCheckpoint>> {
        let mut newest_error: Option<anyhow::Error> = None;
        for checkpoint_id in self.list_checkpoints()?.into_iter().rev() {
            match self.load_completed(checkpoint_id) {
                Ok(checkpoint) => {
                    if newest_error.is_some() {
                        tracing::warn!(
                            checkpoint_id,
                            "restoring from an older checkpoint; output after it may be written again"
                        );
                    }
                    return Ok(Some(checkpoint));
                }
                Err(err) => {
                    tracing::warn!(checkpoint_id, "checkpoint unreadable: {err:#}");
                    newest_error.get_or_insert(err);
                }
            }
        }
        match newest_error {
            Some(err) => Err(err.context("no completed checkpoint could be read")),
            None => Ok(None),
        }
    }
}

/// Build the state backend chosen by the configuration.
///
/// Performs no I/O; directory creation happens in
/// [`StateBackend::initialize`] when the job starts.
pub fn select(config: &JobConfiguration) -> Result<Arc<dyn StateBackend>, PipelineError> {
    match &config.state_backend {
        StateBackendChoice::Memory { .. } => {
            let capacity = config
                .state_backend
                .memory_capacity_bytes()
                .unwrap_or_default();
            tracing::info!(capacity_bytes = capacity, "using memory state backend");
            Ok(Arc::new(MemoryStateBackend::new(capacity)))
        }
        StateBackendChoice::Durable { checkpoint_dir } => {
            let backend = DurableStateBackend::new(checkpoint_dir.clone()).map_err(|source| {
                PipelineError::BackendConstruction {
                    backend: "durable",
                    source,
                }
            })?;
            tracing::info!(dir = %checkpoint_dir.display(), "using durable state backend");
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;

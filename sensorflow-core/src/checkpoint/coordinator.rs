use super::*;

/// Pending checkpoint tracked by the coordinator.
#[derive(Debug)]
pub struct PendingCheckpoint {
    pub checkpoint_id: CheckpointId,
    pub timestamp: EventTime,
    pub triggered_at: Instant,
    pub expected_tasks: HashSet<TaskId>,
    pub acknowledged_tasks: HashSet<TaskId>,
    pub task_states: HashMap<TaskId, Vec<u8>>,
}

/// Checkpoint coordinator for a single job.
///
/// Owns checkpoint id allocation, collects task acknowledgements and persists
/// completed checkpoints to the job's [`StateBackend`]. A checkpoint that
/// fails at any step leaves previously completed checkpoints untouched.
pub struct CheckpointCoordinator {
    next_checkpoint_id: AtomicU64,
    pending_checkpoints: Mutex<HashMap<CheckpointId, PendingCheckpoint>>,
    completed_checkpoints: Mutex<VecDeque<CheckpointMetadata>>,
    /// Aborted ids above the latest completed one.
    aborted_checkpoints: Mutex<HashSet<CheckpointId>>,
    /// 0 until a checkpoint completes or is restored.
    latest_completed: AtomicU64,
    state_backend: Arc<dyn StateBackend>,
    retained_checkpoints: usize,
    tolerable_failures: u32,
    consecutive_failures: AtomicU32,
}

impl CheckpointCoordinator {
    pub fn new(state_backend: Arc<dyn StateBackend>) -> Self {
        Self {
            next_checkpoint_id: AtomicU64::new(1),
            pending_checkpoints: Mutex::new(HashMap::new()),
            completed_checkpoints: Mutex::new(VecDeque::new()),
            aborted_checkpoints: Mutex::new(HashSet::new()),
            latest_completed: AtomicU64::new(0),
            state_backend,
            retained_checkpoints: 3,
            tolerable_failures: 3,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn with_retained_checkpoints(mut self, retained_checkpoints: usize) -> Self {
        self.retained_checkpoints = retained_checkpoints.max(1);
        self
    }

    pub fn with_tolerable_failures(mut self, tolerable_failures: u32) -> Self {
        self.tolerable_failures = tolerable_failures;
        self
    }

    pub fn state_backend(&self) -> &Arc<dyn StateBackend> {
        &self.state_backend
    }

    /// Load the latest completed checkpoint, if any, and continue id
    /// allocation after it.
    pub fn restore_latest(&self) -> Result<Option<CompletedCheckpoint>> {
        let Some(latest) = self.state_backend.latest_completed()? else {
            return Ok(None);
        };
        let checkpoint_id = latest.checkpoint_id();
        self.next_checkpoint_id
            .fetch_max(checkpoint_id + 1, Ordering::SeqCst);
        self.latest_completed
            .fetch_max(checkpoint_id, Ordering::SeqCst);
        self.completed_checkpoints
            .lock()
            .map_err(|_| anyhow!("completed_checkpoints lock poisoned"))?
            .push_back(latest.metadata.clone());
        Ok(Some(latest))
    }

    pub fn trigger_checkpoint(
        &self,
        timestamp: EventTime,
        expected_tasks: Vec<TaskId>,
    ) -> Result<Barrier> {
        if expected_tasks.is_empty() {
            return Err(anyhow!("expected_tasks must not be empty"));
        }

        let checkpoint_id = self.next_checkpoint_id.fetch_add(1, Ordering::SeqCst);
        let pending = PendingCheckpoint {
            checkpoint_id,
            timestamp,
            triggered_at: Instant::now(),
            expected_tasks: expected_tasks.into_iter().collect(),
            acknowledged_tasks: HashSet::new(),
            task_states: HashMap::new(),
        };

        self.pending_checkpoints
            .lock()
            .map_err(|_| anyhow!("pending_checkpoints lock poisoned"))?
            .insert(checkpoint_id, pending);

        Ok(Barrier::with_timestamp(checkpoint_id, timestamp))
    }

    /// Number of triggered checkpoints still waiting for acknowledgements.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self
            .pending_checkpoints
            .lock()
            .map_err(|_| anyhow!("pending_checkpoints lock poisoned"))?
            .len())
    }

    /// Record a task acknowledgement. Returns `true` when this ack completed
    /// the checkpoint and it was persisted.
    ///
    /// A persistence failure is returned as
    /// [`PipelineError::CheckpointFailure`]; the partially written checkpoint
    /// is discarded and late acks for it are ignored.
    pub fn acknowledge_checkpoint(&self, ack: TaskCheckpointAck) -> Result<bool> {
        if self
            .aborted_checkpoints
            .lock()
            .map_err(|_| anyhow!("aborted_checkpoints lock poisoned"))?
            .contains(&ack.checkpoint_id)
        {
            // Ignore late acks for aborted checkpoints.
            return Ok(false);
        }

        let mut pending_guard = self
            .pending_checkpoints
            .lock()
            .map_err(|_| anyhow!("pending_checkpoints lock poisoned"))?;

        let Some(pending) = pending_guard.get_mut(&ack.checkpoint_id) else {
            if ack.checkpoint_id <= self.latest_completed.load(Ordering::SeqCst) {
                // Subsumed by a completed checkpoint.
                return Ok(false);
            }
            return Err(anyhow!("checkpoint {} is not pending", ack.checkpoint_id));
        };

        if !pending.expected_tasks.contains(&ack.task_id) {
            return Err(anyhow!(
                "task {} is not expected for checkpoint {}",
                ack.task_id,
                ack.checkpoint_id
            ));
        }
        if pending.acknowledged_tasks.contains(&ack.task_id) {
            return Err(anyhow!(
                "duplicate ack from task {} for checkpoint {}",
                ack.task_id,
                ack.checkpoint_id
            ));
        }

        pending.acknowledged_tasks.insert(ack.task_id);
        pending.task_states.insert(ack.task_id, ack.state);

        if pending.acknowledged_tasks.len() != pending.expected_tasks.len() {
            return Ok(false);
        }

        let finished = pending_guard
            .remove(&ack.checkpoint_id)
            .ok_or_else(|| anyhow!("checkpoint {} disappeared", ack.checkpoint_id))?;
        drop(pending_guard);

        let checkpoint_id = finished.checkpoint_id;
        if let Err(err) = self.finalize_checkpoint(finished) {
            self.mark_aborted(checkpoint_id)?;
            if let Err(discard_err) = self.state_backend.discard(checkpoint_id) {
                tracing::warn!(
                    checkpoint_id,
                    "failed to discard partial checkpoint: {discard_err:#}"
                );
            }
            return Err(PipelineError::CheckpointFailure {
                checkpoint_id,
                reason: format!("{err:#}"),
            }
            .into());
        }
        Ok(true)
    }

    pub fn abort_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        task_id: TaskId,
        reason: &str,
    ) -> Result<bool> {
        let removed = {
            let mut pending_guard = self
                .pending_checkpoints
                .lock()
                .map_err(|_| anyhow!("pending_checkpoints lock poisoned"))?;
            if let Some(pending) = pending_guard.get(&checkpoint_id) {
                if !pending.expected_tasks.contains(&task_id) {
                    return Err(anyhow!(
                        "task {} is not expected for checkpoint {}",
                        task_id,
                        checkpoint_id
                    ));
                }
            } else {
                return Ok(false);
            }
            pending_guard.remove(&checkpoint_id).is_some()
        };

        if removed {
            tracing::warn!(checkpoint_id, %task_id, reason, "checkpoint aborted");
            self.mark_aborted(checkpoint_id)?;
        }
        Ok(removed)
    }

    /// Abort every pending checkpoint older than `timeout`.
    pub fn abort_expired(&self, timeout: Duration) -> Result<Vec<CheckpointId>> {
        let expired: Vec<CheckpointId> = {
            let mut pending_guard = self
                .pending_checkpoints
                .lock()
                .map_err(|_| anyhow!("pending_checkpoints lock poisoned"))?;
            let expired: Vec<CheckpointId> = pending_guard
                .values()
                .filter(|p| p.triggered_at.elapsed() >= timeout)
                .map(|p| p.checkpoint_id)
                .collect();
            for checkpoint_id in &expired {
                pending_guard.remove(checkpoint_id);
            }
            expired
        };
        for checkpoint_id in &expired {
            self.mark_aborted(*checkpoint_id)?;
        }
        Ok(expired)
    }

    /// Reset the failure streak after a completed checkpoint.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Count a failed checkpoint. Fails once the streak exceeds the
    /// tolerated number of consecutive failures.
    pub fn record_failure(&self, checkpoint_id: CheckpointId, reason: &str) -> Result<(), PipelineError> {
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(
            checkpoint_id,
            consecutive,
            tolerable = self.tolerable_failures,
            "checkpoint failed: {reason}"
        );
        if consecutive > self.tolerable_failures {
            return Err(PipelineError::TooManyCheckpointFailures {
                consecutive,
                tolerable: self.tolerable_failures,
                last_reason: reason.to_string(),
            });
        }
        Ok(())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn completed_checkpoint_ids(&self) -> Result<Vec<CheckpointId>> {
        let guard = self
            .completed_checkpoints
            .lock()
            .map_err(|_| anyhow!("completed_checkpoints lock poisoned"))?;
        Ok(guard.iter().map(|m| m.checkpoint_id).collect())
    }

    pub fn latest_completed_id(&self) -> Result<Option<CheckpointId>> {
        Ok(self.completed_checkpoint_ids()?.into_iter().max())
    }

    pub fn aborted_checkpoint_ids(&self) -> Result<Vec<CheckpointId>> {
        let mut ids: Vec<_> = self
            .aborted_checkpoints
            .lock()
            .map_err(|_| anyhow!("aborted_checkpoints lock poisoned"))?
            .iter()
            .copied()
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn mark_aborted(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.aborted_checkpoints
            .lock()
            .map_err(|_| anyhow!("aborted_checkpoints lock poisoned"))?
            .insert(checkpoint_id);
        Ok(())
    }

    fn finalize_checkpoint(&self, pending: PendingCheckpoint) -> Result<()> {
        let mut task_ids: Vec<TaskId> = pending.expected_tasks.iter().copied().collect();
        task_ids.sort_by_key(|t| (t.vertex_id.0, t.subtask_index));

        let metadata = CheckpointMetadata {
            checkpoint_id: pending.checkpoint_id,
            timestamp: pending.timestamp,
            task_ids,
        };

        for (task_id, state) in pending.task_states {
            self.state_backend
                .save_task_state(metadata.checkpoint_id, task_id, state)?;
        }
        self.state_backend.save_checkpoint(metadata.clone())?;
        if let Err(err) = self.state_backend.purge(self.retained_checkpoints) {
            // The new checkpoint is already durable; stale ones are retried next time.
            tracing::warn!(
                checkpoint_id = metadata.checkpoint_id,
                "failed to purge old checkpoints: {err:#}"
            );
        }

        let mut completed_guard = self
            .completed_checkpoints
            .lock()
            .map_err(|_| anyhow!("completed_checkpoints lock poisoned"))?;
        let checkpoint_id = metadata.checkpoint_id;
        completed_guard.push_back(metadata);
        while completed_guard.len() > self.retained_checkpoints {
            completed_guard.pop_front();
        }
        drop(completed_guard);

        self.latest_completed
            .fetch_max(checkpoint_id, Ordering::SeqCst);
        self.aborted_checkpoints
            .lock()
            .map_err(|_| anyhow!("aborted_checkpoints lock poisoned"))?
            .retain(|aborted| *aborted > checkpoint_id);
        Ok(())
    }
}

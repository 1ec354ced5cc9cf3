use super::*;

/// In-process state backend bounded by a byte capacity.
///
/// A checkpoint whose task states together exceed the capacity fails; the
/// previously completed checkpoints stay available.
pub struct MemoryStateBackend {
    max_state_size: usize,
    metadata: Mutex<HashMap<CheckpointId, CheckpointMetadata>>,
    task_states: Mutex<HashMap<(CheckpointId, TaskId), Vec<u8>>>,
}

impl MemoryStateBackend {
    pub fn new(max_state_size: usize) -> Self {
        Self {
            max_state_size,
            metadata: Mutex::new(HashMap::new()),
            task_states: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_state_size(&self) -> usize {
        self.max_state_size
    }
}

impl StateBackend for MemoryStateBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn async_snapshots(&self) -> bool {
        true
    }

    fn incremental_snapshots(&self) -> bool {
        false
    }

    fn save_task_state(
        &self,
        checkpoint_id: CheckpointId,
        task_id: TaskId,
        state: Vec<u8>,
    ) -> Result<()> {
        let mut guard = self
            .task_states
            .lock()
            .map_err(|_| anyhow!("checkpoint task-state lock poisoned"))?;
        let checkpoint_size: usize = guard
            .iter()
            .filter(|((id, task), _)| *id == checkpoint_id && *task != task_id)
            .map(|(_, bytes)| bytes.len())
            .sum();
        let total = checkpoint_size + state.len();
        if total > self.max_state_size {
            return Err(anyhow!(
                "checkpoint {} state size {} bytes exceeds memory backend capacity of {} bytes",
                checkpoint_id,
                total,
                self.max_state_size
            ));
        }
        guard.insert((checkpoint_id, task_id), state);
        Ok(())
    }

    fn save_checkpoint(&self, metadata: CheckpointMetadata) -> Result<()> {
        self.metadata
            .lock()
            .map_err(|_| anyhow!("checkpoint metadata lock poisoned"))?
            .insert(metadata.checkpoint_id, metadata);
        Ok(())
    }

    fn load_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<CheckpointMetadata> {
        self.metadata
            .lock()
            .map_err(|_| anyhow!("checkpoint metadata lock poisoned"))?
            .get(&checkpoint_id)
            .cloned()
            .ok_or_else(|| anyhow!("checkpoint {} not found", checkpoint_id))
    }

    fn load_task_state(&self, checkpoint_id: CheckpointId, task_id: TaskId) -> Result<Vec<u8>> {
        self.task_states
            .lock()
            .map_err(|_| anyhow!("checkpoint task-state lock poisoned"))?
            .get(&(checkpoint_id, task_id))
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "task state for {} not found in checkpoint {}",
                    task_id,
                    checkpoint_id
                )
            })
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        let mut ids: Vec<_> = self
            .metadata
            .lock()
            .map_err(|_| anyhow!("checkpoint metadata lock poisoned"))?
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn discard(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.metadata
            .lock()
            .map_err(|_| anyhow!("checkpoint metadata lock poisoned"))?
            .remove(&checkpoint_id);
        self.task_states
            .lock()
            .map_err(|_| anyhow!("checkpoint task-state lock poisoned"))?
            .retain(|(id, _), _| *id != checkpoint_id);
        Ok(())
    }

    fn purge(&self, keep_last_n: usize) -> Result<()> {
        let mut ids = self.list_checkpoints()?;
        if ids.len() <= keep_last_n {
            return Ok(());
        }
        let purge_count = ids.len() - keep_last_n;
        ids.truncate(purge_count);

        let mut meta_guard = self
            .metadata
            .lock()
            .map_err(|_| anyhow!("checkpoint metadata lock poisoned"))?;
        let mut state_guard = self
            .task_states
            .lock()
            .map_err(|_| anyhow!("checkpoint task-state lock poisoned"))?;

        for checkpoint_id in ids {
            meta_guard.remove(&checkpoint_id);
            state_guard.retain(|(id, _), _| *id != checkpoint_id);
        }
        Ok(())
    }
}

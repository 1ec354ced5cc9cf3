use super::*;

/// Persisted checkpoint metadata. Written last, so its presence marks the
/// checkpoint as complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointMetadata {
    pub checkpoint_id: CheckpointId,
    pub timestamp: EventTime,
    pub task_ids: Vec<TaskId>,
}

/// A completed checkpoint loaded back from the state backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCheckpoint {
    pub metadata: CheckpointMetadata,
    pub task_states: HashMap<TaskId, Vec<u8>>,
}

impl CompletedCheckpoint {
    pub fn checkpoint_id(&self) -> CheckpointId {
        self.metadata.checkpoint_id
    }

    /// State bytes of one task. Every task listed in the metadata has an entry.
    pub fn task_state(&self, task_id: TaskId) -> Result<&[u8]> {
        self.task_states
            .get(&task_id)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                anyhow!(
                    "checkpoint {} has no state for task {}",
                    self.metadata.checkpoint_id,
                    task_id
                )
            })
    }
}

use super::*;
use ahash::RandomState;
use std::fs::File;
use std::io::Write;

const SHARED_DIR: &str = "shared";
const METADATA_FILE: &str = "metadata.bin";
const CHECKPOINT_PREFIX: &str = "chk-";

// Fixed seeds keep blob names stable across process restarts.
const BLOB_HASH_SEEDS: (u64, u64, u64, u64) = (
    0x5345_4e53_4f52_464c,
    0x4f57_5f42_4c4f_4253,
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
);

/// File-system state backend.
///
/// Layout under the base directory:
///
/// ```text
/// chk-<id>/metadata.bin        completion marker, written last
/// chk-<id>/task-<task>.ref     relative path of the task's state blob
/// shared/<hash>-<len>.bin      content-addressed task state (incremental)
/// chk-<id>/task-<task>.bin     task state when incremental mode is off
/// ```
///
/// With incremental snapshots a task whose state did not change since an
/// earlier retained checkpoint writes only a new `.ref` file. Blobs no
/// longer referenced are removed by [`purge`](StateBackend::purge).
pub struct DurableStateBackend {
    base_path: PathBuf,
    incremental: bool,
    hasher: RandomState,
}

impl DurableStateBackend {
    /// Create a backend rooted at `base_path`. No I/O happens until
    /// [`initialize`](StateBackend::initialize).
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        if base_path.as_os_str().is_empty() {
            return Err(anyhow!("checkpoint directory must not be empty"));
        }
        let (k0, k1, k2, k3) = BLOB_HASH_SEEDS;
        Ok(Self {
            base_path,
            incremental: true,
            hasher: RandomState::with_seeds(k0, k1, k2, k3),
        })
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn checkpoint_dir(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.base_path
            .join(format!("{CHECKPOINT_PREFIX}{checkpoint_id}"))
    }

    fn metadata_path(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.checkpoint_dir(checkpoint_id).join(METADATA_FILE)
    }

    fn task_ref_path(&self, checkpoint_id: CheckpointId, task_id: TaskId) -> PathBuf {
        self.checkpoint_dir(checkpoint_id)
            .join(format!("task-{task_id}.ref"))
    }

    fn shared_dir(&self) -> PathBuf {
        self.base_path.join(SHARED_DIR)
    }

    /// Every `chk-<id>` directory, complete or not.
    fn checkpoint_dirs(&self) -> Result<Vec<(CheckpointId, PathBuf)>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.base_path)
            .with_context(|| format!("read_dir failed for {}", self.base_path.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id_part) = name.strip_prefix(CHECKPOINT_PREFIX) {
                if let Ok(id) = id_part.parse::<CheckpointId>() {
                    dirs.push((id, entry.path()));
                }
            }
        }
        dirs.sort_unstable_by_key(|(id, _)| *id);
        Ok(dirs)
    }

    /// Store `state` as a shared blob, reusing an identical existing one.
    /// Returns the blob path relative to the base directory.
    fn store_shared_blob(&self, checkpoint_id: CheckpointId, state: &[u8]) -> Result<String> {
        let hash = self.hasher.hash_one(state);
        let mut name = format!("{hash:016x}-{}.bin", state.len());
        let mut path = self.shared_dir().join(&name);

        if path.exists() {
            let existing = fs::read(&path)
                .with_context(|| format!("failed to read shared blob {}", path.display()))?;
            if existing == state {
                return Ok(format!("{SHARED_DIR}/{name}"));
            }
            // Hash collision with different content.
            name = format!("{hash:016x}-{}-{CHECKPOINT_PREFIX}{checkpoint_id}.bin", state.len());
            path = self.shared_dir().join(&name);
        }

        write_atomically(&path, state)?;
        Ok(format!("{SHARED_DIR}/{name}"))
    }

    fn referenced_blobs(&self) -> Result<HashSet<String>> {
        let mut referenced = HashSet::new();
        for (_, dir) in self.checkpoint_dirs()? {
            for entry in fs::read_dir(&dir)
                .with_context(|| format!("read_dir failed for {}", dir.display()))?
            {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "ref") {
                    let target = fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    referenced.insert(target.trim().to_string());
                }
            }
        }
        Ok(referenced)
    }

    fn collect_unreferenced_blobs(&self) -> Result<usize> {
        let shared = self.shared_dir();
        if !shared.exists() {
            return Ok(0);
        }
        let referenced = self.referenced_blobs()?;
        let mut removed = 0;
        for entry in fs::read_dir(&shared)
            .with_context(|| format!("read_dir failed for {}", shared.display()))?
        {
            let entry = entry?;
            let relative = format!("{SHARED_DIR}/{}", entry.file_name().to_string_lossy());
            if !referenced.contains(&relative) {
                fs::remove_file(entry.path()).with_context(|| {
                    format!("failed to remove shared blob {}", entry.path().display())
                })?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl StateBackend for DurableStateBackend {
    fn name(&self) -> &'static str {
        "durable"
    }

    /// Create the directory tree and drop checkpoints that never completed.
    fn initialize(&self) -> Result<()> {
        fs::create_dir_all(self.shared_dir()).with_context(|| {
            format!(
                "failed to create checkpoint storage directory {}",
                self.base_path.display()
            )
        })?;
        for (checkpoint_id, dir) in self.checkpoint_dirs()? {
            if !dir.join(METADATA_FILE).exists() {
                tracing::info!(checkpoint_id, "removing incomplete checkpoint");
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to remove {}", dir.display()))?;
            }
        }
        Ok(())
    }

    fn async_snapshots(&self) -> bool {
        true
    }

    fn incremental_snapshots(&self) -> bool {
        self.incremental
    }

    fn save_task_state(
        &self,
        checkpoint_id: CheckpointId,
        task_id: TaskId,
        state: Vec<u8>,
    ) -> Result<()> {
        let checkpoint_dir = self.checkpoint_dir(checkpoint_id);
        fs::create_dir_all(&checkpoint_dir).with_context(|| {
            format!(
                "failed to create checkpoint dir {}",
                checkpoint_dir.display()
            )
        })?;

        let target = if self.incremental {
            self.store_shared_blob(checkpoint_id, &state)?
        } else {
            let name = format!("task-{task_id}.bin");
            write_atomically(&checkpoint_dir.join(&name), &state)?;
            format!("{CHECKPOINT_PREFIX}{checkpoint_id}/{name}")
        };
        write_atomically(
            &self.task_ref_path(checkpoint_id, task_id),
            target.as_bytes(),
        )
        .context("write checkpoint task state reference failed")
    }

    fn save_checkpoint(&self, metadata: CheckpointMetadata) -> Result<()> {
        let checkpoint_dir = self.checkpoint_dir(metadata.checkpoint_id);
        fs::create_dir_all(&checkpoint_dir).with_context(|| {
            format!(
                "failed to create checkpoint dir {}",
                checkpoint_dir.display()
            )
        })?;
        let bytes =
            bincode::serialize(&metadata).context("serialize checkpoint metadata failed")?;
        write_atomically(&self.metadata_path(metadata.checkpoint_id), &bytes)
            .context("write checkpoint metadata failed")?;
        // The chk-<id> entry itself must survive a crash too.
        sync_dir(&self.base_path)
    }

    fn load_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<CheckpointMetadata> {
        let bytes = fs::read(self.metadata_path(checkpoint_id))
            .with_context(|| format!("read metadata of checkpoint {checkpoint_id} failed"))?;
        bincode::deserialize(&bytes).context("deserialize checkpoint metadata failed")
    }

    fn load_task_state(&self, checkpoint_id: CheckpointId, task_id: TaskId) -> Result<Vec<u8>> {
        let target = fs::read_to_string(self.task_ref_path(checkpoint_id, task_id))
            .with_context(|| {
                format!("read state reference of {task_id} in checkpoint {checkpoint_id} failed")
            })?;
        let blob = self.base_path.join(target.trim());
        fs::read(&blob).with_context(|| format!("read state blob {} failed", blob.display()))
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }
        Ok(self
            .checkpoint_dirs()?
            .into_iter()
            .filter(|(_, dir)| dir.join(METADATA_FILE).exists())
            .map(|(id, _)| id)
            .collect())
    }

    fn discard(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let dir = self.checkpoint_dir(checkpoint_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.display()))?;
        }
        Ok(())
    }

    fn purge(&self, keep_last_n: usize) -> Result<()> {
        let ids = self.list_checkpoints()?;
        if ids.len() > keep_last_n {
            let purge_count = ids.len() - keep_last_n;
            for checkpoint_id in ids.into_iter().take(purge_count) {
                self.discard(checkpoint_id)?;
            }
        }
        if self.incremental {
            let removed = self.collect_unreferenced_blobs()?;
            if removed > 0 {
                tracing::debug!(removed, "removed unreferenced state blobs");
            }
        }
        Ok(())
    }
}

/// Write `bytes` to a temp file, fsync it, rename it over `path` and fsync
/// the parent directory, so a rename that reached disk never points at
/// unwritten data.
pub(super) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file =
        File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    drop(file);
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    match path.parent() {
        Some(parent) => sync_dir(parent),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .with_context(|| format!("failed to sync directory {}", dir.display()))
}

// Directories cannot be opened as files here; renames are durable once the
// call returns.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

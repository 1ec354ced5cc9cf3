use super::*;
use crate::config::{CheckpointPolicy, JobConfiguration, StateBackendChoice};
use crate::runtime::VertexId;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "sensorflow-{prefix}-{}-{nanos}",
        std::process::id()
    ))
}

fn meta(checkpoint_id: CheckpointId, task_ids: Vec<TaskId>) -> CheckpointMetadata {
    CheckpointMetadata {
        checkpoint_id,
        timestamp: checkpoint_id as i64 * 10,
        task_ids,
    }
}

fn config_with(state_backend: StateBackendChoice) -> JobConfiguration {
    JobConfiguration {
        job_name: "test".to_string(),
        bootstrap_server: "memory://test".to_string(),
        input_topic: "in".to_string(),
        output_topic: "out".to_string(),
        state_backend,
        checkpoint_policy: CheckpointPolicy::every_minutes(10).unwrap(),
    }
}

#[test]
fn test_memory_backend_roundtrip() {
    let backend = MemoryStateBackend::new(1024);
    let t0 = TaskId::new(VertexId::new(1), 0);

    backend.save_task_state(7, t0, vec![1, 2, 3]).unwrap();
    assert!(backend.list_checkpoints().unwrap().is_empty());

    backend.save_checkpoint(meta(7, vec![t0])).unwrap();
    assert_eq!(backend.load_checkpoint(7).unwrap(), meta(7, vec![t0]));
    assert_eq!(backend.load_task_state(7, t0).unwrap(), vec![1, 2, 3]);
    assert_eq!(backend.list_checkpoints().unwrap(), vec![7]);
}

#[test]
fn test_memory_backend_rejects_state_over_capacity() {
    let backend = MemoryStateBackend::new(8);
    let t0 = TaskId::new(VertexId::new(1), 0);
    let t1 = TaskId::new(VertexId::new(2), 0);

    backend.save_task_state(1, t0, vec![0; 5]).unwrap();
    let err = backend.save_task_state(1, t1, vec![0; 4]).unwrap_err();
    assert!(
        err.to_string().contains("exceeds memory backend capacity"),
        "unexpected error: {err}"
    );

    // Rewriting the same task replaces its share instead of adding to it.
    backend.save_task_state(1, t0, vec![0; 8]).unwrap();
}

#[test]
fn test_memory_backend_capacity_is_per_checkpoint() {
    let backend = MemoryStateBackend::new(4);
    let t0 = TaskId::new(VertexId::new(1), 0);
    for id in 1..=3 {
        backend.save_task_state(id, t0, vec![0; 4]).unwrap();
        backend.save_checkpoint(meta(id, vec![t0])).unwrap();
    }
    assert_eq!(backend.list_checkpoints().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_memory_backend_purge_keeps_latest_n() {
    let backend = MemoryStateBackend::new(1024);
    let t0 = TaskId::new(VertexId::new(1), 0);
    for id in 1..=4 {
        backend.save_task_state(id, t0, vec![id as u8]).unwrap();
        backend.save_checkpoint(meta(id, vec![t0])).unwrap();
    }

    backend.purge(2).unwrap();
    assert_eq!(backend.list_checkpoints().unwrap(), vec![3, 4]);
    assert!(backend.load_task_state(1, t0).is_err());
    assert_eq!(backend.load_task_state(4, t0).unwrap(), vec![4]);
}

#[test]
fn test_memory_backend_discard_drops_partial_checkpoint() {
    let backend = MemoryStateBackend::new(1024);
    let t0 = TaskId::new(VertexId::new(1), 0);
    backend.save_task_state(5, t0, vec![1]).unwrap();
    backend.discard(5).unwrap();
    assert!(backend.load_task_state(5, t0).is_err());
}

#[test]
fn test_latest_completed_loads_all_task_states() {
    let backend = MemoryStateBackend::new(1024);
    let t0 = TaskId::new(VertexId::new(1), 0);
    let t1 = TaskId::new(VertexId::new(2), 0);
    assert!(backend.latest_completed().unwrap().is_none());

    for id in [2, 3] {
        backend.save_task_state(id, t0, vec![id as u8, 0]).unwrap();
        backend.save_task_state(id, t1, vec![id as u8, 1]).unwrap();
        backend.save_checkpoint(meta(id, vec![t0, t1])).unwrap();
    }
    // Checkpoint 4 never got its metadata.
    backend.save_task_state(4, t0, vec![4, 0]).unwrap();

    let latest = backend.latest_completed().unwrap().unwrap();
    assert_eq!(latest.checkpoint_id(), 3);
    assert_eq!(latest.task_state(t0).unwrap(), &[3, 0]);
    assert_eq!(latest.task_state(t1).unwrap(), &[3, 1]);
}

#[test]
fn test_durable_backend_roundtrip() {
    let path = unique_temp_dir("durable-roundtrip");
    let backend = DurableStateBackend::new(&path).unwrap();
    backend.initialize().unwrap();

    let t0 = TaskId::new(VertexId::new(2), 0);
    backend.save_task_state(9, t0, vec![9, 8, 7]).unwrap();
    backend.save_checkpoint(meta(9, vec![t0])).unwrap();

    assert_eq!(backend.load_checkpoint(9).unwrap(), meta(9, vec![t0]));
    assert_eq!(backend.load_task_state(9, t0).unwrap(), vec![9, 8, 7]);
    assert_eq!(backend.list_checkpoints().unwrap(), vec![9]);
    assert!(path.join("chk-9").join("metadata.bin").exists());

    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_durable_backend_construction_does_no_io() {
    let path = unique_temp_dir("durable-lazy");
    let backend = DurableStateBackend::new(&path).unwrap();
    assert!(!path.exists());
    assert!(backend.list_checkpoints().unwrap().is_empty());

    backend.initialize().unwrap();
    assert!(path.join("shared").is_dir());
    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_durable_backend_rejects_empty_path() {
    assert!(DurableStateBackend::new(PathBuf::new()).is_err());
}

#[test]
fn test_durable_backend_initialize_fails_on_unwritable_location() {
    let path = unique_temp_dir("durable-blocked");
    fs::write(&path, b"not a directory").unwrap();

    let backend = DurableStateBackend::new(path.join("checkpoints")).unwrap();
    let err = backend.initialize().unwrap_err();
    assert!(
        format!("{err:#}").contains("failed to create checkpoint storage directory"),
        "unexpected error: {err:#}"
    );
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_durable_backend_ignores_checkpoint_without_metadata() {
    let path = unique_temp_dir("durable-incomplete");
    let backend = DurableStateBackend::new(&path).unwrap();
    backend.initialize().unwrap();
    let t0 = TaskId::new(VertexId::new(1), 0);

    backend.save_task_state(1, t0, vec![1]).unwrap();
    backend.save_checkpoint(meta(1, vec![t0])).unwrap();
    backend.save_task_state(2, t0, vec![2]).unwrap();

    assert_eq!(backend.list_checkpoints().unwrap(), vec![1]);
    assert_eq!(backend.latest_completed().unwrap().unwrap().checkpoint_id(), 1);

    // A restart sweeps the unfinished checkpoint away.
    let reopened = DurableStateBackend::new(&path).unwrap();
    reopened.initialize().unwrap();
    assert!(!path.join("chk-2").exists());
    assert_eq!(reopened.load_task_state(1, t0).unwrap(), vec![1]);

    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_durable_backend_shares_unchanged_state() {
    let path = unique_temp_dir("durable-incremental");
    let backend = DurableStateBackend::new(&path).unwrap();
    backend.initialize().unwrap();
    assert!(backend.incremental_snapshots());

    let t0 = TaskId::new(VertexId::new(1), 0);
    let t1 = TaskId::new(VertexId::new(2), 0);
    for id in 1..=3 {
        backend.save_task_state(id, t0, vec![42; 16]).unwrap();
        backend.save_task_state(id, t1, vec![id as u8; 16]).unwrap();
        backend.save_checkpoint(meta(id, vec![t0, t1])).unwrap();
    }

    // One blob for the unchanged task, one per checkpoint for the other.
    let blobs = fs::read_dir(path.join("shared")).unwrap().count();
    assert_eq!(blobs, 4);
    assert_eq!(backend.load_task_state(3, t0).unwrap(), vec![42; 16]);
    assert_eq!(backend.load_task_state(2, t1).unwrap(), vec![2; 16]);

    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_durable_backend_purge_collects_unreferenced_blobs() {
    let path = unique_temp_dir("durable-purge");
    let backend = DurableStateBackend::new(&path).unwrap();
    backend.initialize().unwrap();

    let t0 = TaskId::new(VertexId::new(1), 0);
    for id in 1..=4 {
        backend.save_task_state(id, t0, vec![id as u8; 8]).unwrap();
        backend.save_checkpoint(meta(id, vec![t0])).unwrap();
    }

    backend.purge(2).unwrap();
    assert_eq!(backend.list_checkpoints().unwrap(), vec![3, 4]);
    assert!(!path.join("chk-1").exists());
    assert_eq!(fs::read_dir(path.join("shared")).unwrap().count(), 2);
    assert_eq!(backend.load_task_state(3, t0).unwrap(), vec![3; 8]);

    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_durable_backend_full_snapshots() {
    let path = unique_temp_dir("durable-full");
    let backend = DurableStateBackend::new(&path)
        .unwrap()
        .with_incremental(false);
    backend.initialize().unwrap();
    assert!(!backend.incremental_snapshots());

    let t0 = TaskId::new(VertexId::new(1), 0);
    backend.save_task_state(1, t0, vec![5, 5]).unwrap();
    backend.save_checkpoint(meta(1, vec![t0])).unwrap();

    assert_eq!(fs::read_dir(path.join("shared")).unwrap().count(), 0);
    assert_eq!(backend.load_task_state(1, t0).unwrap(), vec![5, 5]);

    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_durable_backend_survives_reopen() {
    let path = unique_temp_dir("durable-reopen");
    let t0 = TaskId::new(VertexId::new(1), 0);
    {
        let backend = DurableStateBackend::new(&path).unwrap();
        backend.initialize().unwrap();
        backend.save_task_state(3, t0, vec![1, 2]).unwrap();
        backend.save_checkpoint(meta(3, vec![t0])).unwrap();
    }

    let reopened = DurableStateBackend::new(&path).unwrap();
    reopened.initialize().unwrap();
    let latest = reopened.latest_completed().unwrap().unwrap();
    assert_eq!(latest.checkpoint_id(), 3);
    assert_eq!(latest.task_state(t0).unwrap(), &[1, 2]);

    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_durable_writes_leave_no_temp_files() {
    let path = unique_temp_dir("durable-synced");
    let backend = DurableStateBackend::new(&path).unwrap();
    backend.initialize().unwrap();
    let t0 = TaskId::new(VertexId::new(1), 0);

    backend.save_task_state(1, t0, vec![3; 32]).unwrap();
    backend.save_checkpoint(meta(1, vec![t0])).unwrap();
    // Rewriting a file replaces it in place.
    backend.save_checkpoint(meta(1, vec![t0])).unwrap();

    for dir in [path.join("chk-1"), path.join("shared")] {
        for entry in fs::read_dir(&dir).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(
                !name.to_string_lossy().ends_with(".tmp"),
                "temp file left behind: {name:?}"
            );
        }
    }
    assert_eq!(backend.load_checkpoint(1).unwrap(), meta(1, vec![t0]));
    assert_eq!(backend.load_task_state(1, t0).unwrap(), vec![3; 32]);

    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_write_atomically_fails_without_parent_dir() {
    let path = unique_temp_dir("durable-no-parent");
    let err = durable::write_atomically(&path.join("metadata.bin"), b"x").unwrap_err();
    assert!(format!("{err:#}").contains("failed to create"), "{err:#}");
    assert!(!path.exists());
}

#[test]
fn test_restore_falls_back_past_unreadable_checkpoint() {
    let path = unique_temp_dir("durable-fallback");
    let backend = DurableStateBackend::new(&path).unwrap();
    backend.initialize().unwrap();
    let t0 = TaskId::new(VertexId::new(1), 0);
    for id in 1..=3 {
        backend.save_task_state(id, t0, vec![id as u8; 4]).unwrap();
        backend.save_checkpoint(meta(id, vec![t0])).unwrap();
    }
    fs::remove_file(path.join("chk-3").join(format!("task-{t0}.ref"))).unwrap();
    fs::write(path.join("chk-2").join("metadata.bin"), b"").unwrap();

    let latest = backend.latest_completed().unwrap().unwrap();
    assert_eq!(latest.checkpoint_id(), 1);
    assert_eq!(latest.task_state(t0).unwrap(), &[1; 4]);

    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_restore_fails_when_no_checkpoint_is_readable() {
    let backend = MemoryStateBackend::new(1024);
    let t0 = TaskId::new(VertexId::new(1), 0);
    let t1 = TaskId::new(VertexId::new(2), 0);
    // Metadata lists a task whose state was never saved.
    backend.save_task_state(1, t0, vec![1]).unwrap();
    backend.save_checkpoint(meta(1, vec![t0, t1])).unwrap();

    let err = backend.latest_completed().unwrap_err();
    assert!(
        format!("{err:#}").contains("no completed checkpoint could be read"),
        "{err:#}"
    );
}

#[test]
fn test_select_memory_backend_uses_configured_capacity() {
    let backend = select(&config_with(StateBackendChoice::Memory {
        max_state_size_mb: 1,
    }))
    .unwrap();
    assert_eq!(backend.name(), "memory");
    assert!(backend.async_snapshots());
    assert!(!backend.incremental_snapshots());

    let t0 = TaskId::new(VertexId::new(1), 0);
    backend.save_task_state(1, t0, vec![0; 1024 * 1024]).unwrap();
    assert!(backend.save_task_state(2, t0, vec![0; 1024 * 1024 + 1]).is_err());
}

#[test]
fn test_select_durable_backend_is_lazy() {
    let path = unique_temp_dir("select-durable");
    let backend = select(&config_with(StateBackendChoice::Durable {
        checkpoint_dir: path.clone(),
    }))
    .unwrap();
    assert_eq!(backend.name(), "durable");
    assert!(backend.async_snapshots());
    assert!(backend.incremental_snapshots());
    assert!(!path.exists());
}

#[test]
fn test_select_durable_backend_rejects_empty_dir() {
    let err = select(&config_with(StateBackendChoice::Durable {
        checkpoint_dir: PathBuf::new(),
    }))
    .err()
    .unwrap();
    assert!(matches!(
        err,
        PipelineError::BackendConstruction {
            backend: "durable",
            ..
        }
    ));
}

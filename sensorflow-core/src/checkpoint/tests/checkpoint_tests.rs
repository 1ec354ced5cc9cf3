use super::*;
use crate::runtime::VertexId;
use crate::state::MemoryStateBackend;

fn memory_backend() -> Arc<MemoryStateBackend> {
    Arc::new(MemoryStateBackend::new(1024 * 1024))
}

fn ack(checkpoint_id: CheckpointId, task_id: TaskId, state: Vec<u8>) -> TaskCheckpointAck {
    TaskCheckpointAck {
        checkpoint_id,
        task_id,
        state,
    }
}

#[test]
fn test_checkpoint_coordinator_trigger_ack_finalize() {
    let backend = memory_backend();
    let coordinator = CheckpointCoordinator::new(backend.clone());

    let t0 = TaskId::new(VertexId::new(1), 0);
    let t1 = TaskId::new(VertexId::new(2), 0);
    let barrier = coordinator.trigger_checkpoint(1234, vec![t0, t1]).unwrap();
    assert_eq!(barrier.checkpoint_id, 1);
    assert_eq!(barrier.timestamp, 1234);
    assert_eq!(coordinator.pending_count().unwrap(), 1);

    assert!(!coordinator.acknowledge_checkpoint(ack(1, t0, vec![1, 2])).unwrap());
    assert!(coordinator.acknowledge_checkpoint(ack(1, t1, vec![3, 4])).unwrap());

    assert_eq!(coordinator.pending_count().unwrap(), 0);
    assert_eq!(coordinator.completed_checkpoint_ids().unwrap(), vec![1]);
    let meta = backend.load_checkpoint(1).unwrap();
    assert_eq!(meta.timestamp, 1234);
    assert_eq!(meta.task_ids, vec![t0, t1]);
    assert_eq!(backend.load_task_state(1, t0).unwrap(), vec![1, 2]);
    assert_eq!(backend.load_task_state(1, t1).unwrap(), vec![3, 4]);
}

#[test]
fn test_checkpoint_coordinator_trigger_rejects_empty_expected_tasks() {
    let coordinator = CheckpointCoordinator::new(memory_backend());
    let err = coordinator.trigger_checkpoint(123, Vec::new()).unwrap_err();
    assert!(
        err.to_string().contains("expected_tasks"),
        "unexpected error: {err}"
    );
}

#[test]
fn test_checkpoint_coordinator_rejects_duplicate_ack() {
    let coordinator = CheckpointCoordinator::new(memory_backend());
    let t0 = TaskId::new(VertexId::new(1), 0);
    let t1 = TaskId::new(VertexId::new(2), 0);

    coordinator.trigger_checkpoint(10, vec![t0, t1]).unwrap();
    coordinator
        .acknowledge_checkpoint(ack(1, t0, vec![9]))
        .unwrap();

    let err = coordinator
        .acknowledge_checkpoint(ack(1, t0, vec![9]))
        .unwrap_err();
    assert!(
        err.to_string().contains("duplicate ack"),
        "unexpected error: {err}"
    );
}

#[test]
fn test_checkpoint_coordinator_rejects_unexpected_task() {
    let coordinator = CheckpointCoordinator::new(memory_backend());
    let t0 = TaskId::new(VertexId::new(1), 0);
    let stranger = TaskId::new(VertexId::new(9), 0);

    coordinator.trigger_checkpoint(10, vec![t0]).unwrap();
    let err = coordinator
        .acknowledge_checkpoint(ack(1, stranger, vec![]))
        .unwrap_err();
    assert!(
        err.to_string().contains("not expected"),
        "unexpected error: {err}"
    );
}

#[test]
fn test_checkpoint_coordinator_abort_ignores_late_acks() {
    let coordinator = CheckpointCoordinator::new(memory_backend());
    let t0 = TaskId::new(VertexId::new(1), 0);
    let t1 = TaskId::new(VertexId::new(2), 0);

    coordinator.trigger_checkpoint(10, vec![t0, t1]).unwrap();
    assert!(coordinator.abort_checkpoint(1, t0, "snapshot failed").unwrap());
    assert!(!coordinator.acknowledge_checkpoint(ack(1, t1, vec![1])).unwrap());
    assert_eq!(coordinator.aborted_checkpoint_ids().unwrap(), vec![1]);
    assert!(coordinator.completed_checkpoint_ids().unwrap().is_empty());

    // Aborting again is a no-op.
    assert!(!coordinator.abort_checkpoint(1, t0, "again").unwrap());
}

#[test]
fn test_checkpoint_coordinator_abort_expired() {
    let coordinator = CheckpointCoordinator::new(memory_backend());
    let t0 = TaskId::new(VertexId::new(1), 0);

    coordinator.trigger_checkpoint(10, vec![t0]).unwrap();
    assert!(coordinator
        .abort_expired(Duration::from_secs(3600))
        .unwrap()
        .is_empty());

    let expired = coordinator.abort_expired(Duration::ZERO).unwrap();
    assert_eq!(expired, vec![1]);
    assert_eq!(coordinator.pending_count().unwrap(), 0);
    assert!(!coordinator.acknowledge_checkpoint(ack(1, t0, vec![])).unwrap());
}

#[test]
fn test_completion_forgets_older_aborted_checkpoints() {
    let coordinator = CheckpointCoordinator::new(memory_backend());
    let t0 = TaskId::new(VertexId::new(1), 0);

    for _ in 0..3 {
        coordinator.trigger_checkpoint(10, vec![t0]).unwrap();
        coordinator.abort_expired(Duration::ZERO).unwrap();
    }
    assert_eq!(coordinator.aborted_checkpoint_ids().unwrap(), vec![1, 2, 3]);

    coordinator.trigger_checkpoint(20, vec![t0]).unwrap();
    assert!(coordinator.acknowledge_checkpoint(ack(4, t0, vec![4])).unwrap());
    assert!(coordinator.aborted_checkpoint_ids().unwrap().is_empty());

    // A straggler for a forgotten checkpoint is still ignored.
    assert!(!coordinator.acknowledge_checkpoint(ack(2, t0, vec![2])).unwrap());
    assert!(coordinator
        .acknowledge_checkpoint(ack(9, t0, vec![9]))
        .is_err());
}

#[test]
fn test_failed_finalize_keeps_previous_checkpoint() {
    // Capacity fits the first snapshot but not the second.
    let backend = Arc::new(MemoryStateBackend::new(4));
    let coordinator = CheckpointCoordinator::new(backend.clone());
    let t0 = TaskId::new(VertexId::new(1), 0);

    coordinator.trigger_checkpoint(10, vec![t0]).unwrap();
    assert!(coordinator.acknowledge_checkpoint(ack(1, t0, vec![1; 4])).unwrap());

    coordinator.trigger_checkpoint(20, vec![t0]).unwrap();
    let err = coordinator
        .acknowledge_checkpoint(ack(2, t0, vec![2; 5]))
        .unwrap_err();
    match err.downcast::<PipelineError>().unwrap() {
        PipelineError::CheckpointFailure {
            checkpoint_id,
            reason,
        } => {
            assert_eq!(checkpoint_id, 2);
            assert!(reason.contains("capacity"), "unexpected reason: {reason}");
        }
        other => panic!("unexpected error {other:?}"),
    }

    assert_eq!(coordinator.completed_checkpoint_ids().unwrap(), vec![1]);
    assert_eq!(coordinator.aborted_checkpoint_ids().unwrap(), vec![2]);
    assert_eq!(backend.list_checkpoints().unwrap(), vec![1]);
    assert_eq!(backend.load_task_state(1, t0).unwrap(), vec![1; 4]);
}

#[test]
fn test_checkpoint_coordinator_retains_latest_n() {
    let backend = memory_backend();
    let coordinator = CheckpointCoordinator::new(backend.clone()).with_retained_checkpoints(2);
    let t0 = TaskId::new(VertexId::new(1), 0);

    for id in 1..=4 {
        coordinator.trigger_checkpoint(id as i64, vec![t0]).unwrap();
        assert!(coordinator
            .acknowledge_checkpoint(ack(id, t0, vec![id as u8]))
            .unwrap());
    }

    assert_eq!(coordinator.completed_checkpoint_ids().unwrap(), vec![3, 4]);
    assert_eq!(coordinator.latest_completed_id().unwrap(), Some(4));
    assert_eq!(backend.list_checkpoints().unwrap(), vec![3, 4]);
}

#[test]
fn test_restore_latest_continues_id_allocation() {
    let backend = memory_backend();
    let t0 = TaskId::new(VertexId::new(1), 0);
    {
        let first_run = CheckpointCoordinator::new(backend.clone());
        for id in 1..=2 {
            first_run.trigger_checkpoint(0, vec![t0]).unwrap();
            first_run
                .acknowledge_checkpoint(ack(id, t0, vec![id as u8]))
                .unwrap();
        }
        // Left pending when the job died.
        first_run.trigger_checkpoint(0, vec![t0]).unwrap();
    }

    let second_run = CheckpointCoordinator::new(backend);
    let restored = second_run.restore_latest().unwrap().unwrap();
    assert_eq!(restored.checkpoint_id(), 2);
    assert_eq!(restored.task_state(t0).unwrap(), &[2]);
    assert_eq!(second_run.latest_completed_id().unwrap(), Some(2));

    let barrier = second_run.trigger_checkpoint(0, vec![t0]).unwrap();
    assert_eq!(barrier.checkpoint_id, 3);
}

#[test]
fn test_restore_latest_without_checkpoints() {
    let coordinator = CheckpointCoordinator::new(memory_backend());
    assert!(coordinator.restore_latest().unwrap().is_none());
    let barrier = coordinator
        .trigger_checkpoint(0, vec![TaskId::new(VertexId::new(1), 0)])
        .unwrap();
    assert_eq!(barrier.checkpoint_id, 1);
}

#[test]
fn test_failure_streak_is_bounded() {
    let coordinator = CheckpointCoordinator::new(memory_backend()).with_tolerable_failures(2);

    coordinator.record_failure(1, "timeout").unwrap();
    coordinator.record_failure(2, "timeout").unwrap();
    assert_eq!(coordinator.consecutive_failures(), 2);

    match coordinator.record_failure(3, "disk full").unwrap_err() {
        PipelineError::TooManyCheckpointFailures {
            consecutive,
            tolerable,
            last_reason,
        } => {
            assert_eq!(consecutive, 3);
            assert_eq!(tolerable, 2);
            assert_eq!(last_reason, "disk full");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_success_resets_failure_streak() {
    let coordinator = CheckpointCoordinator::new(memory_backend()).with_tolerable_failures(1);
    coordinator.record_failure(1, "timeout").unwrap();
    coordinator.record_success();
    assert_eq!(coordinator.consecutive_failures(), 0);
    coordinator.record_failure(2, "timeout").unwrap();
}

#[test]
fn test_zero_tolerable_failures_fails_immediately() {
    let coordinator = CheckpointCoordinator::new(memory_backend()).with_tolerable_failures(0);
    assert!(coordinator.record_failure(1, "timeout").is_err());
}

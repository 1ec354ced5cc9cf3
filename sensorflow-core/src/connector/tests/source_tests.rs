use super::*;
use crate::time::BoundedOutOfOrderness;

fn broker_with(topic: &str, values: &[u32]) -> MemoryBroker {
    let broker = MemoryBroker::new("memory://source-tests");
    let schema = BincodeSchema::<u32>::new();
    for (i, value) in values.iter().enumerate() {
        broker
            .publish(
                topic,
                OutgoingMessage::new(schema.serialize(value).unwrap())
                    .with_timestamp(1_000 + i as i64),
            )
            .unwrap();
    }
    broker
}

fn source(broker: &MemoryBroker) -> BrokerSource<u32> {
    BrokerSource::subscribe(broker, "readings", "group", BincodeSchema::<u32>::new())
        .unwrap()
        .with_poll_timeout(Duration::ZERO)
}

fn values(batch: SourceBatch<u32>) -> Vec<u32> {
    match batch {
        SourceBatch::Records { records, .. } => records.into_iter().map(|r| r.value).collect(),
        other => panic!("expected records, got {other:?}"),
    }
}

#[test]
fn test_source_uses_broker_timestamp_without_strategy() {
    let broker = broker_with("readings", &[10, 20]);
    let mut source = source(&broker);

    match source.poll_next().unwrap() {
        SourceBatch::Records { records, watermark } => {
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].timestamp, Some(1_000));
            assert_eq!(records[1].timestamp, Some(1_001));
            assert_eq!(watermark, None);
        }
        other => panic!("expected records, got {other:?}"),
    }
    assert!(matches!(source.poll_next().unwrap(), SourceBatch::Idle));
    assert_eq!(source.records_read(), 2);
}

#[test]
fn test_source_extracts_event_time_and_emits_watermarks() {
    let broker = broker_with("readings", &[5_000, 9_000, 7_000]);
    let mut source = source(&broker).with_watermark_strategy(BoundedOutOfOrderness::new(
        Duration::from_secs(1),
        |v: &u32| *v as i64,
    ));

    match source.poll_next().unwrap() {
        SourceBatch::Records { records, watermark } => {
            let timestamps: Vec<_> = records.iter().map(|r| r.timestamp).collect();
            assert_eq!(timestamps, vec![Some(5_000), Some(9_000), Some(7_000)]);
            assert_eq!(watermark, Some(Watermark::new(8_000)));
        }
        other => panic!("expected records, got {other:?}"),
    }
}

#[test]
fn test_source_respects_batch_size_and_tracks_positions() {
    let broker = broker_with("readings", &[1, 2, 3, 4, 5]);
    let mut source = source(&broker).with_max_batch_size(2);

    assert_eq!(values(source.poll_next().unwrap()), vec![1, 2]);
    assert_eq!(source.positions(), &BTreeMap::from([(0, 2)]));
    assert_eq!(values(source.poll_next().unwrap()), vec![3, 4]);
    assert_eq!(values(source.poll_next().unwrap()), vec![5]);
    assert_eq!(source.positions(), &BTreeMap::from([(0, 5)]));
}

#[test]
fn test_source_reports_exhausted_topic() {
    let broker = broker_with("readings", &[1]);
    broker.close_topic("readings").unwrap();
    let mut source = source(&broker);
    assert_eq!(values(source.poll_next().unwrap()), vec![1]);
    assert!(matches!(source.poll_next().unwrap(), SourceBatch::Exhausted));
}

#[test]
fn test_source_snapshot_and_restore_replays_after_checkpoint() {
    let broker = broker_with("readings", &[1, 2, 3, 4]);
    let mut first = source(&broker).with_max_batch_size(2);
    assert_eq!(values(first.poll_next().unwrap()), vec![1, 2]);
    let snapshot = first.snapshot_state(1).unwrap();
    assert_eq!(values(first.poll_next().unwrap()), vec![3, 4]);

    let mut restored = source(&broker);
    restored.restore_state(&snapshot).unwrap();
    assert_eq!(values(restored.poll_next().unwrap()), vec![3, 4]);
}

#[test]
fn test_source_restore_rejects_other_topic() {
    let broker = broker_with("readings", &[1]);
    let mut reader = source(&broker);
    let snapshot = reader.snapshot_state(1).unwrap();

    let mut other =
        BrokerSource::subscribe(&broker, "alerts", "group", BincodeSchema::<u32>::new()).unwrap();
    let err = other.restore_state(&snapshot).unwrap_err();
    assert!(err.to_string().contains("readings"), "unexpected error: {err}");
}

#[test]
fn test_source_commits_offsets_on_checkpoint_complete() {
    let broker = broker_with("readings", &[1, 2, 3]);
    let mut source = source(&broker).with_max_batch_size(1);

    source.poll_next().unwrap();
    source.snapshot_state(1).unwrap();
    source.poll_next().unwrap();
    source.snapshot_state(2).unwrap();
    source.poll_next().unwrap();
    source.snapshot_state(3).unwrap();

    source.notify_checkpoint_complete(2);
    assert_eq!(
        broker.committed_offsets("group", "readings").unwrap(),
        BTreeMap::from([(0, 2)])
    );
    source.notify_checkpoint_complete(3);
    assert_eq!(
        broker.committed_offsets("group", "readings").unwrap(),
        BTreeMap::from([(0, 3)])
    );
}

#[test]
fn test_source_decode_error_names_position() {
    let broker = MemoryBroker::new("memory://source-decode");
    broker
        .publish("readings", OutgoingMessage::new(b"{oops".to_vec()))
        .unwrap();
    let mut source =
        BrokerSource::subscribe(&broker, "readings", "group", JsonSchema::<u32>::new())
            .unwrap()
            .with_poll_timeout(Duration::ZERO);
    let err = source.poll_next().unwrap_err();
    assert!(
        err.to_string().contains("partition 0 offset 0"),
        "unexpected error: {err}"
    );
}

#[test]
fn test_source_dropped_records_still_advance_position() {
    let broker = MemoryBroker::new("memory://source-drop");
    broker
        .publish("readings", OutgoingMessage::new(b"{oops".to_vec()))
        .unwrap();
    broker
        .publish("readings", OutgoingMessage::new(b"42".to_vec()))
        .unwrap();
    let mut source = BrokerSource::subscribe(
        &broker,
        "readings",
        "group",
        JsonSchema::<u32>::new().skip_malformed(),
    )
    .unwrap()
    .with_poll_timeout(Duration::ZERO);

    assert_eq!(values(source.poll_next().unwrap()), vec![42]);
    assert_eq!(source.records_dropped(), 1);
    assert_eq!(source.positions(), &BTreeMap::from([(0, 2)]));
}

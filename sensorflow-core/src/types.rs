use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, taken from the data itself.
pub type EventTime = i64;

/// Monotonic id of a checkpoint. Ids keep growing across restarts.
pub type CheckpointId = u64;

/// A value with its event time, if it has one.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord<T> {
    pub value: T,
    pub timestamp: Option<EventTime>,
}

impl<T> StreamRecord<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            timestamp: None,
        }
    }

    pub fn with_timestamp(value: T, timestamp: EventTime) -> Self {
        Self {
            value,
            timestamp: Some(timestamp),
        }
    }
}

/// No record with an event time at or below `timestamp` is expected anymore.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    pub timestamp: EventTime,
}

impl Watermark {
    pub fn new(timestamp: EventTime) -> Self {
        Self { timestamp }
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watermark@{}", self.timestamp)
    }
}

/// Marks the end of checkpoint epoch `checkpoint_id` in the record stream.
///
/// `timestamp` is the wall-clock trigger time, not an event time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Barrier {
    pub checkpoint_id: CheckpointId,
    pub timestamp: EventTime,
}

impl Barrier {
    pub fn with_timestamp(checkpoint_id: CheckpointId, timestamp: EventTime) -> Self {
        Self {
            checkpoint_id,
            timestamp,
        }
    }
}

/// What the source task sends to the operator task, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamElement<T> {
    Record(StreamRecord<T>),
    Watermark(Watermark),
    CheckpointBarrier(Barrier),
    /// The input is exhausted; nothing follows.
    End,
}

impl<T> StreamElement<T> {
    pub fn record(value: T) -> Self {
        Self::Record(StreamRecord::new(value))
    }

    pub fn timestamped_record(value: T, timestamp: EventTime) -> Self {
        Self::Record(StreamRecord::with_timestamp(value, timestamp))
    }

    pub fn watermark(timestamp: EventTime) -> Self {
        Self::Watermark(Watermark::new(timestamp))
    }

    pub fn barrier_with_timestamp(checkpoint_id: CheckpointId, timestamp: EventTime) -> Self {
        Self::CheckpointBarrier(Barrier::with_timestamp(checkpoint_id, timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamped_record_element() {
        let element = StreamElement::timestamped_record("t1", 1_500);
        assert_eq!(
            element,
            StreamElement::Record(StreamRecord {
                value: "t1",
                timestamp: Some(1_500),
            })
        );
    }

    #[test]
    fn test_barrier_element_carries_checkpoint_id() {
        let element = StreamElement::<u8>::barrier_with_timestamp(7, 1_234);
        let StreamElement::CheckpointBarrier(barrier) = element else {
            panic!("expected a barrier, got {element:?}");
        };
        assert_eq!(barrier.checkpoint_id, 7);
        assert_eq!(barrier.timestamp, 1_234);
    }

    #[test]
    fn test_watermarks_order_by_timestamp() {
        assert!(Watermark::new(10) < Watermark::new(11));
        assert_eq!(Watermark::new(-5).to_string(), "watermark@-5");
    }
}

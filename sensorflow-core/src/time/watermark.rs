use super::*;

/// Sentinel for "no event seen yet".
pub const EVENT_TIME_MIN: EventTime = i64::MIN;

/// Assigns event time to decoded records and creates the watermark generator
/// of a source.
pub trait WatermarkStrategy<T>: Send + Sync {
    /// Event time of a record, in milliseconds.
    fn extract_timestamp(&self, element: &T) -> EventTime;

    /// Fresh generator, called once when the source starts.
    fn create_watermark_generator(&self) -> Box<dyn WatermarkGenerator>;
}

/// Observes event times and decides where the watermark is.
pub trait WatermarkGenerator: Send {
    fn on_event(&mut self, timestamp: EventTime);

    /// `None` until the first event was observed.
    fn current_watermark(&self) -> Option<Watermark>;
}

/// Records may arrive up to `max_delay` behind the newest one seen.
///
/// ```
/// use std::time::Duration;
/// use sensorflow_core::time::BoundedOutOfOrderness;
///
/// let strategy = BoundedOutOfOrderness::new(Duration::from_secs(5), |ts: &i64| *ts);
/// ```
pub struct BoundedOutOfOrderness<T, F> {
    max_delay_ms: i64,
    timestamp_extractor: F,
    _phantom: std::marker::PhantomData<fn(&T)>,
}

impl<T, F: Fn(&T) -> EventTime + Send + Sync> BoundedOutOfOrderness<T, F> {
    pub fn new(max_delay: Duration, timestamp_extractor: F) -> Self {
        Self {
            max_delay_ms: i64::try_from(max_delay.as_millis()).unwrap_or(i64::MAX),
            timestamp_extractor,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T, F> WatermarkStrategy<T> for BoundedOutOfOrderness<T, F>
where
    F: Fn(&T) -> EventTime + Send + Sync,
{
    fn extract_timestamp(&self, element: &T) -> EventTime {
        (self.timestamp_extractor)(element)
    }

    fn create_watermark_generator(&self) -> Box<dyn WatermarkGenerator> {
        Box::new(BoundedOutOfOrdernessGenerator {
            max_delay_ms: self.max_delay_ms,
            max_seen_timestamp: EVENT_TIME_MIN,
        })
    }
}

struct BoundedOutOfOrdernessGenerator {
    max_delay_ms: i64,
    max_seen_timestamp: EventTime,
}

impl WatermarkGenerator for BoundedOutOfOrdernessGenerator {
    fn on_event(&mut self, timestamp: EventTime) {
        self.max_seen_timestamp = self.max_seen_timestamp.max(timestamp);
    }

    fn current_watermark(&self) -> Option<Watermark> {
        if self.max_seen_timestamp == EVENT_TIME_MIN {
            return None;
        }
        Some(Watermark::new(
            self.max_seen_timestamp.saturating_sub(self.max_delay_ms),
        ))
    }
}

/// Wraps a generator and reports a watermark only when it moved forward.
pub struct WatermarkEmitter {
    generator: Box<dyn WatermarkGenerator>,
    last_emitted: EventTime,
}

impl WatermarkEmitter {
    pub fn new(generator: Box<dyn WatermarkGenerator>) -> Self {
        Self {
            generator,
            last_emitted: EVENT_TIME_MIN,
        }
    }

    pub fn on_event(&mut self, timestamp: EventTime) {
        self.generator.on_event(timestamp);
    }

    /// The current watermark if it is newer than the last one returned.
    pub fn advance(&mut self) -> Option<Watermark> {
        let watermark = self.generator.current_watermark()?;
        if watermark.timestamp <= self.last_emitted {
            return None;
        }
        self.last_emitted = watermark.timestamp;
        Some(watermark)
    }
}

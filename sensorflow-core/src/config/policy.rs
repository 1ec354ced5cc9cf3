use super::*;

/// Consistency guarantee of checkpoint snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointingMode {
    ExactlyOnce,
    AtLeastOnce,
}

impl std::fmt::Display for CheckpointingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointingMode::ExactlyOnce => f.write_str("exactly-once"),
            CheckpointingMode::AtLeastOnce => f.write_str("at-least-once"),
        }
    }
}

/// Cadence and failure tolerance of periodic checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPolicy {
    interval: Duration,
    mode: CheckpointingMode,
    /// A pending checkpoint older than this is aborted.
    pub timeout: Duration,
    /// Consecutive failed checkpoints tolerated before the job fails.
    pub tolerable_failures: u32,
    /// Completed checkpoints kept by the state backend.
    pub retained_checkpoints: usize,
}

impl CheckpointPolicy {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
    pub const DEFAULT_TOLERABLE_FAILURES: u32 = 3;
    pub const DEFAULT_RETAINED_CHECKPOINTS: usize = 3;

    /// Exactly-once checkpoints every `interval`. The interval must be positive.
    pub fn exactly_once(interval: Duration) -> Result<Self, ConfigError> {
        Self::new(interval, CheckpointingMode::ExactlyOnce)
    }

    pub fn new(interval: Duration, mode: CheckpointingMode) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::MalformedValue {
                field: flags::CHECKPOINTS_INTERVAL.to_string(),
                value: "0".to_string(),
                reason: "checkpoint interval must be a positive duration".to_string(),
            });
        }
        Ok(Self {
            interval,
            mode,
            timeout: Self::DEFAULT_TIMEOUT,
            tolerable_failures: Self::DEFAULT_TOLERABLE_FAILURES,
            retained_checkpoints: Self::DEFAULT_RETAINED_CHECKPOINTS,
        })
    }

    /// Exactly-once checkpoints every `minutes` minutes.
    pub fn every_minutes(minutes: u64) -> Result<Self, ConfigError> {
        Self::exactly_once(Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tolerable_failures(mut self, tolerable_failures: u32) -> Self {
        self.tolerable_failures = tolerable_failures;
        self
    }

    pub fn with_retained_checkpoints(mut self, retained: usize) -> Self {
        self.retained_checkpoints = retained.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Interval in milliseconds, as handed to the coordinator's ticker.
    pub fn interval_ms(&self) -> u64 {
        self.interval.as_millis() as u64
    }

    pub fn mode(&self) -> CheckpointingMode {
        self.mode
    }
}

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use sensorflow_core::runtime::Transform;
use sensorflow_core::types::EventTime;
use serde::{Deserialize, Serialize};

/// One measurement from one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    /// Event time in milliseconds since the epoch.
    pub timestamp: EventTime,
    pub value: f64,
}

/// Running moments of one sensor after its latest reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentsAggregate {
    pub sensor_id: String,
    pub timestamp: EventTime,
    pub count: u64,
    pub mean: f64,
    pub variance: f64,
    pub skewness: f64,
    /// Excess kurtosis.
    pub kurtosis: f64,
}

/// Central moment sums, updated one value at a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Moments {
    count: u64,
    mean: f64,
    m2: f64,
    m3: f64,
    m4: f64,
}

impl Moments {
    fn push(&mut self, x: f64) {
        let n1 = self.count as f64;
        self.count += 1;
        let n = self.count as f64;

        let delta = x - self.mean;
        let delta_n = delta / n;
        let delta_n2 = delta_n * delta_n;
        let term1 = delta * delta_n * n1;

        self.mean += delta_n;
        self.m4 += term1 * delta_n2 * (n * n - 3.0 * n + 3.0) + 6.0 * delta_n2 * self.m2
            - 4.0 * delta_n * self.m3;
        self.m3 += term1 * delta_n * (n - 2.0) - 3.0 * delta_n * self.m2;
        self.m2 += term1;
    }

    fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.m2 / self.count as f64
    }

    fn skewness(&self) -> f64 {
        if self.m2 == 0.0 {
            return 0.0;
        }
        (self.count as f64).sqrt() * self.m3 / self.m2.powf(1.5)
    }

    fn kurtosis(&self) -> f64 {
        if self.m2 == 0.0 {
            return 0.0;
        }
        self.count as f64 * self.m4 / (self.m2 * self.m2) - 3.0
    }
}

/// Per-sensor running mean, variance, skewness and kurtosis.
///
/// Emits one aggregate per reading. Non-finite values are skipped.
#[derive(Debug, Default)]
pub struct RunningMoments {
    sensors: BTreeMap<String, Moments>,
}

impl RunningMoments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }
}

impl Transform<SensorReading, MomentsAggregate> for RunningMoments {
    fn process(&mut self, input: SensorReading, output: &mut Vec<MomentsAggregate>) -> Result<()> {
        if !input.value.is_finite() {
            tracing::warn!(sensor = %input.sensor_id, value = input.value, "skipping non-finite reading");
            return Ok(());
        }
        let moments = self.sensors.entry(input.sensor_id.clone()).or_default();
        moments.push(input.value);
        output.push(MomentsAggregate {
            sensor_id: input.sensor_id,
            timestamp: input.timestamp,
            count: moments.count,
            mean: moments.mean,
            variance: moments.variance(),
            skewness: moments.skewness(),
            kurtosis: moments.kurtosis(),
        });
        Ok(())
    }

    fn snapshot_state(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.sensors).context("failed to encode moments state")
    }

    fn restore_state(&mut self, data: &[u8]) -> Result<()> {
        self.sensors = bincode::deserialize(data).context("failed to decode moments state")?;
        Ok(())
    }
}

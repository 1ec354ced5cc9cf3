use super::*;

const DEFAULT_MAX_BATCH_SIZE: usize = 256;
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// What one [`BrokerSource::poll_next`] call produced.
#[derive(Debug)]
pub enum SourceBatch<T> {
    Records {
        records: Vec<StreamRecord<T>>,
        /// Set when the watermark advanced with this batch.
        watermark: Option<Watermark>,
    },
    Idle,
    /// The topic ended and everything was read.
    Exhausted,
}

#[derive(Debug, Serialize, Deserialize)]
struct SourceSnapshot {
    topic: String,
    positions: BTreeMap<PartitionId, Offset>,
}

/// Checkpointed reader of one topic.
///
/// The snapshot is the next offset per partition. Restoring seeks the
/// consumer back to those offsets, so every record after the checkpoint is
/// read again.
pub struct BrokerSource<T> {
    topic: String,
    group_id: String,
    consumer: Box<dyn BrokerConsumer>,
    schema: Box<dyn DeserializationSchema<T>>,
    watermark_strategy: Option<Box<dyn WatermarkStrategy<T>>>,
    watermarks: Option<WatermarkEmitter>,
    positions: BTreeMap<PartitionId, Offset>,
    pending_commits: BTreeMap<CheckpointId, BTreeMap<PartitionId, Offset>>,
    max_batch_size: usize,
    poll_timeout: Duration,
    records_read: u64,
    records_dropped: u64,
}

impl<T: Send + 'static> BrokerSource<T> {
    /// Subscribe to `topic` as member of `group_id`.
    pub fn subscribe(
        client: &dyn BrokerClient,
        topic: &str,
        group_id: &str,
        schema: impl DeserializationSchema<T> + 'static,
    ) -> Result<Self> {
        let consumer = client
            .consumer(topic, group_id)
            .with_context(|| format!("failed to subscribe to topic {topic}"))?;
        tracing::info!(topic, group_id, broker = client.address(), "source subscribed");
        Ok(Self {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            consumer,
            schema: Box::new(schema),
            watermark_strategy: None,
            watermarks: None,
            positions: BTreeMap::new(),
            pending_commits: BTreeMap::new(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            records_read: 0,
            records_dropped: 0,
        })
    }

    /// Take event time from the decoded records instead of the broker
    /// timestamp, and emit watermarks.
    pub fn with_watermark_strategy(mut self, strategy: impl WatermarkStrategy<T> + 'static) -> Self {
        self.watermarks = Some(WatermarkEmitter::new(strategy.create_watermark_generator()));
        self.watermark_strategy = Some(Box::new(strategy));
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next offset to read per partition, for partitions read so far.
    pub fn positions(&self) -> &BTreeMap<PartitionId, Offset> {
        &self.positions
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    pub fn records_dropped(&self) -> u64 {
        self.records_dropped
    }

    pub fn poll_next(&mut self) -> Result<SourceBatch<T>> {
        let messages = match self
            .consumer
            .poll(self.max_batch_size, self.poll_timeout)
            .with_context(|| format!("poll of topic {} failed", self.topic))?
        {
            PollResult::Messages(messages) => messages,
            PollResult::Idle => return Ok(SourceBatch::Idle),
            PollResult::EndOfTopic => return Ok(SourceBatch::Exhausted),
        };

        let mut records = Vec::with_capacity(messages.len());
        for message in messages {
            let decoded = self.schema.deserialize(&message.payload).with_context(|| {
                format!(
                    "undecodable record in {} partition {} offset {}",
                    self.topic, message.partition, message.offset
                )
            })?;
            self.positions.insert(message.partition, message.offset + 1);

            let Some(value) = decoded else {
                self.records_dropped += 1;
                continue;
            };
            let timestamp = match &self.watermark_strategy {
                Some(strategy) => Some(strategy.extract_timestamp(&value)),
                None => message.timestamp,
            };
            if let (Some(emitter), Some(ts)) = (self.watermarks.as_mut(), timestamp) {
                emitter.on_event(ts);
            }
            records.push(StreamRecord { value, timestamp });
        }
        self.records_read += records.len() as u64;

        let watermark = self.watermarks.as_mut().and_then(WatermarkEmitter::advance);
        Ok(SourceBatch::Records { records, watermark })
    }

    /// Snapshot read positions for `checkpoint_id`. The positions are
    /// committed to the consumer group once the checkpoint completes.
    pub fn snapshot_state(&mut self, checkpoint_id: CheckpointId) -> Result<Vec<u8>> {
        self.pending_commits
            .insert(checkpoint_id, self.positions.clone());
        bincode::serialize(&SourceSnapshot {
            topic: self.topic.clone(),
            positions: self.positions.clone(),
        })
        .context("serialize source positions failed")
    }

    pub fn restore_state(&mut self, data: &[u8]) -> Result<()> {
        let snapshot: SourceSnapshot =
            bincode::deserialize(data).context("deserialize source positions failed")?;
        if snapshot.topic != self.topic {
            return Err(anyhow!(
                "checkpoint holds positions for topic {}, source reads {}",
                snapshot.topic,
                self.topic
            ));
        }
        for (partition, offset) in &snapshot.positions {
            self.consumer.seek(*partition, *offset)?;
        }
        tracing::info!(topic = %self.topic, positions = ?snapshot.positions, "source restored");
        self.positions = snapshot.positions;
        Ok(())
    }

    /// Commit the positions of `checkpoint_id` to the consumer group.
    pub fn notify_checkpoint_complete(&mut self, checkpoint_id: CheckpointId) {
        let mut completed = self.pending_commits.split_off(&(checkpoint_id + 1));
        std::mem::swap(&mut completed, &mut self.pending_commits);
        let Some((_, offsets)) = completed.pop_last() else {
            return;
        };
        if let Err(err) = self.consumer.commit_offsets(&offsets) {
            // Restore uses checkpointed positions, not group offsets.
            tracing::warn!(
                checkpoint_id,
                group_id = %self.group_id,
                "failed to commit consumer offsets: {err:#}"
            );
        }
    }
}

#[cfg(test)]
#[path = "tests/source_tests.rs"]
mod tests;

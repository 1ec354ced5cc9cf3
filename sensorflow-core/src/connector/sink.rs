use super::*;

/// Output guarantee of a [`BrokerSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryGuarantee {
    /// One broker transaction per checkpoint epoch, committed when the
    /// checkpoint completes.
    ExactlyOnce,
    /// Plain writes, flushed at every barrier. Replays may duplicate.
    AtLeastOnce,
}

impl std::fmt::Display for DeliveryGuarantee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryGuarantee::ExactlyOnce => write!(f, "exactly-once"),
            DeliveryGuarantee::AtLeastOnce => write!(f, "at-least-once"),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SinkSnapshot {
    /// Pre-committed transactions not yet known to be committed.
    pending: Vec<(CheckpointId, String)>,
    next_sequence: u64,
}

struct EpochTransaction {
    transactional_id: String,
    producer: Box<dyn BrokerProducer>,
}

/// A pre-committed transaction. The producer is gone when it was restored
/// from a checkpoint.
struct PendingTransaction {
    transactional_id: String,
    producer: Option<Box<dyn BrokerProducer>>,
}

/// Checkpoint-aware writer of one topic.
///
/// With [`DeliveryGuarantee::ExactlyOnce`] the records of an epoch go into
/// transaction `{prefix}-{seq}`. At the barrier the transaction is flushed
/// and recorded in the snapshot; it commits only after the checkpoint
/// completes. A restarted sink commits the transactions of the restored
/// checkpoint and aborts every other open one with its prefix.
pub struct BrokerSink<T> {
    client: Arc<dyn BrokerClient>,
    topic: String,
    schema: Box<dyn SerializationSchema<T>>,
    guarantee: DeliveryGuarantee,
    transactional_prefix: String,
    next_sequence: u64,
    current: Option<EpochTransaction>,
    pending: BTreeMap<CheckpointId, PendingTransaction>,
    producer: Option<Box<dyn BrokerProducer>>,
    records_written: u64,
}

impl<T: Send + 'static> BrokerSink<T> {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        topic: &str,
        schema: impl SerializationSchema<T> + 'static,
        guarantee: DeliveryGuarantee,
    ) -> Result<Self, PipelineError> {
        if guarantee == DeliveryGuarantee::ExactlyOnce && !client.supports_transactions() {
            return Err(PipelineError::RuntimeStartup(anyhow!(
                "broker at {} does not support transactions required by an exactly-once sink",
                client.address()
            )));
        }
        Ok(Self {
            client,
            topic: topic.to_string(),
            schema: Box::new(schema),
            guarantee,
            transactional_prefix: format!("{topic}-sink"),
            next_sequence: 0,
            current: None,
            pending: BTreeMap::new(),
            producer: None,
            records_written: 0,
        })
    }

    /// Prefix of this sink's transaction ids. Must be stable across restarts
    /// and unique per job.
    pub fn with_transactional_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.transactional_prefix = prefix.into();
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn guarantee(&self) -> DeliveryGuarantee {
        self.guarantee
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Whether pre-committed transactions wait for a checkpoint to complete.
    pub fn has_pending_commits(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Recover broker-side transactions. Called once before the first write,
    /// with the sink's state from the restored checkpoint if there is one.
    pub fn initialize(&mut self, restored: Option<&[u8]>) -> Result<()> {
        if self.guarantee == DeliveryGuarantee::AtLeastOnce {
            return Ok(());
        }
        if let Some(data) = restored {
            let snapshot: SinkSnapshot =
                bincode::deserialize(data).context("deserialize sink state failed")?;
            for (checkpoint_id, transactional_id) in &snapshot.pending {
                let committed = self
                    .client
                    .commit_prepared(transactional_id)
                    .map_err(|source| self.publish_failure(source))?;
                tracing::info!(
                    checkpoint_id,
                    transactional_id,
                    committed,
                    "recovered pre-committed transaction"
                );
            }
            self.next_sequence = snapshot.next_sequence;
        }

        let aborted = self
            .client
            .abort_prepared(&self.transactional_prefix)
            .map_err(|source| self.publish_failure(source))?;
        if aborted > 0 {
            tracing::info!(
                aborted,
                prefix = %self.transactional_prefix,
                "aborted transactions left by a previous run"
            );
        }
        Ok(())
    }

    pub fn write(&mut self, record: &StreamRecord<T>) -> Result<()> {
        let mut message = OutgoingMessage::new(self.schema.serialize(&record.value)?);
        message.key = self.schema.key(&record.value);
        message.timestamp = record.timestamp;

        let topic = self.topic.clone();
        let sent = match self.guarantee {
            DeliveryGuarantee::ExactlyOnce => self
                .current_transaction()
                .and_then(|producer| producer.send(&topic, message)),
            DeliveryGuarantee::AtLeastOnce => self
                .plain_producer()
                .and_then(|producer| producer.send(&topic, message)),
        };
        sent.map_err(|source| self.publish_failure(source))?;
        self.records_written += 1;
        Ok(())
    }

    /// Flush at the barrier of `checkpoint_id` and return the sink state for
    /// that checkpoint.
    pub fn prepare_commit(&mut self, checkpoint_id: CheckpointId) -> Result<Vec<u8>> {
        match self.guarantee {
            DeliveryGuarantee::AtLeastOnce => {
                if let Some(producer) = self.producer.as_mut() {
                    producer
                        .flush()
                        .map_err(|source| PipelineError::PublishFailure {
                            topic: self.topic.clone(),
                            source,
                        })?;
                }
                Ok(Vec::new())
            }
            DeliveryGuarantee::ExactlyOnce => {
                if let Some(mut epoch) = self.current.take() {
                    if let Err(source) = epoch.producer.flush() {
                        self.current = Some(epoch);
                        return Err(self.publish_failure(source).into());
                    }
                    tracing::debug!(
                        checkpoint_id,
                        transactional_id = %epoch.transactional_id,
                        "transaction pre-committed"
                    );
                    self.pending.insert(
                        checkpoint_id,
                        PendingTransaction {
                            transactional_id: epoch.transactional_id,
                            producer: Some(epoch.producer),
                        },
                    );
                }
                let snapshot = SinkSnapshot {
                    pending: self
                        .pending
                        .iter()
                        .map(|(id, txn)| (*id, txn.transactional_id.clone()))
                        .collect(),
                    next_sequence: self.next_sequence,
                };
                bincode::serialize(&snapshot).context("serialize sink state failed")
            }
        }
    }

    /// Commit every transaction pre-committed at or before `checkpoint_id`.
    pub fn notify_checkpoint_complete(&mut self, checkpoint_id: CheckpointId) -> Result<()> {
        let later = self.pending.split_off(&(checkpoint_id + 1));
        let ready = std::mem::replace(&mut self.pending, later);
        for (epoch_checkpoint, txn) in ready {
            let committed = match txn.producer {
                Some(mut producer) => producer.commit_transaction(),
                None => self
                    .client
                    .commit_prepared(&txn.transactional_id)
                    .map(|_| ()),
            };
            committed.map_err(|source| self.publish_failure(source))?;
            tracing::debug!(
                checkpoint_id = epoch_checkpoint,
                transactional_id = %txn.transactional_id,
                "transaction committed"
            );
        }
        Ok(())
    }

    /// Abort the transaction of the running epoch. Pre-committed ones are
    /// left for the next run to resolve.
    pub fn abort_current(&mut self) {
        if let Some(mut epoch) = self.current.take() {
            if let Err(err) = epoch.producer.abort_transaction() {
                tracing::warn!(
                    transactional_id = %epoch.transactional_id,
                    "failed to abort transaction: {err:#}"
                );
            }
        }
    }

    /// Flush outstanding plain writes at end of input.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(producer) = self.producer.as_mut() {
            producer
                .flush()
                .map_err(|source| PipelineError::PublishFailure {
                    topic: self.topic.clone(),
                    source,
                })?;
        }
        if let Some(epoch) = &self.current {
            tracing::warn!(
                transactional_id = %epoch.transactional_id,
                "transaction still open at end of input"
            );
        }
        Ok(())
    }

    fn current_transaction(&mut self) -> Result<&mut Box<dyn BrokerProducer>> {
        if self.current.is_none() {
            let transactional_id = transactional_id(&self.transactional_prefix, self.next_sequence);
            let mut producer = self.client.producer(Some(&transactional_id))?;
            producer.begin_transaction()?;
            self.next_sequence += 1;
            tracing::debug!(%transactional_id, "transaction started");
            self.current = Some(EpochTransaction {
                transactional_id,
                producer,
            });
        }
        self.current
            .as_mut()
            .map(|epoch| &mut epoch.producer)
            .ok_or_else(|| anyhow!("no open transaction"))
    }

    fn plain_producer(&mut self) -> Result<&mut Box<dyn BrokerProducer>> {
        if self.producer.is_none() {
            self.producer = Some(self.client.producer(None)?);
        }
        self.producer
            .as_mut()
            .ok_or_else(|| anyhow!("no producer"))
    }

    fn publish_failure(&self, source: anyhow::Error) -> PipelineError {
        PipelineError::PublishFailure {
            topic: self.topic.clone(),
            source,
        }
    }
}

#[cfg(test)]
#[path = "tests/sink_tests.rs"]
mod tests;

use super::*;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::{ClientContext, Offset as KafkaOffset, TopicPartitionList};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSACTION_OP_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// Brokers cap transaction timeouts at `transaction.max.timeout.ms`,
/// 15 minutes by default.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

type KafkaProducerHandle = BaseProducer<DeliveryContext>;

/// Producers whose transaction was still open when their owner dropped
/// them, keyed by bootstrap servers and transactional id.
///
/// A new Kafka producer cannot finish the transaction of another producer
/// instance: `init_transactions` on the same id fences and aborts it. Only
/// the instance that began a transaction can commit it, so it is kept here
/// for a restarted job in the same process.
static PARKED: OnceLock<Mutex<HashMap<(String, String), KafkaProducerHandle>>> = OnceLock::new();

fn parked() -> Result<MutexGuard<'static, HashMap<(String, String), KafkaProducerHandle>>> {
    PARKED
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .map_err(|_| anyhow!("parked producer registry lock poisoned"))
}

/// Keeps the first delivery failure until the producer reports it.
#[derive(Default)]
struct DeliveryContext {
    failure: Mutex<Option<String>>,
}

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        if let Err((err, message)) = result {
            if let Ok(mut failure) = self.failure.lock() {
                failure.get_or_insert_with(|| {
                    format!(
                        "delivery to {} partition {} failed: {err}",
                        message.topic(),
                        message.partition()
                    )
                });
            }
        }
    }
}

/// Client for a Kafka cluster, backed by librdkafka.
///
/// Consumers read with `isolation.level=read_committed` and never commit
/// on their own. Transactional producers are idempotent and call
/// `init_transactions` when created, which fences any earlier producer
/// with the same transactional id.
#[derive(Debug, Clone)]
pub struct KafkaClient {
    bootstrap_servers: String,
    transaction_timeout: Duration,
}

impl KafkaClient {
    /// `address` is a comma-separated list of `host:port` pairs.
    pub fn from_address(address: &str) -> Result<Self> {
        let mut servers = Vec::new();
        for server in address.split(',').map(str::trim) {
            let valid = server
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(anyhow!(
                    "invalid broker address '{address}': expected host:port[,host:port...] or {MEMORY_SCHEME}<name>"
                ));
            }
            servers.push(server);
        }
        Ok(Self {
            bootstrap_servers: servers.join(","),
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
        })
    }

    /// How long the broker keeps a transaction open before aborting it.
    /// Must exceed the checkpoint interval plus the checkpoint timeout.
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("isolation.level", "read_committed")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false");
        config
    }

    pub fn producer_config(&self, transactional_id: Option<&str>) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("enable.idempotence", "true")
            .set("acks", "all");
        if let Some(id) = transactional_id {
            config
                .set("transactional.id", id)
                .set(
                    "transaction.timeout.ms",
                    self.transaction_timeout.as_millis().to_string(),
                );
        }
        config
    }
}

impl BrokerClient for KafkaClient {
    fn address(&self) -> &str {
        &self.bootstrap_servers
    }

    fn consumer(&self, topic: &str, group_id: &str) -> Result<Box<dyn BrokerConsumer>> {
        Ok(Box::new(KafkaConsumer::new(self, topic, group_id)?))
    }

    fn producer(&self, transactional_id: Option<&str>) -> Result<Box<dyn BrokerProducer>> {
        let producer: KafkaProducerHandle = self
            .producer_config(transactional_id)
            .create_with_context(DeliveryContext::default())
            .context("failed to create Kafka producer")?;
        if let Some(id) = transactional_id {
            producer
                .init_transactions(TRANSACTION_OP_TIMEOUT)
                .with_context(|| format!("init_transactions for {id} failed"))?;
        }
        Ok(Box::new(KafkaProducer {
            bootstrap_servers: self.bootstrap_servers.clone(),
            producer: Some(producer),
            transactional_id: transactional_id.map(str::to_string),
            in_transaction: false,
        }))
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn commit_prepared(&self, transactional_id: &str) -> Result<bool> {
        let key = (self.bootstrap_servers.clone(), transactional_id.to_string());
        let Some(producer) = parked()?.remove(&key) else {
            tracing::warn!(
                transactional_id,
                "no producer in this process holds the transaction; the broker aborts it at the transaction timeout"
            );
            return Ok(false);
        };
        producer
            .commit_transaction(TRANSACTION_OP_TIMEOUT)
            .with_context(|| format!("commit of prepared transaction {transactional_id} failed"))?;
        Ok(true)
    }

    fn abort_prepared(&self, prefix: &str) -> Result<usize> {
        let owned = format!("{prefix}-");
        let producers: Vec<(String, KafkaProducerHandle)> = {
            let mut parked = parked()?;
            let keys: Vec<(String, String)> = parked
                .keys()
                .filter(|(servers, id)| *servers == self.bootstrap_servers && id.starts_with(&owned))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| parked.remove(&key).map(|producer| (key.1, producer)))
                .collect()
        };
        let aborted = producers.len();
        for (transactional_id, producer) in producers {
            producer
                .abort_transaction(TRANSACTION_OP_TIMEOUT)
                .with_context(|| format!("abort of transaction {transactional_id} failed"))?;
        }
        Ok(aborted)
    }
}

/// Reads every partition of one topic through manual assignment.
///
/// Positions set by `seek` take effect at the next poll. Partitions without
/// a position start at the group's committed offset, else the earliest one.
pub(crate) struct KafkaConsumer {
    consumer: BaseConsumer,
    topic: String,
    positions: BTreeMap<PartitionId, Offset>,
    assigned: bool,
}

impl KafkaConsumer {
    pub(crate) fn new(client: &KafkaClient, topic: &str, group_id: &str) -> Result<Self> {
        let consumer: BaseConsumer = client
            .consumer_config(group_id)
            .create()
            .context("failed to create Kafka consumer")?;
        Ok(Self {
            consumer,
            topic: topic.to_string(),
            positions: BTreeMap::new(),
            assigned: false,
        })
    }

    fn ensure_assigned(&mut self) -> Result<()> {
        if self.assigned {
            return Ok(());
        }
        let mut assignment = TopicPartitionList::new();
        for partition in self.partitions()? {
            let offset = match self.positions.get(&partition) {
                Some(offset) => KafkaOffset::Offset(*offset as i64),
                None => KafkaOffset::Stored,
            };
            assignment
                .add_partition_offset(&self.topic, partition as i32, offset)
                .with_context(|| format!("invalid offset for {} partition {partition}", self.topic))?;
        }
        self.consumer
            .assign(&assignment)
            .with_context(|| format!("failed to assign partitions of {}", self.topic))?;
        self.assigned = true;
        Ok(())
    }
}

impl BrokerConsumer for KafkaConsumer {
    fn partitions(&self) -> Result<Vec<PartitionId>> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(self.topic.as_str()), METADATA_TIMEOUT)
            .with_context(|| format!("metadata request for topic {} failed", self.topic))?;
        let topic = metadata
            .topics()
            .iter()
            .find(|topic| topic.name() == self.topic)
            .ok_or_else(|| anyhow!("broker returned no metadata for topic {}", self.topic))?;
        if let Some(err) = topic.error() {
            return Err(anyhow!("topic {} is unavailable: {err:?}", self.topic));
        }
        let mut partitions: Vec<PartitionId> = topic
            .partitions()
            .iter()
            .map(|partition| partition.id() as PartitionId)
            .collect();
        if partitions.is_empty() {
            return Err(anyhow!("topic {} has no partitions", self.topic));
        }
        partitions.sort_unstable();
        Ok(partitions)
    }

    fn seek(&mut self, partition: PartitionId, offset: Offset) -> Result<()> {
        self.positions.insert(partition, offset);
        self.assigned = false;
        Ok(())
    }

    /// Kafka topics have no end, so this never reports `EndOfTopic`.
    fn poll(&mut self, max_messages: usize, timeout: Duration) -> Result<PollResult> {
        self.ensure_assigned()?;
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();
        while batch.len() < max_messages {
            let wait = if batch.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };
            let message = match self.consumer.poll(wait) {
                Some(result) => {
                    result.with_context(|| format!("consume from topic {} failed", self.topic))?
                }
                None if batch.is_empty() && Instant::now() < deadline => continue,
                None => break,
            };
            let consumed = ConsumedMessage {
                partition: message.partition() as PartitionId,
                offset: message.offset() as Offset,
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                timestamp: message.timestamp().to_millis(),
            };
            self.positions.insert(consumed.partition, consumed.offset + 1);
            batch.push(consumed);
        }
        if batch.is_empty() {
            Ok(PollResult::Idle)
        } else {
            Ok(PollResult::Messages(batch))
        }
    }

    fn commit_offsets(&mut self, offsets: &BTreeMap<PartitionId, Offset>) -> Result<()> {
        let mut list = TopicPartitionList::new();
        for (partition, offset) in offsets {
            list.add_partition_offset(&self.topic, *partition as i32, KafkaOffset::Offset(*offset as i64))
                .with_context(|| format!("invalid offset for {} partition {partition}", self.topic))?;
        }
        self.consumer
            .commit(&list, CommitMode::Async)
            .with_context(|| format!("offset commit for topic {} failed", self.topic))
    }
}

struct KafkaProducer {
    bootstrap_servers: String,
    /// `None` only after the producer was parked on drop.
    producer: Option<KafkaProducerHandle>,
    transactional_id: Option<String>,
    in_transaction: bool,
}

impl KafkaProducer {
    fn handle(&self) -> Result<&KafkaProducerHandle> {
        self.producer
            .as_ref()
            .ok_or_else(|| anyhow!("Kafka producer already released"))
    }

    fn require_transaction(&self) -> Result<&str> {
        match &self.transactional_id {
            Some(id) if self.in_transaction => Ok(id),
            Some(id) => Err(anyhow!("transaction {id} has not begun")),
            None => Err(anyhow!("producer is not transactional")),
        }
    }

    fn take_delivery_failure(&self) -> Result<()> {
        let failure = self
            .handle()?
            .context()
            .failure
            .lock()
            .map_err(|_| anyhow!("delivery report lock poisoned"))?
            .take();
        match failure {
            Some(failure) => Err(anyhow!(failure)),
            None => Ok(()),
        }
    }
}

impl BrokerProducer for KafkaProducer {
    fn begin_transaction(&mut self) -> Result<()> {
        let Some(id) = &self.transactional_id else {
            return Err(anyhow!("producer is not transactional"));
        };
        if self.in_transaction {
            return Err(anyhow!("transaction {id} is already open"));
        }
        self.handle()?
            .begin_transaction()
            .with_context(|| format!("begin of transaction {id} failed"))?;
        self.in_transaction = true;
        Ok(())
    }

    fn send(&mut self, topic: &str, message: OutgoingMessage) -> Result<()> {
        if self.transactional_id.is_some() {
            self.require_transaction()?;
        }
        let producer = self.handle()?;
        let mut record = BaseRecord::<[u8], [u8]>::to(topic).payload(message.payload.as_slice());
        if let Some(key) = message.key.as_deref() {
            record = record.key(key);
        }
        if let Some(timestamp) = message.timestamp {
            record = record.timestamp(timestamp);
        }
        loop {
            match producer.send(record) {
                Ok(()) => break,
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    record = returned;
                    producer.poll(QUEUE_FULL_BACKOFF);
                }
                Err((err, _)) => {
                    return Err(anyhow::Error::new(err).context(format!("send to topic {topic} failed")))
                }
            }
        }
        producer.poll(Duration::ZERO);
        self.take_delivery_failure()
    }

    fn flush(&mut self) -> Result<()> {
        self.handle()?
            .flush(FLUSH_TIMEOUT)
            .context("producer flush failed")?;
        self.take_delivery_failure()
    }

    fn commit_transaction(&mut self) -> Result<()> {
        let id = self.require_transaction()?.to_string();
        self.in_transaction = false;
        self.handle()?
            .commit_transaction(TRANSACTION_OP_TIMEOUT)
            .with_context(|| format!("commit of transaction {id} failed"))
    }

    fn abort_transaction(&mut self) -> Result<()> {
        let id = self.require_transaction()?.to_string();
        self.in_transaction = false;
        self.handle()?
            .abort_transaction(TRANSACTION_OP_TIMEOUT)
            .with_context(|| format!("abort of transaction {id} failed"))
    }
}

impl Drop for KafkaProducer {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        let (Some(id), Some(producer)) = (self.transactional_id.take(), self.producer.take()) else {
            return;
        };
        match parked() {
            Ok(mut parked) => {
                tracing::debug!(transactional_id = %id, "parking producer with open transaction");
                parked.insert((self.bootstrap_servers.clone(), id), producer);
            }
            Err(err) => tracing::warn!(transactional_id = %id, "{err:#}"),
        }
    }
}

#[cfg(test)]
#[path = "tests/kafka_tests.rs"]
mod tests;

use super::*;

pub type PartitionId = u32;
pub type Offset = u64;

/// Address scheme of the in-process broker.
pub const MEMORY_SCHEME: &str = "memory://";

/// A message read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    /// Timestamp embedded in the message by its producer.
    pub timestamp: Option<EventTime>,
}

/// A message handed to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp: Option<EventTime>,
}

impl OutgoingMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            key: None,
            payload,
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_timestamp(mut self, timestamp: EventTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Outcome of a single consumer poll.
#[derive(Debug, PartialEq, Eq)]
pub enum PollResult {
    Messages(Vec<ConsumedMessage>),
    /// Nothing arrived before the poll timeout.
    Idle,
    /// The topic was closed and every message has been read.
    EndOfTopic,
}

/// Reads one topic, tracking its own position per partition.
pub trait BrokerConsumer: Send {
    fn partitions(&self) -> Result<Vec<PartitionId>>;

    /// Next offset to read from `partition`.
    fn seek(&mut self, partition: PartitionId, offset: Offset) -> Result<()>;

    fn poll(&mut self, max_messages: usize, timeout: Duration) -> Result<PollResult>;

    /// Record progress in the consumer group. Informational only.
    fn commit_offsets(&mut self, offsets: &BTreeMap<PartitionId, Offset>) -> Result<()>;
}

/// Writes messages, optionally inside a broker transaction.
///
/// A transactional producer must call [`begin_transaction`] before sending.
/// Messages of an open transaction stay invisible to read-committed
/// consumers until the transaction commits.
///
/// [`begin_transaction`]: BrokerProducer::begin_transaction
pub trait BrokerProducer: Send {
    fn begin_transaction(&mut self) -> Result<()>;

    fn send(&mut self, topic: &str, message: OutgoingMessage) -> Result<()>;

    /// Block until every sent message is acknowledged by the broker.
    fn flush(&mut self) -> Result<()>;

    fn commit_transaction(&mut self) -> Result<()>;

    fn abort_transaction(&mut self) -> Result<()>;
}

/// Connection to a message broker.
pub trait BrokerClient: Send + Sync {
    fn address(&self) -> &str;

    fn consumer(&self, topic: &str, group_id: &str) -> Result<Box<dyn BrokerConsumer>>;

    /// A producer; transactional when `transactional_id` is given.
    fn producer(&self, transactional_id: Option<&str>) -> Result<Box<dyn BrokerProducer>>;

    fn supports_transactions(&self) -> bool;

    /// Commit a transaction left open by an earlier producer.
    ///
    /// Returns `false` when no such transaction is open, which is the case
    /// when it was already committed. Safe to call repeatedly.
    fn commit_prepared(&self, transactional_id: &str) -> Result<bool>;

    /// Abort every open transaction whose id starts with `{prefix}-`.
    /// Returns how many were aborted.
    fn abort_prepared(&self, prefix: &str) -> Result<usize>;
}

/// Resolve a broker address to a client.
///
/// `memory://<name>` resolves to the process-wide [`MemoryBroker`] of that
/// name. Anything else is a Kafka bootstrap list, `host:port[,host:port...]`.
/// No connection is made here; the first consumer poll or producer does.
pub fn connect(address: &str) -> Result<Arc<dyn BrokerClient>, PipelineError> {
    if let Some(name) = address.strip_prefix(MEMORY_SCHEME) {
        if name.is_empty() {
            return Err(PipelineError::RuntimeStartup(anyhow!(
                "broker address '{address}' has no name"
            )));
        }
        let broker = MemoryBroker::named(name).map_err(PipelineError::RuntimeStartup)?;
        tracing::info!(address, "connected to in-process broker");
        return Ok(Arc::new(broker));
    }
    let client = KafkaClient::from_address(address).map_err(PipelineError::RuntimeStartup)?;
    tracing::info!(bootstrap_servers = client.address(), "using Kafka broker");
    Ok(Arc::new(client))
}

/// Transaction ids owned by a sink: `{prefix}-{sequence}`.
pub fn transactional_id(prefix: &str, sequence: u64) -> String {
    format!("{prefix}-{sequence}")
}

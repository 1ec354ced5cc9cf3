use super::*;

const DEFAULT_PARTITIONS: u32 = 1;

// Fixed seeds so a key maps to the same partition in every process.
const KEY_HASH_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

static REGISTRY: OnceLock<Mutex<HashMap<String, MemoryBroker>>> = OnceLock::new();

/// In-process, transactional message broker.
///
/// Topics are split into partitions; keyed messages are routed by key hash,
/// unkeyed ones round-robin. Transactional writes are staged broker-side and
/// appended only on commit, so consumers always read committed data.
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

struct Shared {
    address: String,
    state: Mutex<BrokerState>,
    data_ready: Condvar,
    key_hasher: RandomState,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Topic>,
    open_transactions: HashMap<String, Vec<(String, OutgoingMessage)>>,
    committed_offsets: HashMap<(String, String), BTreeMap<PartitionId, Offset>>,
    failing_topics: HashSet<String>,
}

struct Topic {
    partitions: Vec<Vec<OutgoingMessage>>,
    closed: bool,
    next_partition: usize,
}

impl Topic {
    fn with_partitions(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
            closed: false,
            next_partition: 0,
        }
    }
}

impl BrokerState {
    fn topic_mut(&mut self, name: &str) -> &mut Topic {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Topic::with_partitions(DEFAULT_PARTITIONS))
    }
}

impl MemoryBroker {
    pub fn new(address: impl Into<String>) -> Self {
        let (k0, k1, k2, k3) = KEY_HASH_SEEDS;
        Self {
            shared: Arc::new(Shared {
                address: address.into(),
                state: Mutex::new(BrokerState::default()),
                data_ready: Condvar::new(),
                key_hasher: RandomState::with_seeds(k0, k1, k2, k3),
            }),
        }
    }

    /// The process-wide broker registered under `name`, created on first use.
    pub fn named(name: &str) -> Result<Self> {
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        let mut guard = registry
            .lock()
            .map_err(|_| anyhow!("memory broker registry lock poisoned"))?;
        Ok(guard
            .entry(name.to_string())
            .or_insert_with(|| MemoryBroker::new(format!("{MEMORY_SCHEME}{name}")))
            .clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| anyhow!("memory broker lock poisoned"))
    }

    /// Create `topic` with `partitions` partitions. Existing topics are kept.
    pub fn create_topic(&self, topic: &str, partitions: u32) -> Result<()> {
        self.lock()?
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::with_partitions(partitions));
        Ok(())
    }

    /// Append a message outside any transaction.
    pub fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<(PartitionId, Offset)> {
        let mut state = self.lock()?;
        if state.failing_topics.contains(topic) {
            return Err(anyhow!("broker rejected write to topic {topic}"));
        }
        let position = self.append(&mut state, topic, message);
        self.shared.data_ready.notify_all();
        Ok(position)
    }

    /// Mark `topic` as finished. Consumers see the end once they caught up.
    pub fn close_topic(&self, topic: &str) -> Result<()> {
        self.lock()?.topic_mut(topic).closed = true;
        self.shared.data_ready.notify_all();
        Ok(())
    }

    /// Every committed message of `topic`, by partition then offset.
    pub fn read_committed(&self, topic: &str) -> Result<Vec<ConsumedMessage>> {
        let state = self.lock()?;
        let Some(topic) = state.topics.get(topic) else {
            return Ok(Vec::new());
        };
        Ok(topic
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, messages)| {
                messages
                    .iter()
                    .enumerate()
                    .map(move |(offset, message)| consumed(partition as PartitionId, offset as Offset, message))
            })
            .collect())
    }

    /// Ids of transactions that are neither committed nor aborted, sorted.
    pub fn open_transactions(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.lock()?.open_transactions.keys().cloned().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn committed_offsets(&self, group_id: &str, topic: &str) -> Result<BTreeMap<PartitionId, Offset>> {
        Ok(self
            .lock()?
            .committed_offsets
            .get(&(group_id.to_string(), topic.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    /// Make every write to `topic` fail until switched off again.
    pub fn fail_publishes(&self, topic: &str, failing: bool) -> Result<()> {
        let mut state = self.lock()?;
        if failing {
            state.failing_topics.insert(topic.to_string());
        } else {
            state.failing_topics.remove(topic);
        }
        Ok(())
    }

    fn append(&self, state: &mut BrokerState, topic: &str, message: OutgoingMessage) -> (PartitionId, Offset) {
        let topic = state.topic_mut(topic);
        let partition_count = topic.partitions.len();
        let partition = match &message.key {
            Some(key) => (self.shared.key_hasher.hash_one(key.as_slice()) % partition_count as u64) as usize,
            None => {
                let partition = topic.next_partition % partition_count;
                topic.next_partition = topic.next_partition.wrapping_add(1);
                partition
            }
        };
        let log = &mut topic.partitions[partition];
        log.push(message);
        (partition as PartitionId, (log.len() - 1) as Offset)
    }

    fn commit_open_transaction(&self, state: &mut BrokerState, transactional_id: &str) -> bool {
        let Some(messages) = state.open_transactions.remove(transactional_id) else {
            return false;
        };
        for (topic, message) in messages {
            self.append(state, &topic, message);
        }
        self.shared.data_ready.notify_all();
        true
    }
}

fn consumed(partition: PartitionId, offset: Offset, message: &OutgoingMessage) -> ConsumedMessage {
    ConsumedMessage {
        partition,
        offset,
        key: message.key.clone(),
        payload: message.payload.clone(),
        timestamp: message.timestamp,
    }
}

impl BrokerClient for MemoryBroker {
    fn address(&self) -> &str {
        &self.shared.address
    }

    fn consumer(&self, topic: &str, group_id: &str) -> Result<Box<dyn BrokerConsumer>> {
        let mut state = self.lock()?;
        state.topic_mut(topic);
        let positions = state
            .committed_offsets
            .get(&(group_id.to_string(), topic.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            positions,
        }))
    }

    fn producer(&self, transactional_id: Option<&str>) -> Result<Box<dyn BrokerProducer>> {
        Ok(Box::new(MemoryProducer {
            broker: self.clone(),
            transactional_id: transactional_id.map(str::to_string),
            in_transaction: false,
        }))
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn commit_prepared(&self, transactional_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(self.commit_open_transaction(&mut state, transactional_id))
    }

    fn abort_prepared(&self, prefix: &str) -> Result<usize> {
        let owned = format!("{prefix}-");
        let mut state = self.lock()?;
        let before = state.open_transactions.len();
        state
            .open_transactions
            .retain(|transactional_id, _| !transactional_id.starts_with(&owned));
        Ok(before - state.open_transactions.len())
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    topic: String,
    group_id: String,
    positions: BTreeMap<PartitionId, Offset>,
}

impl BrokerConsumer for MemoryConsumer {
    fn partitions(&self) -> Result<Vec<PartitionId>> {
        let mut state = self.broker.lock()?;
        let count = state.topic_mut(&self.topic).partitions.len();
        Ok((0..count as PartitionId).collect())
    }

    fn seek(&mut self, partition: PartitionId, offset: Offset) -> Result<()> {
        self.positions.insert(partition, offset);
        Ok(())
    }

    fn poll(&mut self, max_messages: usize, timeout: Duration) -> Result<PollResult> {
        let deadline = Instant::now() + timeout;
        let mut state = self.broker.lock()?;
        loop {
            let topic = state.topic_mut(&self.topic);
            let mut batch = Vec::new();
            for (partition, log) in topic.partitions.iter().enumerate() {
                let partition = partition as PartitionId;
                let position = self.positions.entry(partition).or_insert(0);
                while batch.len() < max_messages && (*position as usize) < log.len() {
                    batch.push(consumed(partition, *position, &log[*position as usize]));
                    *position += 1;
                }
            }
            if !batch.is_empty() {
                return Ok(PollResult::Messages(batch));
            }
            if topic.closed {
                return Ok(PollResult::EndOfTopic);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(PollResult::Idle);
            }
            let (guard, _) = self
                .broker
                .shared
                .data_ready
                .wait_timeout(state, deadline - now)
                .map_err(|_| anyhow!("memory broker lock poisoned"))?;
            state = guard;
        }
    }

    fn commit_offsets(&mut self, offsets: &BTreeMap<PartitionId, Offset>) -> Result<()> {
        self.broker
            .lock()?
            .committed_offsets
            .entry((self.group_id.clone(), self.topic.clone()))
            .or_default()
            .extend(offsets.iter().map(|(p, o)| (*p, *o)));
        Ok(())
    }
}

struct MemoryProducer {
    broker: MemoryBroker,
    transactional_id: Option<String>,
    in_transaction: bool,
}

impl MemoryProducer {
    fn require_transaction(&self) -> Result<&str> {
        match &self.transactional_id {
            Some(id) if self.in_transaction => Ok(id),
            Some(id) => Err(anyhow!("transaction {id} has not begun")),
            None => Err(anyhow!("producer is not transactional")),
        }
    }
}

impl BrokerProducer for MemoryProducer {
    fn begin_transaction(&mut self) -> Result<()> {
        let Some(id) = &self.transactional_id else {
            return Err(anyhow!("producer is not transactional"));
        };
        if self.in_transaction {
            return Err(anyhow!("transaction {id} is already open"));
        }
        let mut state = self.broker.lock()?;
        if state.open_transactions.contains_key(id) {
            return Err(anyhow!("transaction {id} is open in another producer"));
        }
        state.open_transactions.insert(id.clone(), Vec::new());
        self.in_transaction = true;
        Ok(())
    }

    fn send(&mut self, topic: &str, message: OutgoingMessage) -> Result<()> {
        if self.transactional_id.is_none() {
            self.broker.publish(topic, message)?;
            return Ok(());
        }
        let id = self.require_transaction()?;
        let mut state = self.broker.lock()?;
        if state.failing_topics.contains(topic) {
            return Err(anyhow!("broker rejected write to topic {topic}"));
        }
        state
            .open_transactions
            .get_mut(id)
            .ok_or_else(|| anyhow!("transaction {id} was aborted by the broker"))?
            .push((topic.to_string(), message));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        let id = self.require_transaction()?.to_string();
        let mut state = self.broker.lock()?;
        self.in_transaction = false;
        if !self.broker.commit_open_transaction(&mut state, &id) {
            return Err(anyhow!("transaction {id} is no longer open"));
        }
        Ok(())
    }

    fn abort_transaction(&mut self) -> Result<()> {
        let id = self.require_transaction()?.to_string();
        self.in_transaction = false;
        self.broker.lock()?.open_transactions.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;

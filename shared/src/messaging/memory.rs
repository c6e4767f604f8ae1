//! In-process partitioned log implementing the broker traits.
//!
//! Mirrors the Kafka semantics the gateway relies on: topics must exist
//! before use, keys are assigned to partitions with the Kafka `murmur2`
//! hash, offsets grow by one per append within a partition, and consumers
//! start at the tail. Faults can be injected per topic for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    ConsumedRecord, DeliveryAck, EventConsumer, EventProducer, EventRecord, MessageBroker,
    MessageError, MessageResult,
};

const DEFAULT_PARTITIONS: usize = 3;
const SUBSCRIBER_CAPACITY: usize = 1024;

/// Kafka's murmur2 variant, as used by its default key partitioner.
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;

    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();
    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    match tail.len() {
        3 => {
            h ^= (tail[2] as u32) << 16;
            h ^= (tail[1] as u32) << 8;
            h ^= tail[0] as u32;
            h = h.wrapping_mul(M);
        }
        2 => {
            h ^= (tail[1] as u32) << 8;
            h ^= tail[0] as u32;
            h = h.wrapping_mul(M);
        }
        1 => {
            h ^= tail[0] as u32;
            h = h.wrapping_mul(M);
        }
        _ => {}
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Partition for a key, matching the Kafka producer's `murmur2` partitioner.
pub fn partition_for(key: &[u8], partitions: usize) -> usize {
    ((murmur2(key) & 0x7fff_ffff) as usize) % partitions.max(1)
}

struct TopicLog {
    name: String,
    partitions: Vec<Mutex<Vec<ConsumedRecord>>>,
    notify: broadcast::Sender<ConsumedRecord>,
    publish_failure: Mutex<Option<String>>,
    publish_latency: Mutex<Duration>,
    publish_attempts: AtomicUsize,
    failing_reads: AtomicUsize,
}

impl TopicLog {
    fn new(name: &str, partitions: usize) -> Self {
        let (notify, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            name: name.to_string(),
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            notify,
            publish_failure: Mutex::new(None),
            publish_latency: Mutex::new(Duration::ZERO),
            publish_attempts: AtomicUsize::new(0),
            failing_reads: AtomicUsize::new(0),
        }
    }

    fn append(&self, record: EventRecord) -> DeliveryAck {
        let partition = partition_for(&record.key, self.partitions.len());

        // Subscribers are notified under the partition lock so they observe
        // offsets in append order.
        let mut log = self.partitions[partition].lock();
        let consumed = ConsumedRecord {
            topic: self.name.clone(),
            partition: partition as i32,
            offset: log.len() as i64,
            key: Some(record.key),
            value: Some(record.value),
            timestamp: Some(record.timestamp),
            headers: record.headers,
        };
        log.push(consumed.clone());

        let ack = DeliveryAck {
            topic: self.name.clone(),
            partition: consumed.partition,
            offset: consumed.offset,
        };

        // No subscribers is not an error: the record stays in the log
        let _ = self.notify.send(consumed);
        ack
    }
}

/// Broker that keeps every topic in process memory
#[derive(Clone)]
pub struct InMemoryBroker {
    topics: Arc<RwLock<HashMap<String, Arc<TopicLog>>>>,
    partitions: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            partitions: partitions.max(1),
        }
    }

    /// Create a topic; existing topics are left untouched.
    pub fn create_topic(&self, name: &str) {
        self.topics
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new(name, self.partitions)));
    }

    pub fn with_topics<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.create_topic(name.as_ref());
        }
        self
    }

    /// Sends that reached `topic`, counted before any latency or failure applies
    pub fn publish_attempts(&self, topic: &str) -> usize {
        self.topic(topic)
            .map(|log| log.publish_attempts.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Every record appended to `topic`, ordered by partition then offset
    pub fn records(&self, topic: &str) -> Vec<ConsumedRecord> {
        self.topic(topic)
            .map(|log| {
                log.partitions
                    .iter()
                    .flat_map(|partition| partition.lock().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Make every publish to `topic` fail with `cause` until cleared with `None`.
    pub fn set_publish_failure(&self, topic: &str, cause: Option<&str>) {
        if let Some(log) = self.topic(topic) {
            *log.publish_failure.lock() = cause.map(str::to_string);
        }
    }

    /// Delay every publish to `topic` before the append happens.
    pub fn set_publish_latency(&self, topic: &str, latency: Duration) {
        if let Some(log) = self.topic(topic) {
            *log.publish_latency.lock() = latency;
        }
    }

    /// Make the next `count` reads on `topic` fail, one per consumer call.
    pub fn fail_next_reads(&self, topic: &str, count: usize) {
        if let Some(log) = self.topic(topic) {
            log.failing_reads.store(count, Ordering::SeqCst);
        }
    }

    fn topic(&self, name: &str) -> Option<Arc<TopicLog>> {
        self.topics.read().get(name).cloned()
    }

    fn require_topic(&self, name: &str) -> MessageResult<Arc<TopicLog>> {
        self.topic(name)
            .ok_or_else(|| MessageError::Topic(format!("topic {} does not exist", name)))
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn producer(&self, topic: &str) -> MessageResult<Arc<dyn EventProducer>> {
        let log = self.require_topic(topic)?;
        Ok(Arc::new(InMemoryProducer {
            log,
            closed: AtomicBool::new(false),
        }))
    }

    async fn consumer(&self, topic: &str, group_id: &str) -> MessageResult<Box<dyn EventConsumer>> {
        let log = self.require_topic(topic)?;
        let receiver = log.notify.subscribe();
        Ok(Box::new(InMemoryConsumer {
            log,
            receiver,
            group_id: group_id.to_string(),
        }))
    }
}

struct InMemoryProducer {
    log: Arc<TopicLog>,
    closed: AtomicBool,
}

#[async_trait]
impl EventProducer for InMemoryProducer {
    fn topic(&self) -> &str {
        &self.log.name
    }

    async fn send(&self, record: EventRecord, timeout: Duration) -> MessageResult<DeliveryAck> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessageError::Closed(self.log.name.clone()));
        }

        self.log.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let latency = *self.log.publish_latency.lock();
        let write = async {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let failure = self.log.publish_failure.lock().clone();
            match failure {
                Some(cause) => Err(MessageError::Publish {
                    topic: self.log.name.clone(),
                    cause,
                }),
                None => Ok(self.log.append(record)),
            }
        };

        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| MessageError::Timeout {
                topic: self.log.name.clone(),
                timeout,
            })?
    }

    async fn close(&self, _timeout: Duration) -> MessageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        debug!(topic = %self.log.name, "In-memory producer closed");
        Ok(())
    }
}

struct InMemoryConsumer {
    log: Arc<TopicLog>,
    receiver: broadcast::Receiver<ConsumedRecord>,
    group_id: String,
}

#[async_trait]
impl EventConsumer for InMemoryConsumer {
    fn topic(&self) -> &str {
        &self.log.name
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn recv(&mut self) -> MessageResult<ConsumedRecord> {
        let injected = self
            .log
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MessageError::Consume {
                topic: self.log.name.clone(),
                cause: "injected read failure".to_string(),
            });
        }

        match self.receiver.recv().await {
            Ok(record) => Ok(record),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(MessageError::Consume {
                topic: self.log.name.clone(),
                cause: format!("consumer lagged, {} records skipped", skipped),
            }),
            Err(broadcast::error::RecvError::Closed) => {
                Err(MessageError::Closed(self.log.name.clone()))
            }
        }
    }

    async fn close(&mut self) {
        debug!(topic = %self.log.name, group_id = %self.group_id, "In-memory consumer closed");
    }
}

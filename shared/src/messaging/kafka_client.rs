//! Kafka implementation of the broker traits, backed by librdkafka.
//!
//! Producers hash the record key with the `murmur2` partitioner, so every
//! record of one event type lands on the same partition. Topics are never
//! created implicitly: producer construction fails when the topic is absent
//! from the cluster metadata.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, info};

use super::{
    ConsumedRecord, DeliveryAck, EventConsumer, EventProducer, EventRecord, MessageBroker,
    MessageError, MessageResult,
};

/// Kafka client configuration
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    /// Upper bound librdkafka spends delivering one message
    pub message_timeout: Duration,
    /// Upper bound on metadata requests issued during startup
    pub metadata_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "events-service".to_string(),
            message_timeout: Duration::from_secs(5),
            metadata_timeout: Duration::from_secs(5),
        }
    }
}

impl KafkaConfig {
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.bootstrap_servers())
            .set("client.id", &self.client_id)
            .set("allow.auto.create.topics", "false");
        client_config
    }
}

/// Creates rdkafka-backed handles for individual topics
pub struct KafkaBroker {
    config: KafkaConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn producer(&self, topic: &str) -> MessageResult<Arc<dyn EventProducer>> {
        let producer = KafkaProducer::new(&self.config, topic)?;
        producer.verify_topic(self.config.metadata_timeout).await?;
        Ok(Arc::new(producer))
    }

    async fn consumer(&self, topic: &str, group_id: &str) -> MessageResult<Box<dyn EventConsumer>> {
        let consumer = KafkaConsumer::new(&self.config, topic, group_id)?;
        Ok(Box::new(consumer))
    }
}

/// Producer bound to one topic
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig, topic: &str) -> MessageResult<Self> {
        let producer: FutureProducer = config
            .client_config()
            .set("partitioner", "murmur2")
            .set("acks", "all")
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| {
                MessageError::Connection(format!(
                    "failed to create producer for {} on {}: {}",
                    topic,
                    config.bootstrap_servers(),
                    e
                ))
            })?;

        info!(
            topic = %topic,
            bootstrap_servers = %config.bootstrap_servers(),
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }

    /// Fail unless the topic already exists on the cluster.
    pub async fn verify_topic(&self, timeout: Duration) -> MessageResult<()> {
        let producer = self.producer.clone();
        let topic = self.topic.clone();

        let metadata = tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(Some(topic.as_str()), timeout)
        })
        .await
        .map_err(|e| MessageError::Connection(e.to_string()))?
        .map_err(|e| {
            MessageError::Connection(format!("metadata request for {} failed: {}", self.topic, e))
        })?;

        let found = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .filter(|t| t.error().is_none() && !t.partitions().is_empty());

        match found {
            Some(t) => {
                debug!(topic = %self.topic, partitions = t.partitions().len(), "Topic verified");
                Ok(())
            }
            None => Err(MessageError::Topic(format!(
                "topic {} does not exist",
                self.topic
            ))),
        }
    }
}

#[async_trait]
impl EventProducer for KafkaProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, record: EventRecord, timeout: Duration) -> MessageResult<DeliveryAck> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let future_record = FutureRecord::to(&self.topic)
            .key(record.key.as_ref())
            .payload(record.value.as_ref())
            .timestamp(record.timestamp.timestamp_millis())
            .headers(headers);

        let delivery = tokio::time::timeout(
            timeout,
            self.producer.send(future_record, Timeout::After(timeout)),
        )
        .await;

        match delivery {
            Ok(Ok((partition, offset))) => Ok(DeliveryAck {
                topic: self.topic.clone(),
                partition,
                offset,
            }),
            Ok(Err((err, _))) => Err(MessageError::Publish {
                topic: self.topic.clone(),
                cause: err.to_string(),
            }),
            Err(_) => Err(MessageError::Timeout {
                topic: self.topic.clone(),
                timeout,
            }),
        }
    }

    async fn close(&self, timeout: Duration) -> MessageResult<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| MessageError::Connection(e.to_string()))?
            .map_err(|e| MessageError::Publish {
                topic: self.topic.clone(),
                cause: format!("flush failed: {}", e),
            })?;

        info!(topic = %self.topic, "Kafka producer flushed and closed");
        Ok(())
    }
}

/// Consumer bound to one topic and group.
///
/// Offsets are never committed and `auto.offset.reset` is `latest`, so every
/// start positions the cursor at the current tail of each partition.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
    group_id: String,
}

impl KafkaConsumer {
    pub fn new(config: &KafkaConfig, topic: &str, group_id: &str) -> MessageResult<Self> {
        let consumer: StreamConsumer = config
            .client_config()
            .set("group.id", group_id)
            .set("auto.offset.reset", "latest")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "30000")
            .create()
            .map_err(|e| {
                MessageError::Connection(format!(
                    "failed to create consumer for {} on {}: {}",
                    topic,
                    config.bootstrap_servers(),
                    e
                ))
            })?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| MessageError::Subscription(format!("{}: {}", topic, e)))?;

        info!(
            topic = %topic,
            group_id = %group_id,
            bootstrap_servers = %config.bootstrap_servers(),
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            group_id: group_id.to_string(),
        })
    }
}

fn to_consumed_record(message: &BorrowedMessage<'_>) -> ConsumedRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    let value = header
                        .value
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .unwrap_or_default();
                    (header.key.to_string(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    ConsumedRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message.payload().map(Bytes::copy_from_slice),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        headers,
    }
}

#[async_trait]
impl EventConsumer for KafkaConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn recv(&mut self) -> MessageResult<ConsumedRecord> {
        match self.consumer.recv().await {
            Ok(message) => Ok(to_consumed_record(&message)),
            Err(e) => Err(MessageError::Consume {
                topic: self.topic.clone(),
                cause: e.to_string(),
            }),
        }
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        info!(topic = %self.topic, group_id = %self.group_id, "Kafka consumer closed");
    }
}

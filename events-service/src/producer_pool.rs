//! One long-lived producer per registered topic

use bytes::Bytes;
use futures::future::join_all;
use shared::messaging::{
    DeliveryAck, EventProducer, EventRecord, MessageBroker, MessageError, HEADER_CONTENT_TYPE,
    HEADER_EVENT_TYPE,
};
use shared::observability::{metric_names, publish_span, MetricsCollector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

use crate::registry::{RegistryError, TopicName, TopicRegistry};

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    UnknownEventType(#[from] RegistryError),

    #[error("No producer registered for topic {0}")]
    NoProducer(String),

    #[error("Publish to {topic} failed: {source}")]
    PublishFailed {
        topic: String,
        #[source]
        source: MessageError,
    },
}

pub struct ProducerPool {
    registry: Arc<TopicRegistry>,
    producers: HashMap<TopicName, Arc<dyn EventProducer>>,
    metrics: Arc<MetricsCollector>,
    closed: AtomicBool,
}

impl ProducerPool {
    /// Create a producer for every topic in the registry.
    ///
    /// Fails on the first topic the broker refuses, so the caller never holds
    /// a partially built pool.
    pub async fn connect(
        registry: Arc<TopicRegistry>,
        broker: &dyn MessageBroker,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, MessageError> {
        let mut producers = HashMap::with_capacity(registry.len());
        for (event_type, topic) in registry.iter() {
            let producer = broker.producer(topic.as_str()).await?;
            info!(event_type = %event_type, topic = %topic, "Producer ready");
            producers.insert(topic.clone(), producer);
        }

        Ok(Self::from_producers(registry, producers, metrics))
    }

    pub fn from_producers(
        registry: Arc<TopicRegistry>,
        producers: HashMap<TopicName, Arc<dyn EventProducer>>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            producers,
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    /// Hand one payload to the broker and wait for its acknowledgement.
    ///
    /// The record is keyed by the event type so every record of one type
    /// lands on the same partition. Failures are returned as-is, never retried.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: Bytes,
        headers: Vec<(String, String)>,
        deadline: Duration,
    ) -> Result<DeliveryAck, PublishError> {
        let (event_type, topic) = self.registry.resolve(event_type)?;
        let producer = self
            .producers
            .get(topic)
            .ok_or_else(|| PublishError::NoProducer(topic.to_string()))?;

        let mut record = EventRecord::new(event_type.as_str().to_owned(), payload)
            .with_header(HEADER_EVENT_TYPE, event_type.as_str())
            .with_header(HEADER_CONTENT_TYPE, JSON_CONTENT_TYPE);
        for (name, value) in headers {
            if name == HEADER_EVENT_TYPE || name == HEADER_CONTENT_TYPE {
                continue;
            }
            record = record.with_header(name, value);
        }

        let result = producer
            .send(record, deadline)
            .instrument(publish_span(event_type.as_str(), topic.as_str()))
            .await;

        match result {
            Ok(ack) => {
                self.metrics
                    .increment_labeled(metric_names::EVENTS_PUBLISHED_TOTAL, event_type.as_str());
                debug!(
                    event_type = %event_type,
                    topic = %ack.topic,
                    partition = ack.partition,
                    offset = ack.offset,
                    "Event published"
                );
                Ok(ack)
            }
            Err(source) => {
                self.metrics.increment_labeled(
                    metric_names::EVENTS_PUBLISH_FAILED_TOTAL,
                    event_type.as_str(),
                );
                warn!(event_type = %event_type, topic = %topic, error = %source, "Publish failed");
                Err(PublishError::PublishFailed {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    /// Flush and close every producer. Only the first call does any work.
    pub async fn close_all(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let closes = self.producers.iter().map(|(topic, producer)| async move {
            match producer.close(timeout).await {
                Ok(()) => info!(topic = %topic, "Producer closed"),
                Err(e) => warn!(topic = %topic, error = %e, "Producer did not close cleanly"),
            }
        });
        join_all(closes).await;
    }
}

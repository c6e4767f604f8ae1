//! Background read loops, one per registered topic

use shared::messaging::{
    ConsumedRecord, EventConsumer, MessageBroker, MessageError, HEADER_EVENT_TYPE,
};
use shared::observability::{consume_span, metric_names, MetricsCollector};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::registry::{TopicName, TopicRegistry};

/// Pause after a failed read before asking the broker again
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(200);

pub struct ConsumerPool {
    registry: Arc<TopicRegistry>,
    metrics: Arc<MetricsCollector>,
    idle: Vec<Box<dyn EventConsumer>>,
    tasks: Vec<(TopicName, JoinHandle<()>)>,
    cancel: CancellationToken,
}

impl ConsumerPool {
    /// Subscribe one consumer per topic under `group_id`.
    ///
    /// Subscriptions start at the tail, so records published before this call
    /// are never delivered.
    pub async fn connect(
        registry: Arc<TopicRegistry>,
        broker: &dyn MessageBroker,
        group_id: &str,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, MessageError> {
        let mut idle = Vec::with_capacity(registry.len());
        for topic in registry.topics() {
            let consumer = broker.consumer(topic.as_str(), group_id).await?;
            info!(topic = %topic, group_id = %group_id, "Consumer subscribed");
            idle.push(consumer);
        }

        Ok(Self {
            registry,
            metrics,
            idle,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn a read loop for every subscribed consumer.
    ///
    /// Loops stop when `cancel` fires or when [`ConsumerPool::shutdown`] runs.
    pub fn start(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;

        for consumer in self.idle.drain(..) {
            let topic = self.registry.topics().find(|t| t.as_str() == consumer.topic()).cloned();
            let Some(topic) = topic else {
                warn!(topic = %consumer.topic(), "Consumer topic is not registered, skipping");
                continue;
            };
            let fallback_event_type = self
                .registry
                .event_type_for(topic.as_str())
                .map(|e| e.to_string())
                .unwrap_or_default();
            let span = consume_span(consumer.topic(), consumer.group_id());

            let handle = tokio::spawn(
                read_loop(
                    consumer,
                    fallback_event_type,
                    self.metrics.clone(),
                    self.cancel.clone(),
                )
                .instrument(span),
            );
            self.tasks.push((topic, handle));
        }

        self.metrics
            .set_gauge(metric_names::CONSUMER_LOOPS_ACTIVE, self.tasks.len() as u64);
        info!(loops = self.tasks.len(), "Consumer loops started");
    }

    pub fn running(&self) -> usize {
        self.tasks.iter().filter(|(_, handle)| !handle.is_finished()).count()
    }

    /// Cancel every loop and wait up to `timeout` for them to exit.
    ///
    /// Loops still running at the deadline are aborted.
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.cancel.cancel();

        for mut consumer in self.idle.drain(..) {
            consumer.close().await;
        }

        let deadline = Instant::now() + timeout;
        for (topic, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(topic = %topic, "Consumer loop joined"),
                Ok(Err(e)) => error!(topic = %topic, error = %e, "Consumer loop panicked"),
                Err(_) => {
                    warn!(topic = %topic, "Consumer loop did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.metrics.set_gauge(metric_names::CONSUMER_LOOPS_ACTIVE, 0);
        info!("Consumer loops stopped");
    }
}

async fn read_loop(
    mut consumer: Box<dyn EventConsumer>,
    fallback_event_type: String,
    metrics: Arc<MetricsCollector>,
    cancel: CancellationToken,
) {
    let topic = consumer.topic().to_string();
    debug!("Consumer loop running");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = consumer.recv() => match result {
                Ok(record) => observe(&record, &fallback_event_type, &metrics),
                Err(MessageError::Closed(_)) => {
                    warn!("Consumer closed underneath the loop");
                    break;
                }
                Err(e) => {
                    metrics.increment_labeled(metric_names::CONSUMER_ERRORS_TOTAL, &topic);
                    warn!(error = %e, transient = e.is_transient(), "Consumer read failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }

    consumer.close().await;
    debug!("Consumer loop exited");
}

fn observe(record: &ConsumedRecord, fallback_event_type: &str, metrics: &MetricsCollector) {
    let event_type = record.header(HEADER_EVENT_TYPE).unwrap_or(fallback_event_type);

    info!(
        event_type = %event_type,
        topic = %record.topic,
        partition = record.partition,
        offset = record.offset,
        key = %record.key_str(),
        value = %record.value_str(),
        "Event consumed"
    );
    metrics.increment_labeled(metric_names::EVENTS_CONSUMED_TOTAL, &record.topic);
}

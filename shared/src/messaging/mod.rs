/// Messaging and broker abstractions
pub mod kafka_client;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

pub use kafka_client::{KafkaBroker, KafkaConfig, KafkaConsumer, KafkaProducer};
pub use memory::InMemoryBroker;

/// Record header carrying the logical event type
pub const HEADER_EVENT_TYPE: &str = "event_type";
/// Record header carrying the content type of the value
pub const HEADER_CONTENT_TYPE: &str = "content_type";
/// Record header carrying the caller's correlation id
pub const HEADER_CORRELATION_ID: &str = "correlation_id";

/// A unit of data handed to the broker.
///
/// The key drives partition selection, the value is carried as opaque bytes.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub key: Bytes,
    pub value: Bytes,
    pub timestamp: DateTime<Utc>,
    pub headers: Vec<(String, String)>,
}

impl EventRecord {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp: Utc::now(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Broker acknowledgement of a durable append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A record read back from a topic
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: Vec<(String, String)>,
}

impl ConsumedRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn key_str(&self) -> Cow<'_, str> {
        self.key
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or(Cow::Borrowed(""))
    }

    pub fn value_str(&self) -> Cow<'_, str> {
        self.value
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or(Cow::Borrowed(""))
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Message broker errors
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Topic error: {0}")]
    Topic(String),

    #[error("Publish to {topic} failed: {cause}")]
    Publish { topic: String, cause: String },

    #[error("Publish to {topic} timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Consume from {topic} failed: {cause}")]
    Consume { topic: String, cause: String },

    #[error("Client for {0} is closed")]
    Closed(String),
}

impl MessageError {
    /// Returns true if a later attempt on the same handle may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MessageError::Connection(_)
                | MessageError::Publish { .. }
                | MessageError::Timeout { .. }
                | MessageError::Consume { .. }
        )
    }
}

pub type MessageResult<T> = Result<T, MessageError>;

/// Write side of a single topic.
///
/// Implementations are shared between concurrent callers.
#[async_trait]
pub trait EventProducer: Send + Sync {
    /// Topic this producer is bound to
    fn topic(&self) -> &str;

    /// Append a record, waiting at most `timeout` for the broker acknowledgement
    async fn send(&self, record: EventRecord, timeout: Duration) -> MessageResult<DeliveryAck>;

    /// Flush outstanding writes and release the session
    async fn close(&self, timeout: Duration) -> MessageResult<()>;
}

/// Read side of a single topic, owned by exactly one loop.
#[async_trait]
pub trait EventConsumer: Send {
    /// Topic this consumer is subscribed to
    fn topic(&self) -> &str;

    /// Group identity the read position is tracked under
    fn group_id(&self) -> &str;

    /// Wait for the next record.
    ///
    /// Dropping the returned future must not lose a record, so callers can
    /// race it against a cancellation signal.
    async fn recv(&mut self) -> MessageResult<ConsumedRecord>;

    /// Leave the group and release the session
    async fn close(&mut self);
}

/// Factory for per-topic producer and consumer handles
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn producer(&self, topic: &str) -> MessageResult<Arc<dyn EventProducer>>;

    async fn consumer(&self, topic: &str, group_id: &str) -> MessageResult<Box<dyn EventConsumer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_headers_keep_insertion_order() {
        let record = EventRecord::new("movie", r#"{"id":1}"#)
            .with_header(HEADER_EVENT_TYPE, "movie")
            .with_header(HEADER_CONTENT_TYPE, "application/json");

        assert_eq!(record.header(HEADER_EVENT_TYPE), Some("movie"));
        assert_eq!(record.headers[1].0, HEADER_CONTENT_TYPE);
        assert_eq!(record.header("missing"), None);
    }

    #[test]
    fn test_consumed_record_lossy_strings() {
        let record = ConsumedRecord {
            topic: "movie-events".to_string(),
            partition: 0,
            offset: 7,
            key: Some(Bytes::from_static(b"movie")),
            value: None,
            timestamp: None,
            headers: Vec::new(),
        };

        assert_eq!(record.key_str(), "movie");
        assert_eq!(record.value_str(), "");
    }

    #[test]
    fn test_transient_errors() {
        assert!(MessageError::Consume {
            topic: "t".to_string(),
            cause: "broker down".to_string()
        }
        .is_transient());
        assert!(!MessageError::Topic("missing".to_string()).is_transient());
        assert!(!MessageError::Closed("t".to_string()).is_transient());
    }
}

//! Span helpers for broker operations

use tracing::Span;

/// Span wrapping one publish to the broker
pub fn publish_span(event_type: &str, topic: &str) -> Span {
    tracing::info_span!(
        "broker_publish",
        event_type = %event_type,
        topic = %topic
    )
}

/// Span covering the lifetime of one consumer loop
pub fn consume_span(topic: &str, group_id: &str) -> Span {
    tracing::info_span!(
        "broker_consume",
        topic = %topic,
        group_id = %group_id
    )
}

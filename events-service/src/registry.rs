//! Mapping from logical event type to physical topic

use crate::config::TopicsConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Logical event type, as it appears in the request path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Topic name as the broker knows it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TopicName(String);

impl TopicName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown event type: {0}")]
    NotFound(String),
}

/// Immutable event type to topic table, built once at startup.
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    routes: BTreeMap<EventType, TopicName>,
}

impl TopicRegistry {
    pub fn from_config(topics: &TopicsConfig) -> Self {
        Self::from_pairs(topics.entries())
    }

    pub fn from_pairs<I, E, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (E, T)>,
        E: Into<String>,
        T: Into<String>,
    {
        let routes = pairs
            .into_iter()
            .map(|(event_type, topic)| (EventType(event_type.into()), TopicName(topic.into())))
            .collect();
        Self { routes }
    }

    /// Look up the topic for a raw event type string
    pub fn resolve(&self, event_type: &str) -> Result<(&EventType, &TopicName), RegistryError> {
        self.routes
            .get_key_value(event_type)
            .ok_or_else(|| RegistryError::NotFound(event_type.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EventType, &TopicName)> {
        self.routes.iter()
    }

    pub fn topics(&self) -> impl Iterator<Item = &TopicName> {
        self.routes.values()
    }

    /// Event type routed to the given topic
    pub fn event_type_for(&self, topic: &str) -> Option<&EventType> {
        self.routes
            .iter()
            .find(|(_, name)| name.as_str() == topic)
            .map(|(event_type, _)| event_type)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

impl std::borrow::Borrow<str> for EventType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_topics_resolve() {
        let registry = TopicRegistry::from_config(&TopicsConfig::default());

        assert_eq!(registry.len(), 3);
        for event_type in ["movie", "user", "payment"] {
            let (resolved, topic) = registry.resolve(event_type).unwrap();
            assert_eq!(resolved.as_str(), event_type);
            assert_eq!(topic.as_str(), format!("{}-events", event_type));
        }
    }

    #[test]
    fn test_overridden_topic() {
        let topics = TopicsConfig {
            payment: "billing".to_string(),
            ..Default::default()
        };
        let registry = TopicRegistry::from_config(&topics);

        assert_eq!(registry.resolve("payment").unwrap().1.as_str(), "billing");
        assert_eq!(registry.event_type_for("billing").unwrap().as_str(), "payment");
    }

    #[test]
    fn test_unknown_event_type() {
        let registry = TopicRegistry::from_config(&TopicsConfig::default());

        for unknown in ["", "Movie", "health", "orders", "movie "] {
            assert_eq!(
                registry.resolve(unknown),
                Err(RegistryError::NotFound(unknown.to_string()))
            );
        }
    }

    #[test]
    fn test_iteration_is_ordered() {
        let registry = TopicRegistry::from_pairs([("user", "u"), ("movie", "m")]);
        let names: Vec<&str> = registry.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(names, vec!["movie", "user"]);
    }
}

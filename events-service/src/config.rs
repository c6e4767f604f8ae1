use serde::{Deserialize, Serialize};
use shared::messaging::KafkaConfig;
use shared::observability::{LogFormat, LogLevel};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub kafka: KafkaSettings,
    pub topics: TopicsConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener and request handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub publish_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub header_read_timeout_secs: u64,
    pub body_read_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8082,
            publish_timeout_secs: 5,
            shutdown_grace_secs: 10,
            header_read_timeout_secs: 10,
            body_read_timeout_secs: 30,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Which broker implementation backs the pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    Kafka,
    /// In-process log, for running without a cluster
    Memory,
}

impl FromStr for BrokerBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kafka" => Ok(BrokerBackend::Kafka),
            "memory" => Ok(BrokerBackend::Memory),
            other => Err(ConfigError::InvalidValue(format!(
                "Invalid EVENTS_BROKER_BACKEND: {}",
                other
            ))),
        }
    }
}

/// Broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub client_id: String,
    pub consumer_group: String,
    pub backend: BrokerBackend,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "events-service".to_string(),
            consumer_group: "events-service".to_string(),
            backend: BrokerBackend::Kafka,
        }
    }
}

/// Physical topic per recognized event type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub movie: String,
    pub user: String,
    pub payment: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            movie: "movie-events".to_string(),
            user: "user-events".to_string(),
            payment: "payment-events".to_string(),
        }
    }
}

impl TopicsConfig {
    /// `(event type, topic)` pairs for every recognized event type
    pub fn entries(&self) -> [(&'static str, &str); 3] {
        [
            ("movie", self.movie.as_str()),
            ("user", self.user.as_str()),
            ("payment", self.payment.as_str()),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("Invalid {}: {}", key, value)))
}

fn split_brokers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Parse a TOML file; missing keys keep their defaults
    fn read_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration with priority: env -> file -> defaults
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(|key| std::env::var(key).ok())
    }

    /// Same as `load`, reading variables from an arbitrary key/value source
    pub fn load_from<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("CONFIG_FILE") {
            Some(path) => Self::read_file(path)?,
            None => Config::default(),
        };
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_value("PORT", &port)?;
        }
        if let Some(secs) = lookup("PUBLISH_TIMEOUT_SECS") {
            self.server.publish_timeout_secs = parse_value("PUBLISH_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("SHUTDOWN_GRACE_SECS") {
            self.server.shutdown_grace_secs = parse_value("SHUTDOWN_GRACE_SECS", &secs)?;
        }
        if let Some(secs) = lookup("HEADER_READ_TIMEOUT_SECS") {
            self.server.header_read_timeout_secs = parse_value("HEADER_READ_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("BODY_READ_TIMEOUT_SECS") {
            self.server.body_read_timeout_secs = parse_value("BODY_READ_TIMEOUT_SECS", &secs)?;
        }
        if let Some(bytes) = lookup("MAX_BODY_BYTES") {
            self.server.max_body_bytes = parse_value("MAX_BODY_BYTES", &bytes)?;
        }

        if let Some(brokers) = lookup("KAFKA_BROKERS") {
            self.kafka.brokers = split_brokers(&brokers);
        }
        if let Some(client_id) = lookup("KAFKA_CLIENT_ID") {
            self.kafka.client_id = client_id;
        }
        if let Some(group) = lookup("KAFKA_CONSUMER_GROUP") {
            self.kafka.consumer_group = group;
        }
        if let Some(backend) = lookup("EVENTS_BROKER_BACKEND") {
            self.kafka.backend = backend.parse()?;
        }

        if let Some(topic) = lookup("MOVIE_TOPIC") {
            self.topics.movie = topic;
        }
        if let Some(topic) = lookup("USER_TOPIC") {
            self.topics.user = topic;
        }
        if let Some(topic) = lookup("PAYMENT_TOPIC") {
            self.topics.payment = topic;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("LOG_LEVEL: {}", e)))?;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("LOG_FORMAT: {}", e)))?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue(
                "Server port cannot be 0".to_string(),
            ));
        }
        if self.server.publish_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "Publish timeout must be positive".to_string(),
            ));
        }
        if self.server.shutdown_grace_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "Shutdown grace period must be positive".to_string(),
            ));
        }
        if self.server.header_read_timeout_secs == 0 || self.server.body_read_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "Request read timeouts must be positive".to_string(),
            ));
        }

        if self.kafka.brokers.is_empty() {
            return Err(ConfigError::MissingField("kafka.brokers".to_string()));
        }
        for broker in &self.kafka.brokers {
            let valid = broker
                .rsplit_once(':')
                .map(|(host, port)| {
                    !host.is_empty() && port.parse::<u16>().map(|p| p != 0).unwrap_or(false)
                })
                .unwrap_or(false);
            if !valid {
                return Err(ConfigError::InvalidValue(format!(
                    "Broker address must be host:port, got {:?}",
                    broker
                )));
            }
        }
        if self.kafka.consumer_group.trim().is_empty() {
            return Err(ConfigError::MissingField("kafka.consumer_group".to_string()));
        }

        let mut seen = HashSet::new();
        for (event_type, topic) in self.topics.entries() {
            if topic.trim().is_empty() {
                return Err(ConfigError::MissingField(format!("topics.{}", event_type)));
            }
            if !seen.insert(topic) {
                return Err(ConfigError::InvalidValue(format!(
                    "Topic {} is configured for more than one event type",
                    topic
                )));
            }
        }

        Ok(())
    }

    /// Get the server address as a string
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.server.publish_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.server.header_read_timeout_secs)
    }

    pub fn body_read_timeout(&self) -> Duration {
        Duration::from_secs(self.server.body_read_timeout_secs)
    }

    pub fn kafka_config(&self) -> KafkaConfig {
        KafkaConfig {
            brokers: self.kafka.brokers.clone(),
            client_id: self.kafka.client_id.clone(),
            message_timeout: self.publish_timeout(),
            ..Default::default()
        }
    }
}

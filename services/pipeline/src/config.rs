//! Kafka configuration for the capture pipeline.
//!
//! Shared by every service that produces or consumes capture events, so the
//! broker, security and topic settings are spelled the same way everywhere.
//! Each section renders to librdkafka properties through
//! [`KafkaConfig::producer_properties`] and [`KafkaConfig::consumer_properties`].

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Wire protocol between client and brokers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// Transport security: protocol plus optional TLS material and SASL credentials
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub protocol: SecurityProtocol,
    /// CA bundle used to verify brokers
    pub ssl_ca_location: Option<String>,
    pub ssl_certificate_location: Option<String>,
    pub ssl_key_location: Option<String>,
    #[serde(default)]
    pub sasl_mechanism: SaslMechanism,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

/// Producer delivery and batching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Required acknowledgments: 0, 1, or all
    pub acks: String,
    pub enable_idempotence: bool,
    pub retries: u32,
    pub request_timeout_ms: u64,
    pub linger_ms: u64,
    /// none, gzip, snappy, lz4, zstd
    pub compression_type: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: "all".to_string(),
            enable_idempotence: true,
            retries: 3,
            request_timeout_ms: 30_000,
            linger_ms: 5,
            compression_type: "lz4".to_string(),
        }
    }
}

/// Consumer-group settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub group_id: String,
    /// earliest, latest or none
    pub auto_offset_reset: String,
    /// Offsets are committed by the consumer after each message unless set
    pub enable_auto_commit: bool,
    pub session_timeout_ms: u64,
    pub max_poll_interval_ms: u64,
    /// Number of consumer-group members run by one process
    pub concurrency: usize,
    /// Pause before a retryable message is redelivered, in milliseconds
    pub redelivery_delay_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "roadscan".to_string(),
            auto_offset_reset: "earliest".to_string(),
            enable_auto_commit: false,
            session_timeout_ms: 30_000,
            max_poll_interval_ms: 300_000,
            concurrency: 3,
            redelivery_delay_ms: 1_000,
        }
    }
}

/// Topic names for the three capture stages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Raw capture events emitted by upload intake
    pub raw: String,
    /// Presigned capture events consumed by the inference service
    pub presigned: String,
    /// Processed capture events published by the inference service
    pub processed: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            raw: "raw-topic".to_string(),
            presigned: "presigned-topic".to_string(),
            processed: "processed-topic".to_string(),
        }
    }
}

/// Kafka configuration shared by producers and consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    pub client_id: String,
    pub security: SecurityConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub topics: TopicConfig,
    /// Raw librdkafka properties applied last
    pub properties: BTreeMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "roadscan".to_string(),
            security: SecurityConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            properties: BTreeMap::new(),
        }
    }
}

type Properties = Vec<(&'static str, String)>;

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    fn connection_properties(&self) -> Properties {
        let security = &self.security;
        let mut props = vec![
            ("bootstrap.servers", self.bootstrap_servers.clone()),
            ("client.id", self.client_id.clone()),
            ("security.protocol", security.protocol.as_str().to_string()),
        ];

        let optional = [
            ("ssl.ca.location", &security.ssl_ca_location),
            ("ssl.certificate.location", &security.ssl_certificate_location),
            ("ssl.key.location", &security.ssl_key_location),
        ];
        props.extend(
            optional
                .into_iter()
                .filter_map(|(key, value)| value.clone().map(|v| (key, v))),
        );

        if security.protocol.uses_sasl() {
            props.push(("sasl.mechanism", security.sasl_mechanism.as_str().to_string()));
            if let Some(username) = &security.sasl_username {
                props.push(("sasl.username", username.clone()));
            }
            if let Some(password) = &security.sasl_password {
                props.push(("sasl.password", password.clone()));
            }
        }

        props
    }

    /// librdkafka properties for a producer
    pub fn producer_properties(&self) -> Properties {
        let producer = &self.producer;
        let mut props = self.connection_properties();
        props.extend([
            ("acks", producer.acks.clone()),
            ("enable.idempotence", producer.enable_idempotence.to_string()),
            ("retries", producer.retries.to_string()),
            ("request.timeout.ms", producer.request_timeout_ms.to_string()),
            ("linger.ms", producer.linger_ms.to_string()),
            ("compression.type", producer.compression_type.clone()),
        ]);
        props
    }

    /// librdkafka properties for a consumer-group member
    pub fn consumer_properties(&self) -> Properties {
        let consumer = &self.consumer;
        let mut props = self.connection_properties();
        props.extend([
            ("group.id", consumer.group_id.clone()),
            ("auto.offset.reset", consumer.auto_offset_reset.clone()),
            ("enable.auto.commit", consumer.enable_auto_commit.to_string()),
            // Offsets are stored only once a message is settled
            ("enable.auto.offset.store", "false".to_string()),
            ("session.timeout.ms", consumer.session_timeout_ms.to_string()),
            ("max.poll.interval.ms", consumer.max_poll_interval_ms.to_string()),
        ]);
        props
    }

    fn client_config(&self, props: Properties) -> ClientConfig {
        let mut config = ClientConfig::new();
        for (key, value) in props {
            config.set(key, value);
        }
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }

    pub fn build_producer_config(&self) -> ClientConfig {
        self.client_config(self.producer_properties())
    }

    pub fn build_consumer_config(&self) -> ClientConfig {
        self.client_config(self.consumer_properties())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.producer.request_timeout_ms)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.consumer.redelivery_delay_ms)
    }

    /// Copy of this configuration with a different consumer group
    pub fn with_group_id(&self, group_id: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.consumer.group_id = group_id.into();
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("bootstrap_servers", &self.bootstrap_servers),
            ("consumer.group_id", &self.consumer.group_id),
            ("topics.raw", &self.topics.raw),
            ("topics.presigned", &self.topics.presigned),
            ("topics.processed", &self.topics.processed),
        ];
        if let Some((key, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ConfigError::MissingRequired(key.to_string()));
        }

        if self.consumer.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "consumer.concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.security.protocol.uses_sasl() && self.security.sasl_username.is_none() {
            return Err(ConfigError::MissingRequired(
                "security.sasl_username".to_string(),
            ));
        }

        Ok(())
    }
}

//! Configuration for the Veil pipeline.
//!
//! [`KafkaConfig`] covers the bus transport (brokers, SSL/SASL, producer and
//! consumer tuning, redelivery). [`PipelineConfig`] is the immutable stage
//! configuration: buckets, topic names, locator formats and the video polling
//! policy. Both deserialize with serde so the worker can layer them from files
//! and environment.

use crate::messages::{ContentKind, ObjectLocation};
use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
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
        matches!(
            self,
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl
        )
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
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

/// SSL/TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
    pub key_password: Option<String>,
    #[serde(default = "default_true")]
    pub enable_verification: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            ca_location: None,
            certificate_location: None,
            key_location: None,
            key_password: None,
            enable_verification: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// SASL authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Producer reliability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Delivery acknowledgement timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    /// Required acknowledgments: 0, 1, or all
    #[serde(default = "default_acks")]
    pub acks: String,
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_acks() -> String {
    "all".to_string()
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            enable_idempotence: true,
            acks: default_acks(),
        }
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Compression type: none, gzip, snappy, lz4, zstd
    #[serde(default = "default_compression")]
    pub compression_type: String,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: u32,
}

fn default_linger_ms() -> u64 {
    5
}

fn default_compression() -> String {
    "lz4".to_string()
}

fn default_max_in_flight() -> u32 {
    5
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            linger_ms: default_linger_ms(),
            compression_type: default_compression(),
            max_in_flight_requests: default_max_in_flight(),
        }
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group ID; the worker suffixes it with the stage name
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Must exceed the longest video annotation wait
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "veil".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_heartbeat_interval() -> u64 {
    3000
}

fn default_max_poll_interval() -> u64 {
    900000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

/// How the consumer redelivers messages whose handler failed retryably
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeliveryConfig {
    /// Total handler invocations per message, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RedeliveryConfig {
    /// Delay before redelivery number `attempt` (1-based), doubling each time
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    /// Time spent sleeping between attempts when every attempt fails
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.backoff_for(attempt))
            .sum()
    }
}

/// Main Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub redelivery: RedeliveryConfig,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "veil".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            reliability: ReliabilityConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            redelivery: RedeliveryConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }
        if let Some(ref password) = self.ssl.key_password {
            config.set("ssl.key.password", password);
        }
        if !self.ssl.enable_verification {
            config.set("enable.ssl.certificate.verification", "false");
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("retries", self.reliability.retries.to_string());
        config.set("retry.backoff.ms", self.reliability.retry_backoff_ms.to_string());
        config.set("request.timeout.ms", self.reliability.request_timeout_ms.to_string());
        config.set("acks", &self.reliability.acks);

        if self.reliability.enable_idempotence {
            config.set("enable.idempotence", "true");
        }

        config.set("linger.ms", self.producer.linger_ms.to_string());
        config.set("compression.type", &self.producer.compression_type);
        config.set(
            "max.in.flight.requests.per.connection",
            self.producer.max_in_flight_requests.to_string(),
        );

        config
    }

    /// Consumer config for the given group; offsets are always committed manually
    pub fn build_consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );
        config.set(
            "heartbeat.interval.ms",
            self.consumer.heartbeat_interval_ms.to_string(),
        );
        config.set(
            "max.poll.interval.ms",
            self.consumer.max_poll_interval_ms.to_string(),
        );

        config
    }

    pub fn build_admin_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();
        config.set("request.timeout.ms", self.reliability.request_timeout_ms.to_string());
        config
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.reliability.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "bootstrap_servers".to_string(),
            ));
        }

        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired(
                "consumer.group_id".to_string(),
            ));
        }

        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "sasl.username (required for SASL)".to_string(),
            ));
        }

        if self.redelivery.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "redelivery.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

/// Topic names plus the settings used when creating them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Upload notifications consumed by intake
    #[serde(default = "default_uploads_topic")]
    pub uploads: String,
    /// Routing messages for the image classifier
    #[serde(default = "default_image_topic")]
    pub image: String,
    /// Routing messages for the video classifier
    #[serde(default = "default_video_topic")]
    pub video: String,
    /// Analytics records consumed by the recorder
    #[serde(default = "default_recorder_topic")]
    pub recorder: String,
    #[serde(default = "default_dlq_topic")]
    pub dead_letter_queue: String,
    /// Create topics through the admin API on first publish
    #[serde(default = "default_true")]
    pub auto_create: bool,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

fn default_uploads_topic() -> String {
    "veil.uploads".to_string()
}

fn default_image_topic() -> String {
    "veil.vision".to_string()
}

fn default_video_topic() -> String {
    "veil.video".to_string()
}

fn default_recorder_topic() -> String {
    "veil.records".to_string()
}

fn default_dlq_topic() -> String {
    "veil.dlq".to_string()
}

fn default_partitions() -> i32 {
    3
}

fn default_replication_factor() -> i32 {
    1
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            uploads: default_uploads_topic(),
            image: default_image_topic(),
            video: default_video_topic(),
            recorder: default_recorder_topic(),
            dead_letter_queue: default_dlq_topic(),
            auto_create: true,
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
        }
    }
}

impl TopicConfig {
    /// Classifier topic for a content kind
    pub fn for_kind(&self, kind: ContentKind) -> &str {
        match kind {
            ContentKind::Image => &self.image,
            ContentKind::Video => &self.video,
        }
    }
}

/// Staging and quarantine buckets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    pub staging: String,
    pub quarantine: String,
}

impl BucketConfig {
    /// `<project>-filtered` for staging and `<project>-flagged` for quarantine
    pub fn for_project(project: &str) -> Self {
        Self {
            staging: format!("{}-filtered", project),
            quarantine: format!("{}-flagged", project),
        }
    }
}

/// How object locations are rendered into messages and records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    #[serde(default = "default_locator_scheme")]
    pub locator_scheme: String,
    /// Prefix of the authenticated-browser URL, ending in a slash
    #[serde(default = "default_content_url_base")]
    pub content_url_base: String,
}

fn default_locator_scheme() -> String {
    "gs".to_string()
}

fn default_content_url_base() -> String {
    "https://storage.cloud.google.com/".to_string()
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            locator_scheme: default_locator_scheme(),
            content_url_base: default_content_url_base(),
        }
    }
}

impl LocationConfig {
    /// Canonical `scheme://bucket/name` locator
    pub fn locator(&self, location: &ObjectLocation) -> String {
        format!(
            "{}://{}/{}",
            self.locator_scheme, location.bucket, location.name
        )
    }

    pub fn content_url(&self, location: &ObjectLocation) -> String {
        format!(
            "{}{}/{}",
            self.content_url_base, location.bucket, location.name
        )
    }
}

/// Polling policy for long-running video annotation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Give up waiting after this long; unset waits indefinitely
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            deadline_secs: None,
        }
    }
}

impl VideoConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// Immutable configuration shared by every stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub buckets: BucketConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub locations: LocationConfig,
    #[serde(default)]
    pub video: VideoConfig,
}

impl PipelineConfig {
    pub fn new(buckets: BucketConfig) -> Self {
        Self {
            buckets,
            topics: TopicConfig::default(),
            locations: LocationConfig::default(),
            video: VideoConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buckets.staging.is_empty() {
            return Err(ConfigError::MissingRequired("buckets.staging".to_string()));
        }
        if self.buckets.quarantine.is_empty() {
            return Err(ConfigError::MissingRequired(
                "buckets.quarantine".to_string(),
            ));
        }
        if self.buckets.staging == self.buckets.quarantine {
            return Err(ConfigError::InvalidValue {
                key: "buckets.quarantine".to_string(),
                message: "must differ from the staging bucket".to_string(),
            });
        }

        let topics = [
            ("topics.uploads", &self.topics.uploads),
            ("topics.image", &self.topics.image),
            ("topics.video", &self.topics.video),
            ("topics.recorder", &self.topics.recorder),
            ("topics.dead_letter_queue", &self.topics.dead_letter_queue),
        ];
        for (key, topic) in topics {
            if topic.is_empty() {
                return Err(ConfigError::MissingRequired(key.to_string()));
            }
        }

        if self.video.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "video.poll_interval_ms".to_string(),
                message: "must be positive".to_string(),
            });
        }

        Ok(())
    }
}

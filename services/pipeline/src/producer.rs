//! Kafka producer for the Veil pipeline.
//!
//! [`BusProducer`] publishes JSON messages with `message-type` and
//! `correlation-id` headers, waits for the broker to acknowledge each one, and
//! creates topics through the admin API the first time it publishes to them.
//! It is the production implementation of [`MessageBus`].

use crate::config::{KafkaConfig, TopicConfig};
use crate::error::PublishError;
use crate::ports::{Envelope, MessageBus};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    /// Wrap an already serialized envelope
    pub fn from_envelope(topic: impl Into<String>, envelope: Envelope) -> Self {
        let message = Self {
            topic: topic.into(),
            key: envelope.key,
            payload: envelope.body,
            headers: Vec::new(),
        };
        message.with_message_type(envelope.message_type)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header("correlation-id", id)
    }

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }

    fn kafka_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }
}

/// Kafka producer shared by every stage of one worker
pub struct BusProducer {
    producer: FutureProducer,
    admin: Option<AdminClient<DefaultClientContext>>,
    topics: TopicConfig,
    known_topics: Mutex<HashSet<String>>,
    default_timeout: Duration,
}

impl BusProducer {
    pub fn new(config: &KafkaConfig, topics: TopicConfig) -> Result<Self, ProducerError> {
        info!(
            servers = %config.bootstrap_servers,
            auto_create = topics.auto_create,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let admin = if topics.auto_create {
            let admin: AdminClient<DefaultClientContext> = config
                .build_admin_config()
                .create()
                .map_err(|e| ProducerError::CreationError(e.to_string()))?;
            Some(admin)
        } else {
            None
        };

        Ok(Self {
            producer,
            admin,
            topics,
            known_topics: Mutex::new(HashSet::new()),
            default_timeout: config.request_timeout(),
        })
    }

    /// Send a message and wait for delivery confirmation
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        self.send_with_timeout(message, self.default_timeout).await
    }

    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send_with_timeout(
        &self,
        message: OutgoingMessage,
        timeout: Duration,
    ) -> Result<DeliveryResult, ProducerError> {
        self.ensure_topic(&message.topic).await;

        let topic = message.topic.clone();
        let key = message.key.clone();

        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&topic)
            .payload(message.payload.as_slice())
            .headers(message.kafka_headers());
        if let Some(ref k) = key {
            record = record.key(k.as_str());
        }

        debug!(bytes = message.payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
            key,
        })
    }

    /// Create `topic` if this producer has not seen it yet.
    ///
    /// Creation failures are logged and left for the send to surface.
    async fn ensure_topic(&self, topic: &str) {
        let Some(admin) = self.admin.as_ref() else {
            return;
        };
        if self.known_topics.lock().contains(topic) {
            return;
        }

        let new_topic = NewTopic::new(
            topic,
            self.topics.partitions,
            TopicReplication::Fixed(self.topics.replication_factor),
        );

        match admin.create_topics(&[new_topic], &AdminOptions::new()).await {
            Ok(results) => {
                let created = results.iter().all(|result| match result {
                    Ok(_) => true,
                    Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => true,
                    Err((name, code)) => {
                        warn!(topic = %name, error = %code, "Failed to create topic");
                        false
                    }
                });
                if created {
                    debug!(topic, "Topic ready");
                    self.known_topics.lock().insert(topic.to_string());
                }
            }
            Err(e) => warn!(topic, error = %e, "Topic admin request failed"),
        }
    }

    /// Park an unprocessable message on the dead letter queue
    pub async fn send_to_dlq(
        &self,
        original_topic: &str,
        original_message: &[u8],
        error: &str,
        attempts: u32,
    ) -> Result<DeliveryResult, ProducerError> {
        let dlq_message = dead_letter_body(
            original_topic,
            original_message,
            error,
            attempts,
            Utc::now(),
        );

        let message = OutgoingMessage::new_json(&self.topics.dead_letter_queue, &dlq_message)?
            .with_key(Uuid::new_v4().to_string())
            .with_message_type("dead_letter")
            .with_header("original-topic", original_topic)
            .with_header("error-reason", error);

        self.send(message).await
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

/// Dead letter payload: the original bytes base64-encoded plus why they failed
fn dead_letter_body(
    original_topic: &str,
    original_message: &[u8],
    error: &str,
    attempts: u32,
    failed_at: DateTime<Utc>,
) -> serde_json::Value {
    serde_json::json!({
        "original_topic": original_topic,
        "original_message_base64": BASE64.encode(original_message),
        "error": error,
        "attempts": attempts,
        "timestamp": failed_at.to_rfc3339(),
    })
}

#[async_trait]
impl MessageBus for BusProducer {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), PublishError> {
        let message = OutgoingMessage::from_envelope(topic, envelope)
            .with_correlation_id(Uuid::new_v4().to_string());

        self.send(message).await.map(|_| ()).map_err(|e| match e {
            ProducerError::SerializationError(reason) => PublishError::Serialization(reason),
            other => PublishError::Delivery {
                topic: topic.to_string(),
                reason: other.to_string(),
            },
        })
    }
}

impl Drop for BusProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}

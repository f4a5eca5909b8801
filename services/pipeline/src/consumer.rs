//! Kafka consumer for the Veil pipeline.
//!
//! [`BusConsumer`] feeds one message at a time to a [`MessageHandler`],
//! redelivers retryable failures with exponential backoff, parks everything
//! else on the dead letter queue, and commits offsets only once a message is
//! either handled or safely dead-lettered.

use crate::config::{KafkaConfig, RedeliveryConfig};
use crate::producer::BusProducer;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Message processing error: {reason}")]
    ProcessingError { reason: String, retryable: bool },
}

impl ConsumerError {
    pub fn processing(reason: impl Into<String>, retryable: bool) -> Self {
        ConsumerError::ProcessingError {
            reason: reason.into(),
            retryable,
        }
    }

    /// Whether redelivering the same message could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsumerError::ProcessingError { retryable, .. } => *retryable,
            ConsumerError::DeserializationError(_) => false,
            _ => true,
        }
    }
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Build a message outside of Kafka, e.g. for replaying a payload
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            payload,
            metadata: MessageMetadata {
                topic: topic.into(),
                partition: 0,
                offset: 0,
                key: None,
                timestamp: None,
                headers: HashMap::new(),
            },
        }
    }

    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))
    }
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError>;

    /// Called once a message is given up on, before it is dead-lettered
    async fn on_error(&self, message: &IncomingMessage, error: &ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Message processing failed"
        );
    }
}

/// What became of one delivery after redelivery was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled { attempts: u32 },
    DeadLetter { attempts: u32, reason: String },
}

/// Run `handler` on `message`, redelivering retryable failures.
///
/// Retryable errors are retried until `policy.max_attempts` invocations have
/// been made, sleeping [`RedeliveryConfig::backoff_for`] between attempts.
/// Non-retryable errors are dead-lettered after the first attempt.
pub async fn dispatch_with_redelivery<H>(
    handler: &H,
    message: &IncomingMessage,
    policy: &RedeliveryConfig,
) -> DispatchOutcome
where
    H: MessageHandler + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match handler.handle(message.clone()).await {
            Ok(()) => return DispatchOutcome::Handled { attempts: attempt },
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let backoff = policy.backoff_for(attempt);
                warn!(
                    topic = %message.metadata.topic,
                    offset = message.metadata.offset,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Redelivering message"
                );
                metrics::counter!("veil.messages.redelivered").increment(1);
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                handler.on_error(message, &e).await;
                return DispatchOutcome::DeadLetter {
                    attempts: attempt,
                    reason: e.to_string(),
                };
            }
        }
    }
}

/// Kafka consumer driving one handler
pub struct BusConsumer {
    consumer: StreamConsumer,
    group_id: String,
    redelivery: RedeliveryConfig,
    shutdown_tx: broadcast::Sender<()>,
    dlq_producer: Option<Arc<BusProducer>>,
}

impl BusConsumer {
    pub fn new(config: &KafkaConfig, group_id: &str) -> Result<Self, ConsumerError> {
        info!(
            servers = %config.bootstrap_servers,
            group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config(group_id)
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            group_id: group_id.to_string(),
            redelivery: config.redelivery.clone(),
            shutdown_tx,
            dlq_producer: None,
        })
    }

    pub fn with_dlq_producer(mut self, producer: Arc<BusProducer>) -> Self {
        self.dlq_producer = Some(producer);
        self
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        info!(?topics, "Subscribing to topics");
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    /// Handle for signalling shutdown from another task
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Consume until shutdown is signalled or the stream ends
    #[instrument(skip(self, handler), fields(group_id = %self.group_id))]
    pub async fn run<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(borrowed_message)) => {
                            let incoming = convert_message(&borrowed_message);

                            debug!(
                                topic = %incoming.metadata.topic,
                                partition = incoming.metadata.partition,
                                offset = incoming.metadata.offset,
                                "Received message"
                            );

                            let outcome =
                                dispatch_with_redelivery(handler.as_ref(), &incoming, &self.redelivery)
                                    .await;

                            if !self.settle(&incoming, outcome).await {
                                // Committing any later offset on this partition
                                // would skip the message, so stop here
                                return Err(ConsumerError::CommitError(format!(
                                    "offset {} on {}/{} could not be dead-lettered",
                                    incoming.metadata.offset,
                                    incoming.metadata.topic,
                                    incoming.metadata.partition
                                )));
                            }

                            if let Err(e) = self
                                .consumer
                                .commit_message(&borrowed_message, CommitMode::Async)
                            {
                                warn!(error = %e, "Failed to commit offset");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka error");
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!(error = %e, "Failed to commit on shutdown");
        }

        Ok(())
    }

    /// Returns whether the message's offset may be committed
    async fn settle(&self, incoming: &IncomingMessage, outcome: DispatchOutcome) -> bool {
        let (attempts, reason) = match outcome {
            DispatchOutcome::Handled { .. } => return true,
            DispatchOutcome::DeadLetter { attempts, reason } => (attempts, reason),
        };

        metrics::counter!("veil.messages.dead_lettered").increment(1);

        let Some(ref dlq) = self.dlq_producer else {
            error!(
                topic = %incoming.metadata.topic,
                offset = incoming.metadata.offset,
                attempts,
                reason = %reason,
                "Dropping message, no dead letter queue configured"
            );
            return true;
        };

        match dlq
            .send_to_dlq(&incoming.metadata.topic, &incoming.payload, &reason, attempts)
            .await
        {
            Ok(_) => true,
            Err(dlq_err) => {
                error!(error = %dlq_err, "Failed to send to DLQ, leaving offset uncommitted");
                false
            }
        }
    }
}

fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the given error until `succeed_on` attempts have been made
    struct FlakyHandler {
        calls: AtomicU32,
        succeed_on: u32,
        retryable: bool,
    }

    impl FlakyHandler {
        fn new(succeed_on: u32, retryable: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                succeed_on,
                retryable,
            }
        }
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, _message: IncomingMessage) -> Result<(), ConsumerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(())
            } else {
                Err(ConsumerError::processing("store unavailable", self.retryable))
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RedeliveryConfig {
        RedeliveryConfig {
            max_attempts,
            backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn test_retryability() {
        assert!(!ConsumerError::DeserializationError("bad json".to_string()).is_retryable());
        assert!(!ConsumerError::processing("missing bucket", false).is_retryable());
        assert!(ConsumerError::processing("timeout", true).is_retryable());
        assert!(ConsumerError::CommitError("rebalance".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn test_retryable_failure_redelivered_until_success() {
        let handler = FlakyHandler::new(3, true);
        let message = IncomingMessage::new("veil.records", b"{}".to_vec());

        let outcome = dispatch_with_redelivery(&handler, &message, &fast_policy(3)).await;

        assert_eq!(outcome, DispatchOutcome::Handled { attempts: 3 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_lettered() {
        let handler = FlakyHandler::new(u32::MAX, true);
        let message = IncomingMessage::new("veil.records", b"{}".to_vec());

        let outcome = dispatch_with_redelivery(&handler, &message, &fast_policy(2)).await;

        assert_eq!(
            outcome,
            DispatchOutcome::DeadLetter {
                attempts: 2,
                reason: "Message processing error: store unavailable".to_string(),
            }
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_redelivered() {
        let handler = FlakyHandler::new(u32::MAX, false);
        let message = IncomingMessage::new("veil.vision", b"{}".to_vec());

        let outcome = dispatch_with_redelivery(&handler, &message, &fast_policy(5)).await;

        assert!(matches!(outcome, DispatchOutcome::DeadLetter { attempts: 1, .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}

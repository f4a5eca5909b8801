//! Bridges Kafka deliveries to pipeline stages.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use veil_pipeline::ports::{AcceptAll, DeliveryGuard};
use veil_pipeline::{
    AnalyticsRecord, ConsumerError, ImageClassifierStage, IncomingMessage, IntakeStage,
    MessageHandler, RecorderStage, RoutingMessage, StageError, UploadEvent,
    VideoClassifierStage,
};

/// A pipeline stage that consumes one message type
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + Sync;

    fn name(&self) -> &'static str;

    /// Stable identity of the object a message refers to
    fn delivery_key(&self, input: &Self::Input) -> String;

    async fn run(&self, input: &Self::Input) -> Result<(), StageError>;
}

#[async_trait]
impl Stage for IntakeStage {
    type Input = UploadEvent;

    fn name(&self) -> &'static str {
        "intake"
    }

    fn delivery_key(&self, input: &UploadEvent) -> String {
        input.location().to_string()
    }

    async fn run(&self, input: &UploadEvent) -> Result<(), StageError> {
        let routed = self.handle(input).await?;
        debug!(gcs_url = %routed.gcs_url, "Upload routed");
        Ok(())
    }
}

#[async_trait]
impl Stage for ImageClassifierStage {
    type Input = RoutingMessage;

    fn name(&self) -> &'static str {
        "image"
    }

    fn delivery_key(&self, input: &RoutingMessage) -> String {
        input.gcs_url.clone()
    }

    async fn run(&self, input: &RoutingMessage) -> Result<(), StageError> {
        let outcome = self.handle(input).await?;
        debug!(quarantined = outcome.quarantined(), "Image classified");
        Ok(())
    }
}

#[async_trait]
impl Stage for VideoClassifierStage {
    type Input = RoutingMessage;

    fn name(&self) -> &'static str {
        "video"
    }

    fn delivery_key(&self, input: &RoutingMessage) -> String {
        input.gcs_url.clone()
    }

    async fn run(&self, input: &RoutingMessage) -> Result<(), StageError> {
        let outcome = self.handle(input).await?;
        debug!(quarantined = outcome.quarantined(), "Video classified");
        Ok(())
    }
}

#[async_trait]
impl Stage for RecorderStage {
    type Input = AnalyticsRecord;

    fn name(&self) -> &'static str {
        "recorder"
    }

    fn delivery_key(&self, input: &AnalyticsRecord) -> String {
        input.gcs_url.clone()
    }

    async fn run(&self, input: &AnalyticsRecord) -> Result<(), StageError> {
        self.handle(input).await
    }
}

/// Runs a stage for every delivery admitted by the guard
pub struct StageHandler<S> {
    stage: S,
    guard: Arc<dyn DeliveryGuard>,
}

impl<S: Stage> StageHandler<S> {
    pub fn new(stage: S) -> Self {
        Self {
            stage,
            guard: Arc::new(AcceptAll),
        }
    }

    pub fn with_guard(mut self, guard: Arc<dyn DeliveryGuard>) -> Self {
        self.guard = guard;
        self
    }
}

#[async_trait]
impl<S: Stage> MessageHandler for StageHandler<S> {
    #[instrument(
        skip(self, message),
        fields(
            stage = self.stage.name(),
            topic = %message.metadata.topic,
            offset = message.metadata.offset
        )
    )]
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let stage = self.stage.name();
        let input: S::Input = message.decode_json().map_err(|e| {
            metrics::counter!("veil.messages.failed", "stage" => stage, "kind" => "decode")
                .increment(1);
            e
        })?;

        let key = format!(
            "{}:{}",
            message.metadata.topic,
            self.stage.delivery_key(&input)
        );
        if !self.guard.admit(&key) {
            info!(delivery_key = %key, "Skipping delivery rejected by guard");
            metrics::counter!("veil.messages.skipped", "stage" => stage).increment(1);
            return Ok(());
        }

        match self.stage.run(&input).await {
            Ok(()) => {
                metrics::counter!("veil.messages.processed", "stage" => stage).increment(1);
                Ok(())
            }
            Err(e) => {
                warn!(
                    delivery_key = %key,
                    kind = e.kind(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "Stage failed"
                );
                metrics::counter!("veil.messages.failed", "stage" => stage, "kind" => e.kind())
                    .increment(1);
                Err(ConsumerError::processing(e.to_string(), e.is_retryable()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use veil_pipeline::testing::{InMemoryAnalyticsStore, InMemoryBlobStore, RecordingBus};
    use veil_pipeline::{
        dispatch_with_redelivery, BucketConfig, DispatchOutcome, ObjectLocation, PipelineConfig,
        RedeliveryConfig,
    };

    /// Admits each key once
    #[derive(Default)]
    struct SeenKeys(Mutex<HashSet<String>>);

    impl DeliveryGuard for SeenKeys {
        fn admit(&self, delivery_key: &str) -> bool {
            self.0.lock().unwrap().insert(delivery_key.to_string())
        }
    }

    fn config() -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig::new(BucketConfig::for_project("acme")))
    }

    fn upload(name: &str, content_type: &str) -> IncomingMessage {
        IncomingMessage::new(
            "veil.uploads",
            json!({"bucket": "acme-uploads", "name": name, "contentType": content_type})
                .to_string()
                .into_bytes(),
        )
    }

    fn record_message() -> IncomingMessage {
        IncomingMessage::new(
            "veil.records",
            json!({
                "gcsUrl": "gs://acme-filtered/cat.jpg",
                "contentUrl": "https://storage.cloud.google.com/acme-filtered/cat.jpg",
                "contentType": "image/jpeg",
                "insertTimestamp": "1700000000",
                "safeSearch": []
            })
            .to_string()
            .into_bytes(),
        )
    }

    fn policy() -> RedeliveryConfig {
        RedeliveryConfig {
            max_attempts: 3,
            backoff_ms: 1,
            max_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_intake_handler_routes_upload() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let bus = Arc::new(RecordingBus::new());
        blobs.put(ObjectLocation::new("acme-uploads", "cat.jpg"));

        let handler = StageHandler::new(IntakeStage::new(blobs.clone(), bus.clone(), config()));
        handler.handle(upload("cat.jpg", "image/jpeg")).await.unwrap();

        assert!(blobs.contains(&ObjectLocation::new("acme-filtered", "cat.jpg")));
        assert_eq!(bus.published_on("veil.vision").len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retryable() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let bus = Arc::new(RecordingBus::new());

        let handler = StageHandler::new(IntakeStage::new(blobs, bus.clone(), config()));
        let err = handler
            .handle(upload("notes.txt", "text/plain"))
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(bus.total_published(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dead_lettered_once() {
        let store = Arc::new(InMemoryAnalyticsStore::new());
        let handler = StageHandler::new(RecorderStage::new(store.clone()));
        let message = IncomingMessage::new("veil.records", b"not json".to_vec());

        let outcome = dispatch_with_redelivery(&handler, &message, &policy()).await;

        assert!(matches!(outcome, DispatchOutcome::DeadLetter { attempts: 1, .. }));
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_redelivered() {
        let store = Arc::new(InMemoryAnalyticsStore::new());
        store.fail_inserts(true);
        let handler = StageHandler::new(RecorderStage::new(store.clone()));

        let outcome = dispatch_with_redelivery(&handler, &record_message(), &policy()).await;

        assert!(matches!(outcome, DispatchOutcome::DeadLetter { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_guard_drops_duplicate_delivery() {
        let store = Arc::new(InMemoryAnalyticsStore::new());
        let guard = Arc::new(SeenKeys::default());
        let handler =
            StageHandler::new(RecorderStage::new(store.clone())).with_guard(guard.clone());

        handler.handle(record_message()).await.unwrap();
        handler.handle(record_message()).await.unwrap();

        assert_eq!(store.rows().len(), 1);
        assert!(guard
            .0
            .lock()
            .unwrap()
            .contains("veil.records:gs://acme-filtered/cat.jpg"));
    }
}

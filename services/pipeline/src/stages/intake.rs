use super::ROUTING_MESSAGE;
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::messages::{RoutingMessage, UploadEvent};
use crate::ports::{BlobStore, Envelope, MessageBus};
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Moves uploads into staging and routes them to the matching classifier
#[derive(Clone)]
pub struct IntakeStage {
    blob_store: Arc<dyn BlobStore>,
    bus: Arc<dyn MessageBus>,
    config: Arc<PipelineConfig>,
}

impl IntakeStage {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        bus: Arc<dyn MessageBus>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            blob_store,
            bus,
            config,
        }
    }

    /// Returns the routing message that was published.
    ///
    /// A move failure aborts before anything is published. A publish failure
    /// after a successful move leaves the object staged but unrouted.
    #[instrument(
        skip(self, event),
        fields(bucket = %event.bucket, name = %event.object_name, content_type = %event.content_type)
    )]
    pub async fn handle(&self, event: &UploadEvent) -> Result<RoutingMessage, StageError> {
        let kind = event.validate()?;

        let source = event.location();
        let staged = source.in_bucket(&self.config.buckets.staging);
        self.blob_store.relocate(&source, &staged).await?;
        metrics::counter!("veil.objects.staged", "kind" => kind.as_str()).increment(1);

        let routing =
            RoutingMessage::for_location(&staged, &event.content_type, &self.config.locations);
        let topic = self.config.topics.for_kind(kind);
        let envelope = Envelope::json(&routing, ROUTING_MESSAGE)?.with_key(routing.gcs_url.clone());

        if let Err(e) = self.bus.publish(topic, envelope).await {
            error!(
                error = %e,
                source = %self.config.locations.locator(&source),
                staged = %routing.gcs_url,
                "Object staged but routing message not published"
            );
            return Err(e.into());
        }

        info!(topic, gcs_url = %routing.gcs_url, kind = kind.as_str(), "Object routed");
        Ok(routing)
    }
}

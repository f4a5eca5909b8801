use super::{insert_timestamp, ClassificationOutcome, RecordEmitter};
use crate::annotation::{OperationStatus, VideoAnnotationResults, VIDEO_FEATURES};
use crate::config::PipelineConfig;
use crate::error::{AnalysisError, StageError};
use crate::likelihood::LikelihoodCategory;
use crate::messages::{AnalyticsRecord, RoutingMessage};
use crate::moderation::aggregate_frames;
use crate::ports::{BlobStore, MessageBus, VideoAnnotator};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Annotates staged videos and publishes their analytics records
#[derive(Clone)]
pub struct VideoClassifierStage {
    annotator: Arc<dyn VideoAnnotator>,
    emitter: RecordEmitter,
}

impl VideoClassifierStage {
    pub fn new(
        annotator: Arc<dyn VideoAnnotator>,
        blob_store: Arc<dyn BlobStore>,
        bus: Arc<dyn MessageBus>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            annotator,
            emitter: RecordEmitter::new(blob_store, bus, config),
        }
    }

    /// Classify with the configured deadline
    pub async fn handle(&self, request: &RoutingMessage) -> Result<ClassificationOutcome, StageError> {
        let deadline = self.emitter.config().video.deadline();
        self.handle_with_deadline(request, deadline).await
    }

    /// Classify, giving up on the annotation after `deadline` if one is given
    #[instrument(skip(self, request), fields(gcs_url = %request.gcs_url))]
    pub async fn handle_with_deadline(
        &self,
        request: &RoutingMessage,
        deadline: Option<Duration>,
    ) -> Result<ClassificationOutcome, StageError> {
        request.validate()?;

        let started = Instant::now();
        let results = match deadline {
            Some(limit) => tokio::time::timeout(limit, self.annotate(&request.gcs_url))
                .await
                .map_err(|_| AnalysisError::Timeout(limit))??,
            None => self.annotate(&request.gcs_url).await?,
        };
        metrics::histogram!("veil.annotation.duration_seconds", "kind" => "video")
            .record(started.elapsed().as_secs_f64());

        let first = results.into_iter().next().ok_or_else(|| {
            AnalysisError::Malformed("operation completed without annotation results".to_string())
        })?;

        let config = self.emitter.config();
        let mut record = AnalyticsRecord::begin(request, &config.locations, insert_timestamp());

        for label in first.segment_labels() {
            record.push_label(label);
        }

        let aggregate = aggregate_frames(first.frame_likelihoods());
        record.push_rating(LikelihoodCategory::Adult, aggregate.adult);

        debug!(
            labels = record.labels.len(),
            adult = %aggregate.adult,
            flagged = aggregate.quarantine,
            "Video annotated"
        );

        self.emitter
            .emit(record, &request.location(), aggregate.quarantine)
            .await
    }

    async fn annotate(&self, uri: &str) -> Result<Vec<VideoAnnotationResults>, AnalysisError> {
        let handle = self.annotator.submit(uri, &VIDEO_FEATURES).await?;
        debug!(operation = %handle.name, "Video annotation submitted");

        let interval = self.emitter.config().video.poll_interval();
        loop {
            match self.annotator.poll(&handle).await? {
                OperationStatus::Done(results) => return Ok(results),
                OperationStatus::Pending => tokio::time::sleep(interval).await,
            }
        }
    }
}

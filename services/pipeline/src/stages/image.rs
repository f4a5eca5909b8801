use super::{insert_timestamp, ClassificationOutcome, RecordEmitter};
use crate::annotation::IMAGE_FEATURES;
use crate::config::PipelineConfig;
use crate::error::{AnalysisError, StageError};
use crate::messages::{AnalyticsRecord, RoutingMessage};
use crate::moderation::image_requires_quarantine;
use crate::ports::{BlobStore, ImageAnnotator, MessageBus};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// Annotates staged images and publishes their analytics records
#[derive(Clone)]
pub struct ImageClassifierStage {
    annotator: Arc<dyn ImageAnnotator>,
    emitter: RecordEmitter,
}

impl ImageClassifierStage {
    pub fn new(
        annotator: Arc<dyn ImageAnnotator>,
        blob_store: Arc<dyn BlobStore>,
        bus: Arc<dyn MessageBus>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            annotator,
            emitter: RecordEmitter::new(blob_store, bus, config),
        }
    }

    #[instrument(skip(self, request), fields(gcs_url = %request.gcs_url))]
    pub async fn handle(&self, request: &RoutingMessage) -> Result<ClassificationOutcome, StageError> {
        request.validate()?;

        let started = Instant::now();
        let annotation = self
            .annotator
            .annotate(&request.gcs_url, &IMAGE_FEATURES)
            .await?;
        metrics::histogram!("veil.annotation.duration_seconds", "kind" => "image")
            .record(started.elapsed().as_secs_f64());

        if let Some(status) = annotation.error {
            return Err(AnalysisError::Reported {
                code: status.code,
                message: status.message,
            }
            .into());
        }

        let config = self.emitter.config();
        let mut record = AnalyticsRecord::begin(request, &config.locations, insert_timestamp());

        for label in annotation
            .label_annotations
            .iter()
            .chain(annotation.logo_annotations.iter())
        {
            record.push_label(label.description.clone());
        }

        let safe_search = annotation.safe_search_annotation.unwrap_or_default();
        for (category, likelihood) in safe_search.ratings() {
            record.push_rating(category, likelihood);
        }

        let flagged = image_requires_quarantine(&safe_search);
        debug!(
            labels = record.labels.len(),
            flagged, "Image annotated"
        );

        self.emitter.emit(record, &request.location(), flagged).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{AnnotationStatus, EntityAnnotation, ImageAnnotation, SafeSearchAnnotation};
    use crate::config::BucketConfig;
    use crate::error::RelocationError;
    use crate::likelihood::{Likelihood, LikelihoodCategory};
    use crate::messages::{ObjectLocation, SafeSearchEntry};
    use crate::ports::{MockBlobStore, MockImageAnnotator, MockMessageBus};
    use crate::stages::QuarantineOutcome;

    fn config() -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig::new(BucketConfig {
            staging: "staging".to_string(),
            quarantine: "quarantine".to_string(),
        }))
    }

    fn request() -> RoutingMessage {
        RoutingMessage {
            content_type: "image/jpeg".to_string(),
            gcs_url: "gs://staging/cat.jpg".to_string(),
            gcs_bucket: "staging".to_string(),
            gcs_file: "cat.jpg".to_string(),
        }
    }

    fn entity(description: &str) -> EntityAnnotation {
        EntityAnnotation {
            description: description.to_string(),
        }
    }

    fn annotator_returning(annotation: ImageAnnotation) -> MockImageAnnotator {
        let mut annotator = MockImageAnnotator::new();
        annotator
            .expect_annotate()
            .withf(|uri, features| uri == "gs://staging/cat.jpg" && features.len() == 4)
            .times(1)
            .returning(move |_, _| Ok(annotation.clone()));
        annotator
    }

    fn accepting_bus() -> MockMessageBus {
        let mut bus = MockMessageBus::new();
        bus.expect_publish()
            .withf(|topic, _| topic == "veil.records")
            .times(1)
            .returning(|_, _| Ok(()));
        bus
    }

    #[tokio::test]
    async fn test_flagged_image_quarantined() {
        let annotator = annotator_returning(ImageAnnotation {
            safe_search_annotation: Some(SafeSearchAnnotation {
                adult: Likelihood::Possible,
                spoof: Likelihood::Unlikely,
                medical: Likelihood::Unknown,
                violence: Likelihood::VeryUnlikely,
            }),
            ..Default::default()
        });
        let mut blob_store = MockBlobStore::new();
        blob_store
            .expect_relocate()
            .withf(|from, to| {
                *from == ObjectLocation::new("staging", "cat.jpg")
                    && *to == ObjectLocation::new("quarantine", "cat.jpg")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let stage = ImageClassifierStage::new(
            Arc::new(annotator),
            Arc::new(blob_store),
            Arc::new(accepting_bus()),
            config(),
        );
        let outcome = stage.handle(&request()).await.unwrap();

        assert_eq!(outcome.quarantine, QuarantineOutcome::Relocated);
        assert_eq!(outcome.record.gcs_url, "gs://quarantine/cat.jpg");
        assert_eq!(
            outcome.record.content_url,
            "https://storage.cloud.google.com/quarantine/cat.jpg"
        );
        assert_eq!(
            outcome.record.safe_search,
            vec![
                SafeSearchEntry {
                    flagged_type: LikelihoodCategory::Adult,
                    likelihood: Likelihood::Possible
                },
                SafeSearchEntry {
                    flagged_type: LikelihoodCategory::Spoof,
                    likelihood: Likelihood::Unlikely
                },
                SafeSearchEntry {
                    flagged_type: LikelihoodCategory::Medical,
                    likelihood: Likelihood::Unknown
                },
                SafeSearchEntry {
                    flagged_type: LikelihoodCategory::Violence,
                    likelihood: Likelihood::VeryUnlikely
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_labels_then_logos_without_dedup() {
        let annotator = annotator_returning(ImageAnnotation {
            label_annotations: vec![entity("cat"), entity("cat")],
            logo_annotations: vec![entity("Acme")],
            ..Default::default()
        });
        let mut blob_store = MockBlobStore::new();
        blob_store.expect_relocate().never();

        let stage = ImageClassifierStage::new(
            Arc::new(annotator),
            Arc::new(blob_store),
            Arc::new(accepting_bus()),
            config(),
        );
        let outcome = stage.handle(&request()).await.unwrap();

        let names: Vec<_> = outcome.record.labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["cat", "cat", "Acme"]);
        assert_eq!(outcome.quarantine, QuarantineOutcome::NotRequired);
        assert_eq!(outcome.record.gcs_url, "gs://staging/cat.jpg");
        // No safe search annotation reads as four UNKNOWN ratings
        assert_eq!(outcome.record.safe_search.len(), 4);
        assert!(outcome
            .record
            .safe_search
            .iter()
            .all(|entry| entry.likelihood == Likelihood::Unknown));
    }

    #[tokio::test]
    async fn test_reported_error_emits_nothing() {
        let annotator = annotator_returning(ImageAnnotation {
            error: Some(AnnotationStatus {
                code: 7,
                message: "permission denied".to_string(),
            }),
            ..Default::default()
        });
        let mut bus = MockMessageBus::new();
        bus.expect_publish().never();

        let stage = ImageClassifierStage::new(
            Arc::new(annotator),
            Arc::new(MockBlobStore::new()),
            Arc::new(bus),
            config(),
        );
        let err = stage.handle(&request()).await.unwrap_err();

        assert!(matches!(
            err,
            StageError::UpstreamAnalysis(AnalysisError::Reported { code: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_field_skips_annotation() {
        let mut annotator = MockImageAnnotator::new();
        annotator.expect_annotate().never();

        let stage = ImageClassifierStage::new(
            Arc::new(annotator),
            Arc::new(MockBlobStore::new()),
            Arc::new(MockMessageBus::new()),
            config(),
        );
        let mut missing_url = request();
        missing_url.gcs_url.clear();

        let err = stage.handle(&missing_url).await.unwrap_err();
        assert_eq!(err.to_string(), "validation failed: gcsUrl not provided");
    }

    #[tokio::test]
    async fn test_failed_quarantine_move_still_publishes() {
        let annotator = annotator_returning(ImageAnnotation {
            safe_search_annotation: Some(SafeSearchAnnotation {
                violence: Likelihood::VeryLikely,
                ..Default::default()
            }),
            ..Default::default()
        });
        let mut blob_store = MockBlobStore::new();
        blob_store.expect_relocate().returning(|from, to| {
            Err(RelocationError {
                from: from.to_string(),
                to: to.to_string(),
                reason: "AccessDenied".to_string(),
            })
        });

        let stage = ImageClassifierStage::new(
            Arc::new(annotator),
            Arc::new(blob_store),
            Arc::new(accepting_bus()),
            config(),
        );
        let outcome = stage.handle(&request()).await.unwrap();

        assert!(matches!(
            outcome.quarantine,
            QuarantineOutcome::RelocationFailed(_)
        ));
        assert_eq!(outcome.record.gcs_url, "gs://quarantine/cat.jpg");
    }
}

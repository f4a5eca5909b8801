//! End-to-end stage chaining over the in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;
use veil_pipeline::annotation::{
    EntityAnnotation, ExplicitContentAnnotation, ExplicitContentFrame, ImageAnnotation,
    SafeSearchAnnotation, VideoAnnotationResults,
};
use veil_pipeline::testing::{
    InMemoryAnalyticsStore, InMemoryBlobStore, RecordingBus, ScriptedVideoAnnotator,
    StaticImageAnnotator,
};
use veil_pipeline::{
    AnalysisError, AnalyticsRecord, BucketConfig, ImageClassifierStage, IntakeStage, Likelihood,
    LikelihoodCategory, ObjectLocation, PipelineConfig, QuarantineOutcome, RecorderStage,
    RoutingMessage, StageError, UploadEvent, ValidationError, VideoClassifierStage,
};

struct Harness {
    config: Arc<PipelineConfig>,
    blob_store: Arc<InMemoryBlobStore>,
    bus: Arc<RecordingBus>,
    store: Arc<InMemoryAnalyticsStore>,
}

impl Harness {
    fn new() -> Self {
        let mut config = PipelineConfig::new(BucketConfig {
            staging: "staging".to_string(),
            quarantine: "quarantine".to_string(),
        });
        config.video.poll_interval_ms = 1;

        Self {
            config: Arc::new(config),
            blob_store: Arc::new(InMemoryBlobStore::new()),
            bus: Arc::new(RecordingBus::new()),
            store: Arc::new(InMemoryAnalyticsStore::new()),
        }
    }

    fn intake(&self) -> IntakeStage {
        IntakeStage::new(self.blob_store.clone(), self.bus.clone(), self.config.clone())
    }

    fn image(&self, annotation: ImageAnnotation) -> ImageClassifierStage {
        ImageClassifierStage::new(
            Arc::new(StaticImageAnnotator::new(annotation)),
            self.blob_store.clone(),
            self.bus.clone(),
            self.config.clone(),
        )
    }

    fn video(&self, annotator: ScriptedVideoAnnotator) -> VideoClassifierStage {
        VideoClassifierStage::new(
            Arc::new(annotator),
            self.blob_store.clone(),
            self.bus.clone(),
            self.config.clone(),
        )
    }

    fn recorder(&self) -> RecorderStage {
        RecorderStage::new(self.store.clone())
    }

    fn upload(&self, bucket: &str, name: &str, content_type: &str) -> UploadEvent {
        self.blob_store.put(ObjectLocation::new(bucket, name));
        UploadEvent {
            bucket: bucket.to_string(),
            object_name: name.to_string(),
            content_type: content_type.to_string(),
        }
    }

    fn routed(&self, topic: &str) -> RoutingMessage {
        let mut messages = self.bus.messages_on::<RoutingMessage>(topic);
        assert_eq!(messages.len(), 1, "expected one routing message on {}", topic);
        messages.remove(0)
    }

    fn recorded(&self) -> AnalyticsRecord {
        let mut records = self.bus.messages_on::<AnalyticsRecord>("veil.records");
        assert_eq!(records.len(), 1, "expected one analytics record");
        records.remove(0)
    }
}

fn unlikely_everywhere() -> SafeSearchAnnotation {
    SafeSearchAnnotation {
        adult: Likelihood::Unlikely,
        spoof: Likelihood::Unlikely,
        medical: Likelihood::Unlikely,
        violence: Likelihood::Unlikely,
    }
}

#[tokio::test]
async fn test_image_flows_through_to_recorder() {
    let harness = Harness::new();
    let event = harness.upload("in", "cat.jpg", "image/jpeg");

    harness.intake().handle(&event).await.unwrap();

    assert!(harness
        .blob_store
        .contains(&ObjectLocation::new("staging", "cat.jpg")));
    let routing = harness.routed("veil.vision");
    assert_eq!(routing.gcs_bucket, "staging");
    assert_eq!(routing.gcs_file, "cat.jpg");
    assert!(harness.bus.published_on("veil.video").is_empty());

    let outcome = harness
        .image(ImageAnnotation {
            label_annotations: vec![EntityAnnotation {
                description: "cat".to_string(),
            }],
            safe_search_annotation: Some(unlikely_everywhere()),
            ..Default::default()
        })
        .handle(&routing)
        .await
        .unwrap();
    assert_eq!(outcome.quarantine, QuarantineOutcome::NotRequired);

    let record = harness.recorded();
    assert_eq!(record.gcs_url, "gs://staging/cat.jpg");
    assert_eq!(
        record.content_url,
        "https://storage.cloud.google.com/staging/cat.jpg"
    );
    assert_eq!(record.labels.len(), 1);
    assert_eq!(record.labels[0].name, "cat");

    harness.recorder().handle(&record).await.unwrap();
    assert_eq!(harness.store.rows(), vec![record]);
}

#[tokio::test]
async fn test_explicit_video_quarantined() {
    let harness = Harness::new();
    let event = harness.upload("in", "clip.mp4", "video/mp4");

    harness.intake().handle(&event).await.unwrap();
    let routing = harness.routed("veil.video");

    let annotator = ScriptedVideoAnnotator::new(vec![VideoAnnotationResults {
        explicit_annotation: Some(ExplicitContentAnnotation {
            frames: vec![ExplicitContentFrame {
                pornography_likelihood: Likelihood::VeryLikely,
            }],
        }),
        ..Default::default()
    }])
    .pending_for(2);

    let outcome = harness.video(annotator).handle(&routing).await.unwrap();
    assert_eq!(outcome.quarantine, QuarantineOutcome::Relocated);

    assert!(harness
        .blob_store
        .contains(&ObjectLocation::new("quarantine", "clip.mp4")));
    assert!(!harness
        .blob_store
        .contains(&ObjectLocation::new("staging", "clip.mp4")));

    let record = harness.recorded();
    assert_eq!(record.gcs_url, "gs://quarantine/clip.mp4");
    assert_eq!(record.safe_search.len(), 1);
    assert_eq!(record.safe_search[0].flagged_type, LikelihoodCategory::Adult);
    assert_eq!(record.safe_search[0].likelihood, Likelihood::VeryLikely);

    let wire = serde_json::to_value(&record).unwrap();
    assert_eq!(
        wire["safeSearch"],
        serde_json::json!([{"flaggedType": "adult", "likelihood": "VERY_LIKELY"}])
    );

    harness.recorder().handle(&record).await.unwrap();
    assert_eq!(harness.store.rows().len(), 1);
}

#[tokio::test]
async fn test_incomplete_uploads_rejected_without_side_effects() {
    let harness = Harness::new();
    let intake = harness.intake();

    let cases = [
        ("", "cat.jpg", "image/jpeg", "bucket"),
        ("in", "", "image/jpeg", "name"),
        ("in", "cat.jpg", "", "contentType"),
    ];

    for (bucket, name, content_type, field) in cases {
        let event = UploadEvent {
            bucket: bucket.to_string(),
            object_name: name.to_string(),
            content_type: content_type.to_string(),
        };
        let err = intake.handle(&event).await.unwrap_err();
        assert!(
            matches!(err, StageError::Validation(ValidationError::MissingField(f)) if f == field),
            "unexpected error for missing {}: {}",
            field,
            err
        );
    }

    assert_eq!(harness.bus.total_published(), 0);
    assert!(harness.blob_store.moves().is_empty());
}

#[tokio::test]
async fn test_unsupported_content_types_rejected_everywhere() {
    let harness = Harness::new();

    for content_type in ["application/pdf", "text/plain", "audio/mpeg"] {
        let event = harness.upload("in", "doc", content_type);
        assert!(matches!(
            harness.intake().handle(&event).await,
            Err(StageError::Validation(ValidationError::UnsupportedContentType(_)))
        ));

        let routing = RoutingMessage {
            content_type: content_type.to_string(),
            gcs_url: "gs://staging/doc".to_string(),
            gcs_bucket: "staging".to_string(),
            gcs_file: "doc".to_string(),
        };
        assert!(matches!(
            harness.image(ImageAnnotation::default()).handle(&routing).await,
            Err(StageError::Validation(_))
        ));
        assert!(matches!(
            harness
                .video(ScriptedVideoAnnotator::new(Vec::new()))
                .handle(&routing)
                .await,
            Err(StageError::Validation(_))
        ));
    }

    assert_eq!(harness.bus.total_published(), 0);
}

#[tokio::test]
async fn test_content_type_detection_is_case_insensitive() {
    let harness = Harness::new();
    let event = harness.upload("in", "PHOTO.PNG", "IMAGE/PNG");

    let routing = harness.intake().handle(&event).await.unwrap();

    assert_eq!(routing.gcs_url, "gs://staging/PHOTO.PNG");
    assert_eq!(harness.bus.published_on("veil.vision").len(), 1);
}

#[tokio::test]
async fn test_video_deadline_times_out() {
    let harness = Harness::new();
    let routing = RoutingMessage {
        content_type: "video/quicktime".to_string(),
        gcs_url: "gs://staging/long.mov".to_string(),
        gcs_bucket: "staging".to_string(),
        gcs_file: "long.mov".to_string(),
    };
    let annotator = ScriptedVideoAnnotator::new(Vec::new()).pending_for(u32::MAX);

    let err = harness
        .video(annotator)
        .handle_with_deadline(&routing, Some(Duration::from_millis(25)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StageError::UpstreamAnalysis(AnalysisError::Timeout(_))
    ));
    assert!(harness.bus.published_on("veil.records").is_empty());
}

#[tokio::test]
async fn test_failed_quarantine_move_does_not_block_record() {
    let harness = Harness::new();
    let routing = RoutingMessage {
        content_type: "image/gif".to_string(),
        gcs_url: "gs://staging/meme.gif".to_string(),
        gcs_bucket: "staging".to_string(),
        gcs_file: "meme.gif".to_string(),
    };
    // Never staged, so the quarantine move cannot find its source

    let outcome = harness
        .image(ImageAnnotation {
            safe_search_annotation: Some(SafeSearchAnnotation {
                spoof: Likelihood::Likely,
                ..unlikely_everywhere()
            }),
            ..Default::default()
        })
        .handle(&routing)
        .await
        .unwrap();

    assert!(matches!(
        outcome.quarantine,
        QuarantineOutcome::RelocationFailed(_)
    ));
    assert_eq!(harness.recorded().gcs_url, "gs://quarantine/meme.gif");
}

#[tokio::test]
async fn test_intake_publish_failure_leaves_object_staged() {
    let harness = Harness::new();
    let event = harness.upload("in", "cat.jpg", "image/jpeg");
    harness.bus.fail_publishes(true);

    let err = harness.intake().handle(&event).await.unwrap_err();

    assert!(matches!(err, StageError::Publish(_)));
    assert!(harness
        .blob_store
        .contains(&ObjectLocation::new("staging", "cat.jpg")));
}

#[tokio::test]
async fn test_recorder_failure_surfaces_persistence_error() {
    let harness = Harness::new();
    harness.store.fail_inserts(true);

    let record = AnalyticsRecord {
        gcs_url: "gs://staging/cat.jpg".to_string(),
        content_url: "https://storage.cloud.google.com/staging/cat.jpg".to_string(),
        content_type: "image/jpeg".to_string(),
        insert_timestamp: "1700000000".to_string(),
        ..Default::default()
    };

    let err = harness.recorder().handle(&record).await.unwrap_err();
    assert!(matches!(err, StageError::Persistence(_)));
    assert!(harness.store.rows().is_empty());
}

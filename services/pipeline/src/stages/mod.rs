//! The four pipeline stages.
//!
//! Each stage is stateless between invocations: it takes one decoded message,
//! talks to its collaborators through [`crate::ports`], and either returns what
//! it emitted or a [`StageError`]. Redelivery is the bus layer's concern.

mod image;
mod intake;
mod recorder;
mod video;

pub use image::ImageClassifierStage;
pub use intake::IntakeStage;
pub use recorder::RecorderStage;
pub use video::VideoClassifierStage;

use crate::config::PipelineConfig;
use crate::error::{RelocationError, StageError};
use crate::messages::{AnalyticsRecord, ObjectLocation};
use crate::ports::{BlobStore, Envelope, MessageBus};
use std::sync::Arc;
use tracing::{error, info};

/// `message-type` header of routing messages
pub const ROUTING_MESSAGE: &str = "routing";
/// `message-type` header of analytics records
pub const ANALYTICS_RECORD: &str = "analytics_record";

/// What happened to a flagged object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineOutcome {
    NotRequired,
    Relocated,
    /// The record already points at quarantine but the object did not move
    RelocationFailed(RelocationError),
}

/// Result of a successful classifier invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationOutcome {
    /// The record as published to the recorder topic
    pub record: AnalyticsRecord,
    pub quarantine: QuarantineOutcome,
}

impl ClassificationOutcome {
    pub fn quarantined(&self) -> bool {
        !matches!(self.quarantine, QuarantineOutcome::NotRequired)
    }
}

/// Epoch seconds rounded to the nearest second, as written into records
pub(crate) fn insert_timestamp() -> String {
    insert_timestamp_at(chrono::Utc::now().timestamp_millis())
}

fn insert_timestamp_at(epoch_millis: i64) -> String {
    (epoch_millis + 500).div_euclid(1000).to_string()
}

/// Emission path shared by both classifiers
#[derive(Clone)]
pub(crate) struct RecordEmitter {
    blob_store: Arc<dyn BlobStore>,
    bus: Arc<dyn MessageBus>,
    config: Arc<PipelineConfig>,
}

impl RecordEmitter {
    pub(crate) fn new(
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

    pub(crate) fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Publish `record`, quarantining `staged` first when flagged.
    ///
    /// A flagged record is rewritten to the quarantine location and the move
    /// and the publish are issued together. Only a publish failure fails the
    /// stage; a failed move is reported in the outcome.
    pub(crate) async fn emit(
        &self,
        mut record: AnalyticsRecord,
        staged: &ObjectLocation,
        flagged: bool,
    ) -> Result<ClassificationOutcome, StageError> {
        let topic = self.config.topics.recorder.as_str();

        if !flagged {
            let envelope =
                Envelope::json(&record, ANALYTICS_RECORD)?.with_key(record.gcs_url.clone());
            self.bus.publish(topic, envelope).await?;
            return Ok(ClassificationOutcome {
                record,
                quarantine: QuarantineOutcome::NotRequired,
            });
        }

        let target = staged.in_bucket(&self.config.buckets.quarantine);
        record.relocate_to(&target, &self.config.locations);
        let envelope = Envelope::json(&record, ANALYTICS_RECORD)?.with_key(record.gcs_url.clone());

        let (moved, published) = tokio::join!(
            self.blob_store.relocate(staged, &target),
            self.bus.publish(topic, envelope)
        );

        let quarantine = match moved {
            Ok(()) => {
                metrics::counter!("veil.objects.quarantined").increment(1);
                info!(from = %staged, to = %target, "Object quarantined");
                QuarantineOutcome::Relocated
            }
            Err(e) => {
                metrics::counter!("veil.objects.quarantine_failed").increment(1);
                error!(
                    error = %e,
                    record_url = %record.gcs_url,
                    "Quarantine move failed, record points at quarantine"
                );
                QuarantineOutcome::RelocationFailed(e)
            }
        };

        published?;

        Ok(ClassificationOutcome { record, quarantine })
    }
}

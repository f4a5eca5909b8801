//! Veil Worker
//!
//! Runs one pipeline stage as a long-lived Kafka consumer, wiring the stage
//! to its production adapters:
//!
//! | Stage      | Input topic      | Adapters                                    |
//! |------------|------------------|---------------------------------------------|
//! | `intake`   | `topics.uploads` | [`S3BlobStore`], Kafka producer              |
//! | `image`    | `topics.image`   | [`VisionAnnotator`], [`S3BlobStore`], Kafka  |
//! | `video`    | `topics.video`   | [`VideoIntelligenceAnnotator`], [`S3BlobStore`], Kafka |
//! | `recorder` | `topics.recorder`| [`PgAnalyticsStore`]                         |
//!
//! Failed deliveries are redelivered with backoff and then dead-lettered by
//! the consumer in `veil-pipeline`.

pub mod analytics_store;
pub mod blob_store;
pub mod config;
pub(crate) mod google;
pub mod handlers;
pub mod supervisor;
pub mod video_intelligence;
pub mod vision;

pub use analytics_store::PgAnalyticsStore;
pub use blob_store::S3BlobStore;
pub use config::{StageName, WorkerConfig};
pub use handlers::{Stage, StageHandler};
pub use supervisor::supervise;
pub use video_intelligence::VideoIntelligenceAnnotator;
pub use vision::VisionAnnotator;

//! Veil Pipeline - asynchronous content moderation over a message bus
//!
//! Uploaded media objects flow through four stages:
//!
//! - **Intake** validates an upload event, moves the object into staging and
//!   routes it to the image or video classifier
//! - **Image classifier** annotates the image, applies the safe-content
//!   decision and quarantines flagged objects
//! - **Video classifier** does the same for videos after aggregating
//!   per-frame ratings from a long-running annotation
//! - **Recorder** writes one analytics row per processed object
//!
//! Stages only talk to the outside world through the traits in [`ports`]. The
//! Kafka plumbing ([`BusProducer`], [`BusConsumer`]) lives here as well; the
//! other adapters live in the `veil-worker` crate.
//!
//! # Example
//!
//! ```rust
//! use veil_pipeline::moderation::aggregate_frames;
//! use veil_pipeline::Likelihood;
//!
//! let verdict = aggregate_frames([
//!     Likelihood::VeryUnlikely,
//!     Likelihood::Possible,
//!     Likelihood::Unlikely,
//! ]);
//!
//! assert_eq!(verdict.adult, Likelihood::Possible);
//! assert!(verdict.quarantine);
//! ```

pub mod annotation;
pub mod config;
pub mod consumer;
pub mod error;
pub mod likelihood;
pub mod messages;
pub mod moderation;
pub mod ports;
pub mod producer;
pub mod stages;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{
    BucketConfig, ConfigError, ConsumerConfig, KafkaConfig, LocationConfig, PipelineConfig,
    ProducerConfig, RedeliveryConfig, ReliabilityConfig, SaslConfig, SaslMechanism,
    SecurityProtocol, SslConfig, TopicConfig, VideoConfig,
};
pub use consumer::{
    async_trait, dispatch_with_redelivery, BusConsumer, ConsumerError, DispatchOutcome,
    IncomingMessage, MessageHandler, MessageMetadata,
};
pub use error::{
    AnalysisError, PersistenceError, PublishError, RelocationError, StageError, ValidationError,
};
pub use likelihood::{Likelihood, LikelihoodCategory, QUARANTINE_THRESHOLD};
pub use messages::{
    AnalyticsRecord, ContentKind, Label, ObjectLocation, RoutingMessage, SafeSearchEntry,
    UploadEvent,
};
pub use producer::{BusProducer, DeliveryResult, OutgoingMessage, ProducerError};
pub use stages::{
    ClassificationOutcome, ImageClassifierStage, IntakeStage, QuarantineOutcome, RecorderStage,
    VideoClassifierStage,
};


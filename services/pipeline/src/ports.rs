//! Interfaces to the pipeline's external collaborators.
//!
//! Stages only see these traits. Production adapters live in the worker
//! crate; in-memory fakes live in the `testing` module
//! behind the `testing` feature.

use crate::annotation::{
    ImageAnnotation, ImageFeature, OperationHandle, OperationStatus, VideoFeature,
};
use crate::error::{AnalysisError, PersistenceError, PublishError, RelocationError};
use crate::messages::{AnalyticsRecord, ObjectLocation};
use async_trait::async_trait;
use serde::Serialize;

/// A serialized message ready for the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Partitioning key, usually the object locator
    pub key: Option<String>,
    /// Value of the `message-type` header
    pub message_type: &'static str,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn json<T: Serialize>(message: &T, message_type: &'static str) -> Result<Self, PublishError> {
        let body = serde_json::to_vec(message)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        Ok(Self {
            key: None,
            message_type,
            body,
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Object storage with move semantics
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Move an object; the source no longer exists afterwards
    async fn relocate(
        &self,
        from: &ObjectLocation,
        to: &ObjectLocation,
    ) -> Result<(), RelocationError>;
}

/// Publish side of the message bus
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish and wait for the bus to acknowledge
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), PublishError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageAnnotator: Send + Sync {
    async fn annotate(
        &self,
        uri: &str,
        features: &[ImageFeature],
    ) -> Result<ImageAnnotation, AnalysisError>;
}

/// Long-running video annotation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoAnnotator: Send + Sync {
    async fn submit(
        &self,
        uri: &str,
        features: &[VideoFeature],
    ) -> Result<OperationHandle, AnalysisError>;

    async fn poll(&self, handle: &OperationHandle) -> Result<OperationStatus, AnalysisError>;
}

/// Append-only analytical store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn insert_row(&self, record: &AnalyticsRecord) -> Result<(), PersistenceError>;
}

/// Decides whether a delivery should be processed.
///
/// Keys are stable per message (`<topic>:<locator>`), so a deduplicating guard
/// can drop redeliveries of work that already completed.
pub trait DeliveryGuard: Send + Sync {
    fn admit(&self, delivery_key: &str) -> bool;
}

/// Processes every delivery
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl DeliveryGuard for AcceptAll {
    fn admit(&self, _delivery_key: &str) -> bool {
        true
    }
}

//! Error taxonomy shared by every pipeline stage.
//!
//! Every error is local to the message being processed. Stages never retry;
//! they return the error so the bus layer can decide between redelivery and
//! the dead letter queue (see [`StageError::is_retryable`]).

use std::time::Duration;
use thiserror::Error;

/// A message failed validation and can never succeed as delivered
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} not provided")]
    MissingField(&'static str),

    #[error("unsupported content type {0:?}, expected an image or video")]
    UnsupportedContentType(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// An annotation collaborator could not produce a usable result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("annotation service reported code {code}: {message}")]
    Reported { code: i32, message: String },

    #[error("annotation request failed: {0}")]
    Call(String),

    #[error("unexpected annotation response: {0}")]
    Malformed(String),

    #[error("annotation did not complete within {0:?}")]
    Timeout(Duration),
}

/// The blob store refused or failed a move
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to move {from} to {to}: {reason}")]
pub struct RelocationError {
    pub from: String,
    pub to: String,
    pub reason: String,
}

/// A message could not be handed to the bus
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("failed to serialize message: {0}")]
    Serialization(String),

    #[error("failed to publish to {topic}: {reason}")]
    Delivery { topic: String, reason: String },
}

/// The analytical store rejected an insert
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to insert analytics row: {0}")]
pub struct PersistenceError(pub String);

/// Terminal failure of one stage invocation
#[derive(Error, Debug)]
pub enum StageError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("upstream analysis failed: {0}")]
    UpstreamAnalysis(#[from] AnalysisError),

    #[error(transparent)]
    Relocation(#[from] RelocationError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl StageError {
    /// Validation failures are permanent; everything else may succeed on
    /// redelivery.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StageError::Validation(_))
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Validation(_) => "validation",
            StageError::UpstreamAnalysis(AnalysisError::Timeout(_)) => "analysis_timeout",
            StageError::UpstreamAnalysis(_) => "upstream_analysis",
            StageError::Relocation(_) => "relocation",
            StageError::Publish(_) => "publish",
            StageError::Persistence(_) => "persistence",
        }
    }
}

//! In-memory collaborators for exercising stages without infrastructure.
//!
//! Every fake records what it was asked to do and can be switched into a
//! failing mode, so stages can be chained end to end in tests and local
//! tooling.

use crate::annotation::{
    ImageAnnotation, ImageFeature, OperationHandle, OperationStatus, VideoAnnotationResults,
    VideoFeature,
};
use crate::error::{AnalysisError, PersistenceError, PublishError, RelocationError};
use crate::messages::{AnalyticsRecord, ObjectLocation};
use crate::ports::{
    AnalyticsStore, BlobStore, Envelope, ImageAnnotator, MessageBus, VideoAnnotator,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Blob store holding a set of object locations
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<HashSet<ObjectLocation>>,
    moves: Mutex<Vec<(ObjectLocation, ObjectLocation)>>,
    failing: AtomicBool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, location: ObjectLocation) {
        self.objects.lock().insert(location);
    }

    pub fn contains(&self, location: &ObjectLocation) -> bool {
        self.objects.lock().contains(location)
    }

    /// Completed moves in order
    pub fn moves(&self) -> Vec<(ObjectLocation, ObjectLocation)> {
        self.moves.lock().clone()
    }

    /// Make every subsequent move fail
    pub fn fail_moves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn relocate(
        &self,
        from: &ObjectLocation,
        to: &ObjectLocation,
    ) -> Result<(), RelocationError> {
        let failure = |reason: &str| RelocationError {
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        };

        if self.failing.load(Ordering::SeqCst) {
            return Err(failure("blob store unavailable"));
        }

        let mut objects = self.objects.lock();
        if !objects.remove(from) {
            return Err(failure("source object does not exist"));
        }
        objects.insert(to.clone());
        self.moves.lock().push((from.clone(), to.clone()));
        Ok(())
    }
}

/// Message bus that keeps every published envelope per topic
#[derive(Debug, Default)]
pub struct RecordingBus {
    published: Mutex<HashMap<String, Vec<Envelope>>>,
    failing: AtomicBool,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Envelope> {
        self.published
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Decode every message published on `topic`.
    ///
    /// Panics if a body does not decode as `T`.
    pub fn messages_on<T: DeserializeOwned>(&self, topic: &str) -> Vec<T> {
        self.published_on(topic)
            .iter()
            .map(|envelope| {
                serde_json::from_slice(&envelope.body)
                    .unwrap_or_else(|e| panic!("undecodable message on {}: {}", topic, e))
            })
            .collect()
    }

    pub fn total_published(&self) -> usize {
        self.published.lock().values().map(Vec::len).sum()
    }

    pub fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Delivery {
                topic: topic.to_string(),
                reason: "bus unavailable".to_string(),
            });
        }
        self.published
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(envelope);
        Ok(())
    }
}

/// Image annotator returning a fixed annotation for every URI
#[derive(Debug, Default)]
pub struct StaticImageAnnotator {
    annotation: ImageAnnotation,
    requests: Mutex<Vec<(String, Vec<ImageFeature>)>>,
}

impl StaticImageAnnotator {
    pub fn new(annotation: ImageAnnotation) -> Self {
        Self {
            annotation,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(String, Vec<ImageFeature>)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ImageAnnotator for StaticImageAnnotator {
    async fn annotate(
        &self,
        uri: &str,
        features: &[ImageFeature],
    ) -> Result<ImageAnnotation, AnalysisError> {
        self.requests.lock().push((uri.to_string(), features.to_vec()));
        Ok(self.annotation.clone())
    }
}

/// Video annotator that stays pending for a fixed number of polls
#[derive(Debug)]
pub struct ScriptedVideoAnnotator {
    results: Vec<VideoAnnotationResults>,
    pending_polls: u32,
    polls: AtomicU32,
    submitted: Mutex<Vec<String>>,
}

impl ScriptedVideoAnnotator {
    pub fn new(results: Vec<VideoAnnotationResults>) -> Self {
        Self {
            results,
            pending_polls: 0,
            polls: AtomicU32::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Report PENDING for the first `polls` polls
    pub fn pending_for(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl VideoAnnotator for ScriptedVideoAnnotator {
    async fn submit(
        &self,
        uri: &str,
        _features: &[VideoFeature],
    ) -> Result<OperationHandle, AnalysisError> {
        let mut submitted = self.submitted.lock();
        submitted.push(uri.to_string());
        Ok(OperationHandle {
            name: format!("operations/{}", submitted.len()),
        })
    }

    async fn poll(&self, _handle: &OperationHandle) -> Result<OperationStatus, AnalysisError> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        if poll < self.pending_polls {
            Ok(OperationStatus::Pending)
        } else {
            Ok(OperationStatus::Done(self.results.clone()))
        }
    }
}

/// Analytical store keeping rows in memory
#[derive(Debug, Default)]
pub struct InMemoryAnalyticsStore {
    rows: Mutex<Vec<AnalyticsRecord>>,
    failing: AtomicBool,
}

impl InMemoryAnalyticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<AnalyticsRecord> {
        self.rows.lock().clone()
    }

    pub fn fail_inserts(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AnalyticsStore for InMemoryAnalyticsStore {
    async fn insert_row(&self, record: &AnalyticsRecord) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError("store unavailable".to_string()));
        }
        self.rows.lock().push(record.clone());
        Ok(())
    }
}

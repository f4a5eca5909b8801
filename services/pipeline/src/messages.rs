//! Wire schemas exchanged between pipeline stages.
//!
//! All messages are camelCase JSON. Required string fields deserialize leniently
//! (absent or `null` becomes empty) so that a missing field surfaces as a
//! [`ValidationError`] naming the field rather than an opaque decode failure.

use crate::config::LocationConfig;
use crate::error::ValidationError;
use crate::likelihood::{Likelihood, LikelihoodCategory};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(())
    }
}

/// Media family of an object, derived from its content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Image,
    Video,
}

impl ContentKind {
    /// Classify a content type by case-insensitive substring, image first.
    pub fn detect(content_type: &str) -> Option<Self> {
        let lowered = content_type.to_lowercase();
        if lowered.contains("image") {
            Some(ContentKind::Image)
        } else if lowered.contains("video") {
            Some(ContentKind::Video)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Image => "image",
            ContentKind::Video => "video",
        }
    }
}

fn require_content_kind(content_type: &str) -> Result<ContentKind, ValidationError> {
    ContentKind::detect(content_type)
        .ok_or_else(|| ValidationError::UnsupportedContentType(content_type.to_string()))
}

/// A bucket plus object name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub name: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
        }
    }

    /// The same object name in another bucket
    pub fn in_bucket(&self, bucket: &str) -> Self {
        Self::new(bucket, self.name.clone())
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.name)
    }
}

/// Blob-store notification that an object was uploaded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub bucket: String,
    #[serde(rename = "name", default, deserialize_with = "null_as_empty")]
    pub object_name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content_type: String,
}

impl UploadEvent {
    pub fn validate(&self) -> Result<ContentKind, ValidationError> {
        require("bucket", &self.bucket)?;
        require("name", &self.object_name)?;
        require("contentType", &self.content_type)?;
        require_content_kind(&self.content_type)
    }

    pub fn location(&self) -> ObjectLocation {
        ObjectLocation::new(&self.bucket, &self.object_name)
    }
}

/// Request for a classifier to analyse a staged object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingMessage {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content_type: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub gcs_url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub gcs_bucket: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub gcs_file: String,
}

impl RoutingMessage {
    /// Routing message for an object at `location`
    pub fn for_location(
        location: &ObjectLocation,
        content_type: &str,
        locations: &LocationConfig,
    ) -> Self {
        Self {
            content_type: content_type.to_string(),
            gcs_url: locations.locator(location),
            gcs_bucket: location.bucket.clone(),
            gcs_file: location.name.clone(),
        }
    }

    pub fn validate(&self) -> Result<ContentKind, ValidationError> {
        require("gcsBucket", &self.gcs_bucket)?;
        require("gcsFile", &self.gcs_file)?;
        require("contentType", &self.content_type)?;
        require("gcsUrl", &self.gcs_url)?;
        require_content_kind(&self.content_type)
    }

    pub fn location(&self) -> ObjectLocation {
        ObjectLocation::new(&self.gcs_bucket, &self.gcs_file)
    }
}

/// One label attached to an analysed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

/// One moderation rating attached to an analysed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeSearchEntry {
    pub flagged_type: LikelihoodCategory,
    pub likelihood: Likelihood,
}

/// Normalized analysis result, one per processed object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRecord {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub gcs_url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content_url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content_type: String,
    /// Epoch seconds, string encoded
    #[serde(default, deserialize_with = "null_as_empty")]
    pub insert_timestamp: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub safe_search: Vec<SafeSearchEntry>,
}

impl AnalyticsRecord {
    /// Start a record for a staged object described by `request`.
    ///
    /// `gcsUrl` is carried over from the request verbatim; `contentUrl` is
    /// derived from the bucket and file.
    pub fn begin(request: &RoutingMessage, locations: &LocationConfig, insert_timestamp: String) -> Self {
        Self {
            gcs_url: request.gcs_url.clone(),
            content_url: locations.content_url(&request.location()),
            content_type: request.content_type.clone(),
            insert_timestamp,
            labels: Vec::new(),
            safe_search: Vec::new(),
        }
    }

    /// Point the record at the object's new home
    pub fn relocate_to(&mut self, location: &ObjectLocation, locations: &LocationConfig) {
        self.gcs_url = locations.locator(location);
        self.content_url = locations.content_url(location);
    }

    pub fn push_label(&mut self, name: impl Into<String>) {
        self.labels.push(Label { name: name.into() });
    }

    pub fn push_rating(&mut self, flagged_type: LikelihoodCategory, likelihood: Likelihood) {
        self.safe_search.push(SafeSearchEntry {
            flagged_type,
            likelihood,
        });
    }

    pub fn validate(&self) -> Result<ContentKind, ValidationError> {
        require("gcsUrl", &self.gcs_url)?;
        require("contentUrl", &self.content_url)?;
        require("contentType", &self.content_type)?;
        let kind = require_content_kind(&self.content_type)?;
        require("insertTimestamp", &self.insert_timestamp)?;
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_content_kind_case_insensitive() {
        assert_eq!(ContentKind::detect("image/jpeg"), Some(ContentKind::Image));
        assert_eq!(ContentKind::detect("IMAGE/PNG"), Some(ContentKind::Image));
        assert_eq!(ContentKind::detect("Video/MP4"), Some(ContentKind::Video));
        assert_eq!(ContentKind::detect("application/pdf"), None);
        assert_eq!(ContentKind::detect(""), None);
    }

    #[test]
    fn test_upload_event_from_bucket_notification() {
        let json = r#"{
            "kind": "storage#object",
            "bucket": "in",
            "name": "cat.jpg",
            "contentType": "image/jpeg",
            "size": "1024"
        }"#;

        let event: UploadEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.object_name, "cat.jpg");
        assert_eq!(event.validate(), Ok(ContentKind::Image));
    }

    #[test]
    fn test_upload_event_missing_fields() {
        let missing_bucket: UploadEvent =
            serde_json::from_str(r#"{"name": "a.jpg", "contentType": "image/jpeg"}"#).unwrap();
        let null_name: UploadEvent =
            serde_json::from_str(r#"{"bucket": "in", "name": null, "contentType": "image/jpeg"}"#)
                .unwrap();
        let empty_type: UploadEvent =
            serde_json::from_str(r#"{"bucket": "in", "name": "a.jpg", "contentType": ""}"#).unwrap();

        assert_eq!(
            missing_bucket.validate(),
            Err(ValidationError::MissingField("bucket"))
        );
        assert_eq!(null_name.validate(), Err(ValidationError::MissingField("name")));
        assert_eq!(
            empty_type.validate(),
            Err(ValidationError::MissingField("contentType"))
        );
    }

    #[test]
    fn test_routing_message_rejects_unsupported_type() {
        let message = RoutingMessage {
            content_type: "text/plain".to_string(),
            gcs_url: "gs://staging/notes.txt".to_string(),
            gcs_bucket: "staging".to_string(),
            gcs_file: "notes.txt".to_string(),
        };

        assert!(matches!(
            message.validate(),
            Err(ValidationError::UnsupportedContentType(t)) if t == "text/plain"
        ));
    }

    #[test]
    fn test_record_wire_form() {
        let mut record = AnalyticsRecord {
            gcs_url: "gs://staging/cat.jpg".to_string(),
            content_url: "https://storage.cloud.google.com/staging/cat.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            insert_timestamp: "1700000000".to_string(),
            ..Default::default()
        };
        record.push_label("cat");
        record.push_rating(LikelihoodCategory::Adult, Likelihood::Unlikely);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["gcsUrl"], "gs://staging/cat.jpg");
        assert_eq!(value["insertTimestamp"], "1700000000");
        assert_eq!(value["labels"][0]["name"], "cat");
        assert_eq!(value["safeSearch"][0]["flaggedType"], "adult");
        assert_eq!(value["safeSearch"][0]["likelihood"], "UNLIKELY");
    }

    #[test]
    fn test_record_omits_empty_labels() {
        let record = AnalyticsRecord {
            gcs_url: "gs://staging/clip.mp4".to_string(),
            content_url: "https://storage.cloud.google.com/staging/clip.mp4".to_string(),
            content_type: "video/mp4".to_string(),
            insert_timestamp: "1700000000".to_string(),
            ..Default::default()
        };

        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("labels").is_none());
        assert!(value["safeSearch"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_record_validation_order() {
        let record = AnalyticsRecord {
            gcs_url: "gs://staging/cat.jpg".to_string(),
            content_url: "https://storage.cloud.google.com/staging/cat.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            ..Default::default()
        };

        assert_eq!(
            record.validate(),
            Err(ValidationError::MissingField("insertTimestamp"))
        );
    }
}

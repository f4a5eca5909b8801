//! Response shapes returned by the annotation collaborators.
//!
//! These mirror the camelCase JSON of the Vision and Video Intelligence REST
//! APIs closely enough that adapters can deserialize straight into them. Every
//! collection defaults to empty and every substructure is optional: the
//! services omit fields they have nothing to say about.

use crate::likelihood::{Likelihood, LikelihoodCategory};
use serde::{Deserialize, Serialize};

/// Detection requested from the image annotator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageFeature {
    LogoDetection,
    LabelDetection,
    LandmarkDetection,
    SafeSearchDetection,
}

/// Features the image classifier always requests
pub const IMAGE_FEATURES: [ImageFeature; 4] = [
    ImageFeature::LogoDetection,
    ImageFeature::LabelDetection,
    ImageFeature::LandmarkDetection,
    ImageFeature::SafeSearchDetection,
];

/// Detection requested from the video annotator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VideoFeature {
    LabelDetection,
    ExplicitContentDetection,
}

/// Features the video classifier always requests
pub const VIDEO_FEATURES: [VideoFeature; 2] = [
    VideoFeature::LabelDetection,
    VideoFeature::ExplicitContentDetection,
];

/// Error status embedded in an annotation response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityAnnotation {
    #[serde(default)]
    pub description: String,
}

/// Per-category ratings for one image; missing ratings read as UNKNOWN
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeSearchAnnotation {
    #[serde(default)]
    pub adult: Likelihood,
    #[serde(default)]
    pub spoof: Likelihood,
    #[serde(default)]
    pub medical: Likelihood,
    #[serde(default)]
    pub violence: Likelihood,
}

impl SafeSearchAnnotation {
    /// Ratings in record order: adult, spoof, medical, violence
    pub fn ratings(&self) -> [(LikelihoodCategory, Likelihood); 4] {
        [
            (LikelihoodCategory::Adult, self.adult),
            (LikelihoodCategory::Spoof, self.spoof),
            (LikelihoodCategory::Medical, self.medical),
            (LikelihoodCategory::Violence, self.violence),
        ]
    }
}

/// Result of annotating one image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAnnotation {
    #[serde(default)]
    pub logo_annotations: Vec<EntityAnnotation>,
    #[serde(default)]
    pub label_annotations: Vec<EntityAnnotation>,
    #[serde(default)]
    pub safe_search_annotation: Option<SafeSearchAnnotation>,
    #[serde(default)]
    pub error: Option<AnnotationStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelAnnotation {
    #[serde(default)]
    pub entity: Option<Entity>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplicitContentFrame {
    #[serde(default)]
    pub pornography_likelihood: Likelihood,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplicitContentAnnotation {
    #[serde(default)]
    pub frames: Vec<ExplicitContentFrame>,
}

/// One result set of a completed video annotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoAnnotationResults {
    #[serde(default)]
    pub segment_label_annotations: Vec<LabelAnnotation>,
    #[serde(default)]
    pub explicit_annotation: Option<ExplicitContentAnnotation>,
}

impl VideoAnnotationResults {
    /// Per-frame pornography ratings, empty when no explicit annotation exists
    pub fn frame_likelihoods(&self) -> impl Iterator<Item = Likelihood> + '_ {
        self.explicit_annotation
            .iter()
            .flat_map(|explicit| explicit.frames.iter())
            .map(|frame| frame.pornography_likelihood)
    }

    /// Segment label descriptions; labels without an entity are skipped
    pub fn segment_labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.segment_label_annotations
            .iter()
            .filter_map(|label| label.entity.as_ref())
            .map(|entity| entity.description.as_str())
    }
}

/// Handle to a submitted long-running video annotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    pub name: String,
}

/// State of a long-running video annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Done(Vec<VideoAnnotationResults>),
}

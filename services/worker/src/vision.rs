use crate::config::AnnotationConfig;
use crate::google::GoogleApi;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use veil_pipeline::annotation::{ImageAnnotation, ImageFeature};
use veil_pipeline::ports::ImageAnnotator;
use veil_pipeline::AnalysisError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageSource<'a> {
    image_uri: &'a str,
}

#[derive(Serialize)]
struct Image<'a> {
    source: ImageSource<'a>,
}

#[derive(Serialize)]
struct Feature {
    #[serde(rename = "type")]
    feature_type: ImageFeature,
}

#[derive(Serialize)]
struct AnnotateImageRequest<'a> {
    image: Image<'a>,
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct BatchAnnotateImagesRequest<'a> {
    requests: [AnnotateImageRequest<'a>; 1],
}

#[derive(Deserialize)]
struct BatchAnnotateImagesResponse {
    #[serde(default)]
    responses: Vec<ImageAnnotation>,
}

/// Image annotation through the Cloud Vision REST API
#[derive(Debug)]
pub struct VisionAnnotator {
    api: GoogleApi,
}

impl VisionAnnotator {
    pub fn new(config: &AnnotationConfig) -> Result<Self> {
        Ok(Self {
            api: GoogleApi::new(&config.vision_endpoint, config)?,
        })
    }
}

#[async_trait]
impl ImageAnnotator for VisionAnnotator {
    /// A per-image `error` is returned inside the annotation, not as `Err`
    #[instrument(skip(self, features))]
    async fn annotate(
        &self,
        uri: &str,
        features: &[ImageFeature],
    ) -> Result<ImageAnnotation, AnalysisError> {
        let request = BatchAnnotateImagesRequest {
            requests: [AnnotateImageRequest {
                image: Image {
                    source: ImageSource { image_uri: uri },
                },
                features: features
                    .iter()
                    .map(|feature| Feature {
                        feature_type: *feature,
                    })
                    .collect(),
            }],
        };

        let response: BatchAnnotateImagesResponse =
            self.api.post_json("v1/images:annotate", &request).await?;

        let annotation = response.responses.into_iter().next().ok_or_else(|| {
            AnalysisError::Malformed("annotate response contained no results".to_string())
        })?;

        debug!(
            labels = annotation.label_annotations.len(),
            logos = annotation.logo_annotations.len(),
            "Image annotation received"
        );
        Ok(annotation)
    }
}

use crate::config::AnnotationConfig;
use crate::google::GoogleApi;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use veil_pipeline::annotation::{
    AnnotationStatus, OperationHandle, OperationStatus, VideoAnnotationResults, VideoFeature,
};
use veil_pipeline::ports::VideoAnnotator;
use veil_pipeline::AnalysisError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateVideoRequest<'a> {
    input_uri: &'a str,
    features: &'a [VideoFeature],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateVideoResponse {
    #[serde(default)]
    annotation_results: Vec<VideoAnnotationResults>,
}

/// google.longrunning.Operation
#[derive(Deserialize)]
struct Operation {
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<AnnotationStatus>,
    #[serde(default)]
    response: Option<AnnotateVideoResponse>,
}

/// Video annotation through the Video Intelligence REST API
#[derive(Debug)]
pub struct VideoIntelligenceAnnotator {
    api: GoogleApi,
}

impl VideoIntelligenceAnnotator {
    pub fn new(config: &AnnotationConfig) -> Result<Self> {
        Ok(Self {
            api: GoogleApi::new(&config.video_endpoint, config)?,
        })
    }
}

#[async_trait]
impl VideoAnnotator for VideoIntelligenceAnnotator {
    #[instrument(skip(self, features))]
    async fn submit(
        &self,
        uri: &str,
        features: &[VideoFeature],
    ) -> Result<OperationHandle, AnalysisError> {
        let request = AnnotateVideoRequest {
            input_uri: uri,
            features,
        };

        let handle: OperationHandle = self.api.post_json("v1/videos:annotate", &request).await?;
        debug!(operation = %handle.name, "Video annotation started");
        Ok(handle)
    }

    #[instrument(skip(self), fields(operation = %handle.name))]
    async fn poll(&self, handle: &OperationHandle) -> Result<OperationStatus, AnalysisError> {
        let operation: Operation = self
            .api
            .get_json(&format!("v1/{}", handle.name))
            .await?;

        if let Some(status) = operation.error {
            return Err(AnalysisError::Reported {
                code: status.code,
                message: status.message,
            });
        }

        if !operation.done {
            return Ok(OperationStatus::Pending);
        }

        let results = operation
            .response
            .map(|response| response.annotation_results)
            .unwrap_or_default();
        Ok(OperationStatus::Done(results))
    }
}

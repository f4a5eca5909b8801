//! Shared HTTP plumbing for the Google annotation REST APIs.

use crate::config::AnnotationConfig;
use anyhow::{Context, Result};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use veil_pipeline::annotation::AnnotationStatus;
use veil_pipeline::AnalysisError;

/// Error body returned by Google APIs on non-2xx responses
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: AnnotationStatus,
}

/// Authenticated client for one Google API endpoint
pub(crate) struct GoogleApi {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    access_token: Option<String>,
}

impl Debug for GoogleApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("GoogleApi")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl GoogleApi {
    pub(crate) fn new(endpoint: &str, config: &AnnotationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to create HTTP client for annotation API")?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.access_token, &self.api_key) {
            (Some(token), _) => request.bearer_auth(token),
            (None, Some(key)) => request.query(&[("key", key)]),
            (None, None) => request,
        }
    }

    pub(crate) async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, AnalysisError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = self.authorize(self.http.post(self.url(path)).json(body));
        Self::read(request).await
    }

    pub(crate) async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, AnalysisError> {
        let request = self.authorize(self.http.get(self.url(path)));
        Self::read(request).await
    }

    async fn read<R: DeserializeOwned>(request: RequestBuilder) -> Result<R, AnalysisError> {
        let response = request
            .send()
            .await
            .map_err(|e| AnalysisError::Call(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(match serde_json::from_str::<ErrorEnvelope>(&error_text) {
                Ok(envelope) => AnalysisError::Reported {
                    code: envelope.error.code,
                    message: envelope.error.message,
                },
                Err(_) => AnalysisError::Call(format!("{} - {}", status, error_text)),
            });
        }

        response
            .json()
            .await
            .map_err(|e| AnalysisError::Malformed(e.to_string()))
    }
}

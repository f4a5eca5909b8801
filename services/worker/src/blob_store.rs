use crate::config::StorageConfig;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument};
use veil_pipeline::ports::BlobStore;
use veil_pipeline::{ObjectLocation, RelocationError};

/// Blob store backed by an S3-compatible service
pub struct S3BlobStore {
    client: S3Client,
}

impl S3BlobStore {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // GCS interoperability, MinIO and LocalStack all need a custom endpoint
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 blob store initialized"
        );

        Ok(Self { client })
    }
}

/// `x-amz-copy-source` value for an object
fn copy_source(location: &ObjectLocation) -> String {
    format!("{}/{}", location.bucket, urlencoding::encode(&location.name))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    /// Copy then delete; a failed delete leaves both copies in place
    #[instrument(skip_all, fields(from = %from, to = %to))]
    async fn relocate(
        &self,
        from: &ObjectLocation,
        to: &ObjectLocation,
    ) -> Result<(), RelocationError> {
        let failure = |reason: String| RelocationError {
            from: from.to_string(),
            to: to.to_string(),
            reason,
        };

        self.client
            .copy_object()
            .bucket(&to.bucket)
            .key(&to.name)
            .copy_source(copy_source(from))
            .send()
            .await
            .map_err(|e| failure(format!("copy failed: {}", DisplayErrorContext(&e))))?;

        debug!("Object copied, deleting source");

        self.client
            .delete_object()
            .bucket(&from.bucket)
            .key(&from.name)
            .send()
            .await
            .map_err(|e| failure(format!("delete failed: {}", DisplayErrorContext(&e))))?;

        metrics::counter!("veil.blob.moves").increment(1);
        Ok(())
    }
}

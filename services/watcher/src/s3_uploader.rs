use crate::config::SamplingConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Content type of every persisted frame.
pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// User metadata key carrying the fragment location tag.
pub const LOCATION_METADATA_KEY: &str = "location";

/// Errors reported by the blob store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Upload of {key} to bucket {bucket} failed: {message}")]
    Upload {
        bucket: String,
        key: String,
        message: String,
    },
}

/// Description of one object written to the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub bucket: String,
    pub key: String,
    pub content_type: &'static str,
    pub content_length: u64,
    /// Location tag of the source fragment, if it had one.
    pub location: Option<String>,
}

/// Durable blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `body` as described by `record`. Failures are reported, not retried.
    async fn put(&self, record: &UploadRecord, body: Bytes) -> Result<(), StoreError>;
}

/// S3-backed blob store.
pub struct S3BlobStore {
    client: S3Client,
}

impl S3BlobStore {
    /// Create a new S3 store for the given region.
    pub async fn new(config: &SamplingConfig, region: &str) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Pre-defined endpoint (VPC endpoint, MinIO, LocalStack)
        if let Some(ref endpoint_url) = config.endpoint_url {
            info!(endpoint = %endpoint_url, "Using pre-defined S3 endpoint");
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        } else {
            info!("Using default S3 endpoint");
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(bucket = %config.bucket, region = %region, "S3 blob store initialized");

        Self { client }
    }

    /// Wrap an already configured client.
    pub fn from_client(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, record, body), fields(bucket = %record.bucket, key = %record.key))]
    async fn put(&self, record: &UploadRecord, body: Bytes) -> Result<(), StoreError> {
        debug!(size_bytes = record.content_length, "Uploading frame to S3");

        let mut request = self
            .client
            .put_object()
            .bucket(&record.bucket)
            .key(&record.key)
            .body(ByteStream::from(body))
            .content_type(record.content_type)
            .content_length(record.content_length as i64);

        if let Some(ref location) = record.location {
            request = request.metadata(LOCATION_METADATA_KEY, location);
        }

        request.send().await.map_err(|e| StoreError::Upload {
            bucket: record.bucket.clone(),
            key: record.key.clone(),
            message: DisplayErrorContext(&e).to_string(),
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mentions_key() {
        let err = StoreError::Upload {
            bucket: "frames".to_string(),
            key: "source-images-1710/abc.jpg".to_string(),
            message: "access denied".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("source-images-1710/abc.jpg"));
        assert!(msg.contains("access denied"));
    }

    #[test]
    fn test_from_client() {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("eu-central-1"))
            .build();
        let _store = S3BlobStore::from_client(S3Client::from_conf(config));
    }
}

//! Object storage gateway: issues time-limited upload URLs.

use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};

/// Errors raised while issuing an upload URL
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid presign configuration: {0}")]
    Config(String),

    #[error("Failed to presign upload for {key}: {message}")]
    Presign { key: String, message: String },

    #[error("Presign pool is closed")]
    Closed,
}

/// An issued upload URL
#[derive(Debug, Clone, PartialEq)]
pub struct PresignedUpload {
    pub url: String,
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues presigned upload URLs for object keys
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresignGateway: Send + Sync {
    async fn presign_put(&self, key: &str) -> Result<PresignedUpload, GatewayError>;
}

/// S3 implementation of [`PresignGateway`]
pub struct S3Gateway {
    client: S3Client,
    bucket: String,
    expiry: Duration,
    permits: Semaphore,
}

impl S3Gateway {
    /// Build an S3 client from the ambient AWS configuration
    pub async fn connect(config: &S3Config) -> Result<Self, GatewayError> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            expiry_secs = config.presign_expiry_secs,
            "S3 presign gateway initialized"
        );

        Ok(Self::with_client(
            client,
            config.bucket.clone(),
            config.presign_expiry(),
            config.presign_concurrency,
        ))
    }

    pub fn with_client(
        client: S3Client,
        bucket: impl Into<String>,
        expiry: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            expiry,
            permits: Semaphore::new(concurrency.max(1)),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl PresignGateway for S3Gateway {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn presign_put(&self, key: &str) -> Result<PresignedUpload, GatewayError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GatewayError::Closed)?;

        let presigning_config = PresigningConfig::expires_in(self.expiry)
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        let lifetime =
            chrono::Duration::from_std(self.expiry).map_err(|e| GatewayError::Config(e.to_string()))?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| GatewayError::Presign {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        debug!(key = %key, "Issued presigned upload URL");

        Ok(PresignedUpload {
            url: presigned.uri().to_string(),
            key: key.to_string(),
            expires_at: Utc::now() + lifetime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{Credentials, Region};

    fn test_gateway(expiry: Duration) -> S3Gateway {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("ap-northeast-2"))
            .credentials_provider(Credentials::new("AKIDTEST", "secret", None, None, "test"))
            .endpoint_url("http://localhost:9000")
            .force_path_style(true)
            .build();
        S3Gateway::with_client(S3Client::from_conf(config), "road-images", expiry, 2)
    }

    #[tokio::test]
    async fn test_presign_put_signs_key() {
        let gateway = test_gateway(Duration::from_secs(600));
        let before = Utc::now();

        let upload = gateway.presign_put("abc.jpg").await.unwrap();

        assert_eq!(upload.key, "abc.jpg");
        assert!(upload.url.starts_with("http://localhost:9000/road-images/abc.jpg?"));
        assert!(upload.url.contains("X-Amz-Expires=600"));
        assert!(upload.expires_at >= before + chrono::Duration::seconds(600));
    }

    #[tokio::test]
    async fn test_presign_rejects_overlong_expiry() {
        // SigV4 presigned URLs are capped at one week
        let gateway = test_gateway(Duration::from_secs(8 * 24 * 3600));

        let err = gateway.presign_put("abc.jpg").await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}

//! S3-compatible object storage (AWS S3, Cloudflare R2, MinIO, ...).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;

use crate::error::CloudError;
use crate::store::ObjectStore;

/// Provider name attached to the static credentials.
const CREDENTIALS_PROVIDER: &str = "kiln-env";

/// Connection and delivery settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    /// Custom endpoint for non-AWS providers.
    pub endpoint_url: Option<String>,
    pub region: String,
    /// When set, links are `{public_url}/{key}` instead of signed URLs.
    pub public_url: Option<String>,
    pub signed_url_expiry: Duration,
    /// Path-style addressing (`endpoint/bucket/key`).
    pub path_style: bool,
    pub cache_control: String,
}

/// [`ObjectStore`] backed by `aws-sdk-s3`.
#[derive(Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_url: Option<String>,
    signed_url_expiry: Duration,
    cache_control: String,
}

impl S3Store {
    /// Build a client from static credentials. No network traffic happens
    /// until the first upload.
    pub async fn connect(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER,
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.path_style)
            .build();

        tracing::info!(
            bucket = %config.bucket,
            endpoint = config.endpoint_url.as_deref().unwrap_or("aws"),
            region = %config.region,
            public_url = config.public_url.is_some(),
            "Object storage client configured",
        );

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            public_url: config.public_url.clone(),
            signed_url_expiry: config.signed_url_expiry,
            cache_control: config.cache_control.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<(), CloudError> {
        let body = ByteStream::from_path(path).await.map_err(|e| CloudError::Upload {
            key: key.to_string(),
            message: format!("cannot read {}: {e}", path.display()),
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .cache_control(&self.cache_control)
            .send()
            .await
            .map_err(|e| CloudError::Upload {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::debug!(bucket = %self.bucket, key, content_type, "Object uploaded");
        Ok(())
    }

    async fn access_url(&self, key: &str) -> Result<String, CloudError> {
        if let Some(prefix) = &self.public_url {
            return Ok(public_object_url(prefix, key));
        }

        let presigning = PresigningConfig::expires_in(self.signed_url_expiry).map_err(|e| {
            CloudError::AccessUrl {
                key: key.to_string(),
                message: e.to_string(),
            }
        })?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| CloudError::AccessUrl {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(request.uri().to_string())
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// `{prefix}/{key}` with exactly one slash between them.
pub fn public_object_url(prefix: &str, key: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), key.trim_start_matches('/'))
}

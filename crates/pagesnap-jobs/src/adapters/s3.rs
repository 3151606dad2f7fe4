//! S3-compatible artifact publisher.
//!
//! Uploads with path-style requests (`{endpoint}/{bucket}/{key}`) so the same
//! configuration works for AWS S3, MinIO and other compatible stores. The
//! client never retries: a failed upload is reported to the lifecycle
//! controller, which owns the retry policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::info;
use uuid::Uuid;

use pagesnap_core::defaults::{ARTIFACT_CONTENT_TYPE, S3_ACL, S3_ENDPOINT, S3_REGION};
use pagesnap_core::{ArtifactLocator, ArtifactPublisher, Error, PublishError, RasterImage, Result};

use super::artifact_store::put_artifact;

/// Upload timeout for a single artifact.
const UPLOAD_TIMEOUT_SECS: u64 = 60;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Static AWS credentials.
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// S3 publisher configuration.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Service endpoint, without the bucket.
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub credentials: Credentials,
    /// Canned ACL sent as `x-amz-acl`; `None` omits the header.
    pub acl: Option<String>,
    /// Base of the returned locator. Defaults to `{endpoint}/{bucket}`.
    pub public_base_url: Option<String>,
    pub timeout: Duration,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            endpoint: S3_ENDPOINT.to_string(),
            bucket: bucket.into(),
            region: S3_REGION.to_string(),
            credentials,
            acl: Some(S3_ACL.to_string()),
            public_base_url: None,
            timeout: Duration::from_secs(UPLOAD_TIMEOUT_SECS),
        }
    }

    /// Load from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BUCKET` | (required) |
    /// | `AWS_ACCESS_KEY_ID` | (required) |
    /// | `AWS_SECRET_ACCESS_KEY` | (required) |
    /// | `AWS_SESSION_TOKEN` | (none) |
    /// | `S3_ENDPOINT` | `https://s3.amazonaws.com` |
    /// | `S3_REGION` / `AWS_REGION` | `us-east-1` |
    /// | `S3_ACL` | `public-read` (empty string disables) |
    /// | `S3_PUBLIC_BASE_URL` | `{endpoint}/{bucket}` |
    pub fn from_env() -> Result<Self> {
        let bucket = required_env("BUCKET")?;
        let credentials = Credentials {
            access_key_id: required_env("AWS_ACCESS_KEY_ID")?,
            secret_access_key: required_env("AWS_SECRET_ACCESS_KEY")?,
            session_token: std::env::var("AWS_SESSION_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
        };

        let mut config = Self::new(bucket, credentials);
        if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(region) = std::env::var("S3_REGION").or_else(|_| std::env::var("AWS_REGION")) {
            config.region = region;
        }
        if let Ok(acl) = std::env::var("S3_ACL") {
            config.acl = Some(acl).filter(|v| !v.is_empty());
        }
        config.public_base_url = std::env::var("S3_PUBLIC_BASE_URL").ok();
        Ok(config)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_acl(mut self, acl: Option<String>) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_public_base_url(mut self, url: impl Into<String>) -> Self {
        self.public_base_url = Some(url.into());
        self
    }

    fn public_base(&self) -> String {
        match &self.public_base_url {
            Some(base) => base.clone(),
            None => format!("{}/{}", self.endpoint.trim_end_matches('/'), self.bucket),
        }
    }

    /// Every request carries the PNG content type and, when set, the canned ACL.
    fn client_options(&self) -> Result<ClientOptions> {
        let mut headers = HeaderMap::new();
        if let Some(acl) = &self.acl {
            let value = HeaderValue::from_str(acl)
                .map_err(|e| Error::Config(format!("invalid S3_ACL `{acl}`: {e}")))?;
            headers.insert(HeaderName::from_static("x-amz-acl"), value);
        }
        Ok(ClientOptions::new()
            .with_timeout(self.timeout)
            .with_connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .with_allow_http(self.endpoint.starts_with("http://"))
            .with_default_content_type(ARTIFACT_CONTENT_TYPE)
            .with_default_headers(headers))
    }

    fn build_store(&self) -> Result<Arc<dyn ObjectStore>> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&self.bucket)
            .with_region(&self.region)
            .with_endpoint(&self.endpoint)
            .with_virtual_hosted_style_request(false)
            .with_access_key_id(&self.credentials.access_key_id)
            .with_secret_access_key(&self.credentials.secret_access_key)
            .with_client_options(self.client_options()?)
            .with_retry(RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            });
        if let Some(token) = &self.credentials.session_token {
            builder = builder.with_token(token);
        }

        let store = builder
            .build()
            .map_err(|e| Error::Config(format!("S3: {e}")))?;
        Ok(Arc::new(store))
    }
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Config(format!("{name} must be set for the s3 artifact backend")))
}

/// Publishes PNG artifacts to an S3-compatible bucket.
pub struct S3Publisher {
    store: Arc<dyn ObjectStore>,
    public_base_url: String,
}

impl S3Publisher {
    pub fn new(config: S3Config) -> Result<Self> {
        let store = config.build_store()?;
        info!(
            subsystem = "jobs",
            component = "s3",
            endpoint = %config.endpoint,
            bucket = %config.bucket,
            region = %config.region,
            "Initializing S3 artifact publisher"
        );
        Ok(Self {
            store,
            public_base_url: config.public_base(),
        })
    }
}

#[async_trait]
impl ArtifactPublisher for S3Publisher {
    async fn publish(
        &self,
        job_id: Uuid,
        image: &RasterImage,
    ) -> std::result::Result<ArtifactLocator, PublishError> {
        put_artifact(
            self.store.as_ref(),
            "s3",
            &self.public_base_url,
            job_id,
            image,
        )
        .await
    }

    fn name(&self) -> &str {
        "s3"
    }
}

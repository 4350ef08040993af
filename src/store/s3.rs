use std::time::SystemTime;

use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::{Attribute, ObjectStore as _};

use crate::config;
use crate::constants;
use crate::store::{BoxFuture, ObjectBody, ObjectStore, StoreError};

/// S3-compatible bucket (AWS, MinIO, ...) addressed path-style.
#[derive(Debug)]
pub struct S3Store {
    inner: AmazonS3,
    bucket: String,
}

impl S3Store {
    pub fn new(cfg: &config::Backend) -> Result<Self> {
        let endpoint = endpoint_url(&cfg.endpoint, cfg.secure);
        let inner = AmazonS3Builder::new()
            .with_endpoint(&endpoint)
            .with_bucket_name(&cfg.bucket)
            .with_access_key_id(&cfg.access_key)
            .with_secret_access_key(&cfg.secret_key)
            .with_region(&cfg.region)
            .with_allow_http(!cfg.secure)
            .with_virtual_hosted_style_request(false)
            .build()
            .with_context(|| format!("build s3 client for {endpoint}"))?;
        Ok(Self {
            inner,
            bucket: cfg.bucket.clone(),
        })
    }

    /// Fails when the bucket is missing or the credentials are rejected.
    pub async fn verify_bucket(&self) -> Result<()> {
        self.inner
            .list_with_delimiter(None)
            .await
            .with_context(|| format!("bucket {} is not reachable", self.bucket))?;
        Ok(())
    }
}

impl ObjectStore for S3Store {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<ObjectBody, StoreError>> {
        Box::pin(async move {
            // Keys object_store cannot address (empty segments, `.`) cannot
            // be served either.
            let location = Path::parse(key).map_err(|err| {
                log::debug!("unaddressable key {key}: {err}");
                StoreError::NotFound
            })?;
            let result = self.inner.get(&location).await.map_err(map_error)?;
            let content_type = result
                .attributes
                .get(&Attribute::ContentType)
                .map(|value| {
                    let value: &str = value.as_ref();
                    value.trim().to_string()
                })
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| constants::DEFAULT_CONTENT_TYPE.to_string());
            let size = result.meta.size as u64;
            let last_modified: SystemTime = result.meta.last_modified.into();
            let stream = result.into_stream().map_err(map_error).boxed();
            Ok(ObjectBody {
                content_type,
                size,
                last_modified,
                stream,
            })
        })
    }
}

fn map_error(err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { .. } => StoreError::NotFound,
        other => StoreError::Backend(other.to_string()),
    }
}

fn endpoint_url(endpoint: &str, secure: bool) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        return endpoint.to_string();
    }
    let scheme = if secure { "https" } else { "http" };
    format!("{scheme}://{endpoint}")
}

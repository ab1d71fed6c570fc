//! S3-compatible storage backend using AWS SDK.
//!
//! A container maps to a bucket. Conditional requests use the native
//! `If-Match` / `If-None-Match` headers, so publishing a manifest against a
//! stale ETag fails with `412` on the server side.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    CloudStorage, CloudStorageListExt, ContinuationToken, DEFAULT_PAGE_SIZE, FetchCondition,
    Fetched, ListingPage, PutCondition, validate_key,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use bytes::Bytes;
use futures::TryStreamExt;
use std::time::Duration;
use tracing::instrument;

/// S3-compatible container.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: String,
    region: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend bound to `bucket`.
    ///
    /// # Arguments
    /// * `force_path_style` - Use path-style URLs (`endpoint/bucket/key`) instead of
    ///   virtual-hosted style (`bucket.endpoint/key`). Required for MinIO.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials = aws_sdk_s3::config::Credentials::new(
                key_id,
                secret,
                None, // session token
                None, // expiration
                "bcv-attach",
            );
            builder = builder.credentials_provider(credentials);
        } else {
            let chain = aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(aws_config::Region::new(resolved_region.clone()))
                .build()
                .await;
            builder = builder.credentials_provider(chain);
        }

        // Bare host:port endpoints (e.g. "minio:9000") get an http:// scheme.
        let normalized_endpoint = endpoint.map(|url| {
            let lower = url.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                url
            } else {
                format!("http://{url}")
            }
        });
        if let Some(url) = &normalized_endpoint {
            builder = builder.endpoint_url(url);
        }
        if force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
            endpoint: normalized_endpoint
                .unwrap_or_else(|| format!("s3.{resolved_region}.amazonaws.com")),
            region: resolved_region,
        })
    }

    /// Full object key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Strip the configured prefix from a full object key.
    fn strip_prefix<'k>(&self, full_key: &'k str) -> &'k str {
        match &self.prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full_key),
            None => full_key,
        }
    }

    /// Convert an SDK error, passing HTTP statuses through.
    fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(raw) = err.raw_response() {
            let status = raw.status().as_u16();
            if status >= 300 {
                let retry_after = raw
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let message = format!("{key}: {}", DisplayErrorContext(&err));
                return match StorageError::from_status(status, message) {
                    StorageError::Http {
                        status, message, ..
                    } => StorageError::Http {
                        status,
                        message,
                        retry_after,
                    },
                    other => other,
                };
            }
        }
        StorageError::S3(Box::new(err))
    }
}

#[async_trait]
impl CloudStorage for S3Backend {
    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn fetch(&self, key: &str, condition: FetchCondition) -> StorageResult<Fetched> {
        validate_key(key)?;
        let mut request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key));
        request = match condition {
            FetchCondition::None => request,
            FetchCondition::IfNoneMatch(etag) => request.if_none_match(etag),
            // Single-part uploads carry the content MD5 as their ETag.
            FetchCondition::IfContentDiffers(digest) => {
                request.if_none_match(format!("\"{}\"", hex::encode(digest)))
            }
        };

        let output = request
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;
        let etag = output.e_tag().map(str::to_string);
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();

        Ok(Fetched { data, etag })
    }

    #[instrument(skip(self, data), fields(backend = "s3", bucket = %self.bucket, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, condition: PutCondition) -> StorageResult<String> {
        validate_key(key)?;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(data.into());
        request = match condition {
            PutCondition::None => request,
            PutCondition::IfMatch(etag) => request.if_match(etag),
            PutCondition::IfNotExists => request.if_none_match("*"),
        };

        let output = request
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;
        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn delete(&self, key: &str, etag: Option<&str>) -> StorageResult<()> {
        validate_key(key)?;
        let full_key = self.full_key(key);

        // delete_object succeeds on missing keys, so probe first to report
        // 404 and to honour the ETag condition.
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;
        if let Some(expected) = etag
            && head.e_tag() != Some(expected)
        {
            return Err(StorageError::PreconditionFailed(key.to_string()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn list(
        &self,
        prefix: &str,
        marker: Option<ContinuationToken>,
    ) -> StorageResult<ListingPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.full_key(prefix))
            .max_keys(DEFAULT_PAGE_SIZE as i32);
        if let Some(token) = &marker {
            request = request.continuation_token(token.as_str()?);
        }

        let output = request
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, prefix))?;

        let keys = output
            .contents()
            .iter()
            .filter_map(|obj| obj.key())
            .map(|k| self.strip_prefix(k).to_string())
            .collect();
        let next_token = match output.next_continuation_token() {
            Some(token) if output.is_truncated() == Some(true) => {
                Some(ContinuationToken::new(token.as_bytes().to_vec())?)
            }
            _ => None,
        };
        Ok(ListingPage { keys, next_token })
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn create(&self) -> StorageResult<()> {
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, &self.bucket))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn destroy(&self) -> StorageResult<()> {
        let keys: Vec<String> = self.list_stream("").try_collect().await?;
        for key in &keys {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(self.full_key(key))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, key))?;
        }
        if self.prefix.is_none() {
            self.client
                .delete_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, &self.bucket))?;
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    fn container(&self) -> &str {
        &self.bucket
    }
}

//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// Number of keys returned per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Maximum size for continuation tokens (2 KB).
pub const MAX_TOKEN_SIZE: usize = 2048;

/// An opaque continuation token for resuming a listing.
///
/// The content is backend-specific and must not be interpreted by callers.
#[derive(Clone, PartialEq, Eq)]
pub struct ContinuationToken(Vec<u8>);

impl ContinuationToken {
    /// Create a new continuation token from raw bytes.
    ///
    /// Returns an error if the token exceeds MAX_TOKEN_SIZE.
    pub fn new(data: Vec<u8>) -> StorageResult<Self> {
        if data.len() > MAX_TOKEN_SIZE {
            return Err(StorageError::InvalidContinuationToken(format!(
                "continuation token too large: {} bytes (max: {})",
                data.len(),
                MAX_TOKEN_SIZE
            )));
        }
        Ok(Self(data))
    }

    /// Interpret the token as UTF-8, as the filesystem, memory and S3
    /// backends produce.
    pub fn as_str(&self) -> StorageResult<&str> {
        std::str::from_utf8(&self.0).map_err(|e| {
            StorageError::InvalidContinuationToken(format!("token is not UTF-8: {e}"))
        })
    }
}

impl std::fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContinuationToken")
            .field(&"<redacted>")
            .finish()
    }
}

/// A single page of listing results.
#[derive(Clone, Debug, Default)]
pub struct ListingPage {
    /// Object keys in this page.
    pub keys: Vec<String>,

    /// Marker for the next page. `None` on the last page.
    pub next_token: Option<ContinuationToken>,
}

/// Condition attached to a fetch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FetchCondition {
    /// Unconditional GET.
    #[default]
    None,
    /// `If-None-Match: <etag>`: yields [`StorageError::NotModified`] when
    /// the object still carries this ETag.
    IfNoneMatch(String),
    /// Yields [`StorageError::NotModified`] when the object's MD5 equals
    /// the given digest.
    IfContentDiffers([u8; 16]),
}

/// Condition attached to a put.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional overwrite.
    #[default]
    None,
    /// `If-Match: <etag>`: yields [`StorageError::PreconditionFailed`] when
    /// the object has changed or does not exist.
    IfMatch(String),
    /// `If-None-Match: *`: yields [`StorageError::PreconditionFailed`] when
    /// the object already exists.
    IfNotExists,
}

/// Body and version of a fetched object.
#[derive(Clone, Debug)]
pub struct Fetched {
    pub data: Bytes,
    pub etag: Option<String>,
}

/// A handle on one remote container.
///
/// Every operation maps to a single HTTP request against the provider. HTTP
/// failures surface through [`StorageError::status`] unchanged; backends
/// never retry.
#[async_trait]
pub trait CloudStorage: Send + Sync + 'static {
    /// Download an object.
    async fn fetch(&self, key: &str, condition: FetchCondition) -> StorageResult<Fetched>;

    /// Upload an object and return its new ETag.
    async fn put(&self, key: &str, data: Bytes, condition: PutCondition) -> StorageResult<String>;

    /// Delete an object, optionally only if it still carries `etag`.
    async fn delete(&self, key: &str, etag: Option<&str>) -> StorageResult<()>;

    /// List one page of object keys starting with `prefix`.
    async fn list(
        &self,
        prefix: &str,
        marker: Option<ContinuationToken>,
    ) -> StorageResult<ListingPage>;

    /// Create the container. Fails with [`StorageError::AlreadyExists`] if
    /// it exists.
    async fn create(&self) -> StorageResult<()>;

    /// Delete the container and everything in it.
    async fn destroy(&self) -> StorageResult<()>;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3",
    /// "filesystem"). Used for logging.
    fn backend_name(&self) -> &'static str;

    /// Name of the remote container this handle is bound to.
    fn container(&self) -> &str;

    /// Replace the credential presented with every request.
    ///
    /// Called after a `403` once a fresh token has been obtained. Backends
    /// without per-request credentials ignore it.
    fn set_auth(&self, _auth: Option<String>) {}
}

/// A boxed stream of object keys.
pub type KeyStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<String>> + Send + 'a>>;

/// Flattened listing built on [`CloudStorage::list`].
///
/// Implemented for every [`CloudStorage`] through a blanket impl.
pub trait CloudStorageListExt: CloudStorage {
    /// Stream every key starting with `prefix`, following continuation
    /// tokens until the last page.
    fn list_stream<'a>(&'a self, prefix: &str) -> KeyStream<'a> {
        use futures::StreamExt;

        enum State {
            Start,
            Next(ContinuationToken),
            Done,
        }

        let prefix = prefix.to_string();
        let pages = futures::stream::unfold(State::Start, move |state| {
            let prefix = prefix.clone();
            async move {
                let marker = match state {
                    State::Start => None,
                    State::Next(token) => Some(token),
                    State::Done => return None,
                };
                match self.list(&prefix, marker).await {
                    Ok(page) => {
                        let next = match page.next_token {
                            Some(token) => State::Next(token),
                            None => State::Done,
                        };
                        Some((Ok(page.keys), next))
                    }
                    Err(e) => Some((Err(e), State::Done)),
                }
            }
        });

        Box::pin(pages.flat_map(|page| match page {
            Ok(keys) => futures::stream::iter(keys.into_iter().map(Ok)).boxed(),
            Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
        }))
    }

    /// Collect every key starting with `prefix`.
    fn list_all<'a>(
        &'a self,
        prefix: &str,
    ) -> Pin<Box<dyn std::future::Future<Output = StorageResult<Vec<String>>> + Send + 'a>> {
        use futures::TryStreamExt;
        let stream = self.list_stream(prefix);
        Box::pin(stream.try_collect())
    }
}

impl<T: CloudStorage + ?Sized> CloudStorageListExt for T {}

/// Reject keys that are not flat object names.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty()
        || key.contains("..")
        || key.contains('/')
        || key.contains('\\')
        || key.contains('\0')
    {
        return Err(StorageError::InvalidKey(format!(
            "not a flat object name: {key:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_token_rejects_oversized_input() {
        let err = ContinuationToken::new(vec![b'A'; MAX_TOKEN_SIZE + 1]).unwrap_err();
        assert!(matches!(err, StorageError::InvalidContinuationToken(_)));
        let token = ContinuationToken::new(b"00AB.bcv".to_vec()).unwrap();
        assert_eq!(token.as_str().unwrap(), "00AB.bcv");
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("manifest.bcv").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../escape").is_err());
        assert!(validate_key("nested/key").is_err());
    }
}

//! Cloud storage modules for the block-cache engine.
//!
//! This crate provides:
//! - The [`CloudStorage`] contract: conditional fetch/put, delete, paged
//!   listing, container create/destroy
//! - Backends: local filesystem, in-process memory accounts, S3-compatible
//! - [`StorageOpener`], the context object that turns an attach request into
//!   a container handle

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{
    filesystem::FilesystemBackend,
    memory::{MemoryAccount, MemoryBackend, StorageOp},
    s3::S3Backend,
};
pub use error::{StorageError, StorageResult};
pub use traits::{
    CloudStorage, CloudStorageListExt, ContinuationToken, FetchCondition, Fetched, KeyStream,
    ListingPage, PutCondition,
};

use bcv_core::config::StorageConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Opens container handles for attach requests.
///
/// Holds the named in-memory accounts so every handle opened through the
/// same opener shares their contents.
#[derive(Default)]
pub struct StorageOpener {
    memory: Mutex<HashMap<String, Arc<MemoryAccount>>>,
}

impl StorageOpener {
    /// Create an opener with no memory accounts.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get (or create) the memory account `name`.
    pub fn memory_account(&self, name: &str) -> Arc<MemoryAccount> {
        let mut accounts = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        accounts
            .entry(name.to_string())
            .or_insert_with(|| MemoryAccount::new(name))
            .clone()
    }

    /// Open a handle on `container` described by `config`.
    ///
    /// `auth` is the credential presented with each request: the token for
    /// memory accounts, the secret access key for S3.
    pub async fn open(
        &self,
        config: &StorageConfig,
        container: &str,
        auth: Option<String>,
    ) -> StorageResult<Arc<dyn CloudStorage>> {
        debug!(module = config.module_name(), container, "opening storage");
        match config {
            StorageConfig::Filesystem { root } => {
                let backend = FilesystemBackend::new(root, container).await?;
                Ok(Arc::new(backend))
            }
            StorageConfig::Memory { account } => {
                let account = self.memory_account(account);
                Ok(Arc::new(MemoryBackend::new(account, container, auth)))
            }
            StorageConfig::S3 {
                endpoint,
                region,
                prefix,
                access_key_id,
                secret_access_key,
                force_path_style,
            } => {
                let secret = secret_access_key
                    .clone()
                    .or_else(|| access_key_id.as_ref().and(auth));
                let config = StorageConfig::S3 {
                    endpoint: endpoint.clone(),
                    region: region.clone(),
                    prefix: prefix.clone(),
                    access_key_id: access_key_id.clone(),
                    secret_access_key: secret.clone(),
                    force_path_style: *force_path_style,
                };
                config.validate().map_err(StorageError::Config)?;

                let backend = S3Backend::new(
                    container,
                    endpoint.clone(),
                    region.clone(),
                    prefix.clone(),
                    access_key_id.clone(),
                    secret,
                    *force_path_style,
                )
                .await?;
                Ok(Arc::new(backend))
            }
        }
    }
}

/// Open a handle without shared memory accounts.
pub async fn open(
    config: &StorageConfig,
    container: &str,
    auth: Option<String>,
) -> StorageResult<Arc<dyn CloudStorage>> {
    StorageOpener::default().open(config, container, auth).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_filesystem() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            root: temp.path().join("store"),
        };
        let store = open(&config, "cont", None).await.unwrap();
        store.create().await.unwrap();
        store
            .put("manifest.bcv", Bytes::from_static(b"m"), PutCondition::None)
            .await
            .unwrap();
        assert_eq!(store.backend_name(), "filesystem");
        assert!(temp.path().join("store/cont/manifest.bcv").exists());
    }

    #[tokio::test]
    async fn test_opener_shares_memory_accounts() {
        let opener = StorageOpener::new();
        let config = StorageConfig::Memory {
            account: "acct".to_string(),
        };
        let a = opener.open(&config, "cont", None).await.unwrap();
        let b = opener.open(&config, "cont", None).await.unwrap();
        a.create().await.unwrap();
        a.put("x.bcv", Bytes::from_static(b"1"), PutCondition::None)
            .await
            .unwrap();
        let fetched = b.fetch("x.bcv", FetchCondition::None).await.unwrap();
        assert_eq!(fetched.data, Bytes::from_static(b"1"));
        assert_eq!(opener.memory_account("acct").request_count(StorageOp::Put), 1);
    }

    #[tokio::test]
    async fn test_open_s3_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: None,
            secret_access_key: Some("secret".to_string()),
            force_path_style: false,
        };
        match open(&config, "bucket", None).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_s3_takes_secret_from_auth() {
        let config = StorageConfig::from_attach("s3?endpoint=minio:9000", "AKIA").unwrap();
        let store = open(&config, "bucket", Some("secret".to_string()))
            .await
            .unwrap();
        assert_eq!(store.container(), "bucket");
    }
}

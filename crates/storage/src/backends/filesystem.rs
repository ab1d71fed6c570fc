//! Local filesystem storage backend.
//!
//! A container is a directory below the backend root and every object is a
//! file inside it. ETags are SHA-256 digests of the object content, so two
//! handles on the same directory agree on versions without shared state.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    CloudStorage, ContinuationToken, DEFAULT_PAGE_SIZE, FetchCondition, Fetched, ListingPage,
    PutCondition, validate_key,
};
use async_trait::async_trait;
use bytes::Bytes;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

/// Filesystem-backed container.
pub struct FilesystemBackend {
    root: PathBuf,
    container: String,
    dir: PathBuf,
    /// Serializes conditional writes issued through this handle.
    write_lock: Mutex<()>,
}

impl FilesystemBackend {
    /// Create a handle on `container` below `root`.
    ///
    /// The root directory is created if missing; the container directory is
    /// only created by [`CloudStorage::create`].
    pub async fn new(root: impl AsRef<Path>, container: &str) -> StorageResult<Self> {
        validate_key(container)?;
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            dir: root.join(container),
            root,
            container: container.to_string(),
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory holding every container.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }

    async fn ensure_container(&self) -> StorageResult<()> {
        match fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::Config(format!(
                "container path is not a directory: {:?}",
                self.dir
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(
                format!("container {}", self.container),
            )),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Current ETag of an object, or `None` if it does not exist.
    async fn current_etag(&self, path: &Path) -> StorageResult<Option<String>> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(etag_of(&data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

fn etag_of(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl CloudStorage for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem", container = %self.container))]
    async fn fetch(&self, key: &str, condition: FetchCondition) -> StorageResult<Fetched> {
        let path = self.key_path(key)?;
        self.ensure_container().await?;
        let data = fs::read(&path).await.map_err(not_found(key))?;
        let etag = etag_of(&data);

        match &condition {
            FetchCondition::IfNoneMatch(expected) if *expected == etag => {
                return Err(StorageError::NotModified(key.to_string()));
            }
            FetchCondition::IfContentDiffers(digest)
                if Md5::digest(&data).as_slice() == digest.as_slice() =>
            {
                return Err(StorageError::NotModified(key.to_string()));
            }
            _ => {}
        }

        Ok(Fetched {
            data: Bytes::from(data),
            etag: Some(etag),
        })
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", container = %self.container, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, condition: PutCondition) -> StorageResult<String> {
        let path = self.key_path(key)?;
        self.ensure_container().await?;
        let _guard = self.write_lock.lock().await;

        match &condition {
            PutCondition::None => {}
            PutCondition::IfMatch(expected) => {
                if self.current_etag(&path).await?.as_deref() != Some(expected.as_str()) {
                    return Err(StorageError::PreconditionFailed(key.to_string()));
                }
            }
            PutCondition::IfNotExists => {
                if fs::try_exists(&path).await? {
                    return Err(StorageError::PreconditionFailed(key.to_string()));
                }
            }
        }

        // Temp file plus rename so readers never observe a partial object.
        let temp_path = self.dir.join(format!(".{key}.tmp.{}", Uuid::new_v4()));
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;

        Ok(etag_of(&data))
    }

    #[instrument(skip(self), fields(backend = "filesystem", container = %self.container))]
    async fn delete(&self, key: &str, etag: Option<&str>) -> StorageResult<()> {
        let path = self.key_path(key)?;
        let _guard = self.write_lock.lock().await;
        if let Some(expected) = etag {
            match self.current_etag(&path).await? {
                Some(current) if current == expected => {}
                Some(_) => return Err(StorageError::PreconditionFailed(key.to_string())),
                None => return Err(StorageError::NotFound(key.to_string())),
            }
        }
        fs::remove_file(&path).await.map_err(not_found(key))
    }

    #[instrument(skip(self), fields(backend = "filesystem", container = %self.container))]
    async fn list(
        &self,
        prefix: &str,
        marker: Option<ContinuationToken>,
    ) -> StorageResult<ListingPage> {
        self.ensure_container().await?;
        let after = match &marker {
            Some(token) => Some(token.as_str()?.to_string()),
            None => None,
        };

        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            // Skip directories and symlinks; objects are plain files.
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.starts_with(prefix) {
                continue;
            }
            if after.as_ref().is_some_and(|after| name.as_str() <= after.as_str()) {
                continue;
            }
            keys.push(name);
        }
        keys.sort();

        let next_token = if keys.len() > DEFAULT_PAGE_SIZE {
            keys.truncate(DEFAULT_PAGE_SIZE);
            let last = keys.last().cloned().unwrap_or_default();
            Some(ContinuationToken::new(last.into_bytes())?)
        } else {
            None
        };

        Ok(ListingPage { keys, next_token })
    }

    #[instrument(skip(self), fields(backend = "filesystem", container = %self.container))]
    async fn create(&self) -> StorageResult<()> {
        match fs::create_dir(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(
                StorageError::AlreadyExists(format!("container {}", self.container)),
            ),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem", container = %self.container))]
    async fn destroy(&self) -> StorageResult<()> {
        fs::remove_dir_all(&self.dir)
            .await
            .map_err(not_found(&self.container))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    fn container(&self) -> &str {
        &self.container
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend(dir: &Path) -> FilesystemBackend {
        let backend = FilesystemBackend::new(dir, "cont").await.unwrap();
        backend.create().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_put_fetch_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;

        let etag = backend
            .put("obj.bcv", Bytes::from("hello world"), PutCondition::None)
            .await
            .unwrap();
        let fetched = backend
            .fetch("obj.bcv", FetchCondition::None)
            .await
            .unwrap();
        assert_eq!(fetched.data, Bytes::from("hello world"));
        assert_eq!(fetched.etag.as_deref(), Some(etag.as_str()));
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;

        let e1 = backend
            .put("manifest.bcv", Bytes::from("v1"), PutCondition::IfNotExists)
            .await
            .unwrap();
        let err = backend
            .put("manifest.bcv", Bytes::from("v1b"), PutCondition::IfNotExists)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(412));

        let e2 = backend
            .put("manifest.bcv", Bytes::from("v2"), PutCondition::IfMatch(e1.clone()))
            .await
            .unwrap();
        assert_ne!(e1, e2);

        // Stale ETag never overwrites.
        let err = backend
            .put("manifest.bcv", Bytes::from("v3"), PutCondition::IfMatch(e1))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(412));
        let fetched = backend
            .fetch("manifest.bcv", FetchCondition::None)
            .await
            .unwrap();
        assert_eq!(fetched.data, Bytes::from("v2"));
    }

    #[tokio::test]
    async fn test_conditional_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;
        let etag = backend
            .put("m.bcv", Bytes::from("data"), PutCondition::None)
            .await
            .unwrap();

        let err = backend
            .fetch("m.bcv", FetchCondition::IfNoneMatch(etag))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(304));

        let digest: [u8; 16] = Md5::digest(b"data").into();
        let err = backend
            .fetch("m.bcv", FetchCondition::IfContentDiffers(digest))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(304));

        let err = backend
            .fetch("missing.bcv", FetchCondition::None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_missing_container() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path(), "absent").await.unwrap();
        let err = backend
            .put("manifest.bcv", Bytes::from("x"), PutCondition::IfNotExists)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));

        backend.create().await.unwrap();
        assert_eq!(backend.create().await.unwrap_err().status(), Some(409));
        backend.destroy().await.unwrap();
        assert_eq!(backend.destroy().await.unwrap_err().status(), Some(404));
    }

    #[tokio::test]
    async fn test_list_prefix_and_pages() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;
        for i in 0..(DEFAULT_PAGE_SIZE + 5) {
            backend
                .put(&format!("{i:08X}.bcv"), Bytes::new(), PutCondition::None)
                .await
                .unwrap();
        }
        backend
            .put("manifest.bcv", Bytes::new(), PutCondition::None)
            .await
            .unwrap();

        let first = backend.list("0", None).await.unwrap();
        assert_eq!(first.keys.len(), DEFAULT_PAGE_SIZE);
        let token = first.next_token.expect("second page");
        let second = backend.list("0", Some(token)).await.unwrap();
        assert_eq!(second.keys.len(), 5);
        assert!(second.next_token.is_none());
        assert!(second.keys.iter().all(|k| k.as_str() > first.keys[999].as_str()));
    }

    #[tokio::test]
    async fn test_delete_with_etag() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;
        let etag = backend
            .put("a.bcv", Bytes::from("a"), PutCondition::None)
            .await
            .unwrap();
        let err = backend.delete("a.bcv", Some("bogus")).await.unwrap_err();
        assert_eq!(err.status(), Some(412));
        backend.delete("a.bcv", Some(&etag)).await.unwrap();
        assert_eq!(
            backend.delete("a.bcv", None).await.unwrap_err().status(),
            Some(404)
        );
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path()).await;
        for key in ["../escape", "/abs", "a/b", ""] {
            let err = backend.fetch(key, FetchCondition::None).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey(_)), "{key}");
        }
        assert!(FilesystemBackend::new(dir.path(), "..").await.is_err());
    }
}

//! Container repository.

use crate::error::MetadataResult;
use crate::models::ContainerRow;
use async_trait::async_trait;

/// Repository for attached containers.
#[async_trait]
pub trait ContainerRepo: Send + Sync {
    /// Record a new attachment. Fails with `AlreadyExists` if the alias is taken.
    async fn insert_container(&self, container: &ContainerRow) -> MetadataResult<()>;

    /// Look up an attachment by alias.
    async fn get_container(&self, alias: &str) -> MetadataResult<Option<ContainerRow>>;

    /// Every attachment, ordered by alias.
    async fn list_containers(&self) -> MetadataResult<Vec<ContainerRow>>;

    /// Store the latest manifest blob and its ETag.
    async fn update_manifest(
        &self,
        alias: &str,
        manifest: &[u8],
        etag: Option<&str>,
    ) -> MetadataResult<()>;

    /// Remove an attachment and its dirty block rows.
    async fn delete_container(&self, alias: &str) -> MetadataResult<()>;
}

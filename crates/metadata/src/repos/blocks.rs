//! Block repository.

use crate::error::MetadataResult;
use crate::models::BlockRow;
use async_trait::async_trait;

/// Repository for cache-slot rows.
#[async_trait]
pub trait BlockRepo: Send + Sync {
    /// Record the content of a slot, replacing whatever it held before.
    async fn upsert_block(&self, block: &BlockRow) -> MetadataResult<()>;

    /// Forget a slot.
    async fn delete_block(&self, slot: i64) -> MetadataResult<()>;

    /// Every recorded slot, ordered by LRU tick (oldest first).
    async fn list_blocks(&self) -> MetadataResult<Vec<BlockRow>>;

    /// Drop the dirty rows of a container. Returns the number removed.
    async fn delete_dirty_blocks(&self, container: &str) -> MetadataResult<u64>;
}

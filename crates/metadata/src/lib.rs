//! Local metadata for the block-cache engine.
//!
//! The blocks database records which cache-file slot holds which block and
//! which containers are attached, so a restarted daemon can reuse its cache:
//! - Block rows: slot to block id (clean) or to database position (dirty)
//! - Container rows: attach parameters plus the last manifest seen

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{BlockRow, ContainerRow};
pub use repos::{BlockRepo, ContainerRepo};
pub use store::{MetadataStore, SqliteStore};

use std::path::Path;
use std::sync::Arc;

/// Open the blocks database at `path`.
pub async fn open(path: impl AsRef<Path>) -> MetadataResult<Arc<dyn MetadataStore>> {
    let store = SqliteStore::new(path).await?;
    Ok(Arc::new(store) as Arc<dyn MetadataStore>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("sub").join("blocksdb.bcv");
        let store = open(&db_path).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }
}

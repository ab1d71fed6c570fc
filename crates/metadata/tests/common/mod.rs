use bcv_metadata::{ContainerRow, SqliteStore};
use tempfile::TempDir;
use time::OffsetDateTime;

/// A fresh blocks database in a temporary directory.
pub async fn setup_store() -> (TempDir, SqliteStore) {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::new(dir.path().join("blocksdb.bcv"))
        .await
        .unwrap();
    (dir, store)
}

/// A container row with deterministic fields.
pub fn container_row(alias: &str) -> ContainerRow {
    ContainerRow {
        alias: alias.to_string(),
        storage: "memory".to_string(),
        account: "acct".to_string(),
        container: format!("{alias}-remote"),
        flags: 0,
        manifest: None,
        etag: None,
        encryption_key: None,
        attached_at: OffsetDateTime::UNIX_EPOCH,
    }
}

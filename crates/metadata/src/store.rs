//! Metadata store trait and SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{BlockRepo, ContainerRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: BlockRepo + ContainerRepo + Send + Sync {
    /// Create tables that do not exist yet.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store (`blocksdb.bcv`).
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the blocks database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // One owner mutates the cache; a single connection keeps writes ordered.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "opened blocks database");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;

    #[async_trait]
    impl BlockRepo for SqliteStore {
        async fn upsert_block(&self, block: &BlockRow) -> MetadataResult<()> {
            if block.block_id.is_none() && block.container.is_none() {
                return Err(MetadataError::Constraint(format!(
                    "slot {} has neither a block id nor a container",
                    block.slot
                )));
            }
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO blocks (slot, block_id, container, db_id, db_pos, lru_tick)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(block.slot)
            .bind(&block.block_id)
            .bind(&block.container)
            .bind(&block.db_id)
            .bind(block.db_pos)
            .bind(block.lru_tick)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn delete_block(&self, slot: i64) -> MetadataResult<()> {
            sqlx::query("DELETE FROM blocks WHERE slot = ?")
                .bind(slot)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn list_blocks(&self) -> MetadataResult<Vec<BlockRow>> {
            let rows = sqlx::query_as::<_, BlockRow>(
                "SELECT slot, block_id, container, db_id, db_pos, lru_tick FROM blocks ORDER BY lru_tick, slot",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_dirty_blocks(&self, container: &str) -> MetadataResult<u64> {
            let result =
                sqlx::query("DELETE FROM blocks WHERE block_id IS NULL AND container = ?")
                    .bind(container)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl ContainerRepo for SqliteStore {
        async fn insert_container(&self, container: &ContainerRow) -> MetadataResult<()> {
            match sqlx::query(
                r#"
                INSERT INTO containers (alias, storage, account, container, flags, manifest, etag, encryption_key, attached_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&container.alias)
            .bind(&container.storage)
            .bind(&container.account)
            .bind(&container.container)
            .bind(container.flags)
            .bind(&container.manifest)
            .bind(&container.etag)
            .bind(&container.encryption_key)
            .bind(container.attached_at)
            .execute(&self.pool)
            .await
            {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                    MetadataError::AlreadyExists(format!("container alias {}", container.alias)),
                ),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_container(&self, alias: &str) -> MetadataResult<Option<ContainerRow>> {
            let row =
                sqlx::query_as::<_, ContainerRow>("SELECT * FROM containers WHERE alias = ?")
                    .bind(alias)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_containers(&self) -> MetadataResult<Vec<ContainerRow>> {
            let rows = sqlx::query_as::<_, ContainerRow>("SELECT * FROM containers ORDER BY alias")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn update_manifest(
            &self,
            alias: &str,
            manifest: &[u8],
            etag: Option<&str>,
        ) -> MetadataResult<()> {
            let result = sqlx::query("UPDATE containers SET manifest = ?, etag = ? WHERE alias = ?")
                .bind(manifest)
                .bind(etag)
                .bind(alias)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("container alias {alias}")));
            }
            Ok(())
        }

        async fn delete_container(&self, alias: &str) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM blocks WHERE block_id IS NULL AND container = ?")
                .bind(alias)
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM containers WHERE alias = ?")
                .bind(alias)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("container alias {alias}")));
            }
            tx.commit().await?;
            Ok(())
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Cache-file slots worth keeping across restarts
CREATE TABLE IF NOT EXISTS blocks (
    slot INTEGER PRIMARY KEY,
    block_id BLOB,
    container TEXT,
    db_id BLOB,
    db_pos INTEGER,
    lru_tick INTEGER NOT NULL DEFAULT 0,
    CHECK (block_id IS NOT NULL OR container IS NOT NULL)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_blocks_block_id ON blocks(block_id) WHERE block_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_blocks_container ON blocks(container);

-- Attached containers
CREATE TABLE IF NOT EXISTS containers (
    alias TEXT PRIMARY KEY,
    storage TEXT NOT NULL,
    account TEXT NOT NULL,
    container TEXT NOT NULL,
    flags INTEGER NOT NULL DEFAULT 0,
    manifest BLOB,
    etag TEXT,
    encryption_key BLOB,
    attached_at TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlockRow;

    #[tokio::test]
    async fn test_block_rows_need_an_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("blocksdb.bcv"))
            .await
            .unwrap();
        let orphan = BlockRow {
            slot: 0,
            block_id: None,
            container: None,
            db_id: None,
            db_pos: None,
            lru_tick: 0,
        };
        assert!(matches!(
            store.upsert_block(&orphan).await,
            Err(MetadataError::Constraint(_))
        ));
    }
}

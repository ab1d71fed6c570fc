//! Rows of the local blocks database.

use sqlx::FromRow;
use time::OffsetDateTime;

/// A cache-file slot that holds block data worth keeping across restarts.
///
/// Clean blocks are keyed by `block_id`. Dirty blocks have no id yet and are
/// keyed by the container alias, database id and block position instead.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct BlockRow {
    pub slot: i64,
    pub block_id: Option<Vec<u8>>,
    pub container: Option<String>,
    pub db_id: Option<Vec<u8>>,
    pub db_pos: Option<i64>,
    pub lru_tick: i64,
}

impl BlockRow {
    /// Row for a clean, published block.
    pub fn clean(slot: u32, block_id: &[u8], lru_tick: u64) -> Self {
        Self {
            slot: i64::from(slot),
            block_id: Some(block_id.to_vec()),
            container: None,
            db_id: None,
            db_pos: None,
            lru_tick: lru_tick as i64,
        }
    }

    /// Row for a locally written, unpublished block.
    pub fn dirty(slot: u32, container: &str, db_id: &[u8], db_pos: u32, lru_tick: u64) -> Self {
        Self {
            slot: i64::from(slot),
            block_id: None,
            container: Some(container.to_string()),
            db_id: Some(db_id.to_vec()),
            db_pos: Some(i64::from(db_pos)),
            lru_tick: lru_tick as i64,
        }
    }

    /// True for rows describing unpublished data.
    pub fn is_dirty(&self) -> bool {
        self.block_id.is_none()
    }
}

/// An attached container.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ContainerRow {
    pub alias: String,
    pub storage: String,
    pub account: String,
    pub container: String,
    pub flags: i64,
    pub manifest: Option<Vec<u8>>,
    pub etag: Option<String>,
    pub encryption_key: Option<Vec<u8>>,
    pub attached_at: OffsetDateTime,
}

//! Rows of the `bcv_container`, `bcv_database`, `bcv_block` and `bcv_kv`
//! virtual tables, returned to clients as a JSON array of objects.

use crate::cache::CacheKey;
use crate::container::{Container, Staged};
use crate::engine::Engine;
use crate::error::{BcvError, BcvResult};
use bcv_core::ManifestDb;
use serde_json::{Map, Value, json};

pub const BCV_CONTAINER: &str = "bcv_container";
pub const BCV_DATABASE: &str = "bcv_database";
pub const BCV_BLOCK: &str = "bcv_block";
pub const BCV_KV: &str = "bcv_kv";

const CONTAINER_COLUMNS: &[&str] = &["name", "storage", "user", "container", "ncleanup"];
const DATABASE_COLUMNS: &[&str] = &["container", "database", "nblock", "ncache", "ndirty", "state"];
const BLOCK_COLUMNS: &[&str] = &["container", "database", "blockno", "blockid", "cache", "dirty"];
const KV_COLUMNS: &[&str] = &["name", "value"];

/// Column names of `table`, in column-mask bit order.
pub fn columns(table: &str) -> Option<&'static [&'static str]> {
    match table {
        BCV_CONTAINER => Some(CONTAINER_COLUMNS),
        BCV_DATABASE => Some(DATABASE_COLUMNS),
        BCV_BLOCK => Some(BLOCK_COLUMNS),
        BCV_KV => Some(KV_COLUMNS),
        _ => None,
    }
}

/// Build the rows of `table` as JSON, optionally restricted to one container
/// and database. Columns whose bit is clear in `col_used` are `null`.
///
/// `bcv_kv` lists the key-value store of one container as last read; the
/// caller loads it first.
pub fn rows(
    engine: &Engine,
    table: &str,
    container: Option<&str>,
    database: Option<&str>,
    col_used: u64,
) -> BcvResult<String> {
    let names = columns(table).ok_or_else(|| BcvError::Misuse(format!("no such table: {table}")))?;
    if table == BCV_KV {
        let alias =
            container.ok_or_else(|| BcvError::Misuse(format!("{table} requires a container")))?;
        let kv = engine.container(alias)?.kv.as_ref().ok_or_else(|| {
            BcvError::Misuse(format!("key-value store of {alias} has not been read"))
        })?;
        let out: Vec<Value> = kv
            .iter()
            .map(|(name, value)| row(names, col_used, vec![json!(name), json!(value)]))
            .collect();
        return Ok(Value::Array(out).to_string());
    }
    let containers: Vec<&Container> = match container {
        Some(alias) => vec![engine.container(alias)?],
        None => engine.containers().collect(),
    };

    let mut out = Vec::new();
    for c in containers {
        if table == BCV_CONTAINER {
            out.push(row(
                names,
                col_used,
                vec![
                    json!(c.alias.as_ref()),
                    json!(c.storage),
                    json!(c.account),
                    json!(c.remote),
                    json!(c.manifest.gc.len()),
                ],
            ));
            continue;
        }
        for db in c.working.dbs.iter().filter(|db| database.is_none_or(|d| d == db.name)) {
            if table == BCV_DATABASE {
                out.push(database_row(engine, c, db, col_used));
            } else {
                out.extend(block_rows(engine, c, db, col_used));
            }
        }
    }
    Ok(Value::Array(out).to_string())
}

fn row(names: &[&str], col_used: u64, values: Vec<Value>) -> Value {
    let mut map = Map::new();
    for (i, (name, value)) in names.iter().zip(values).enumerate() {
        let used = i >= 64 || col_used & (1 << i) != 0;
        map.insert(name.to_string(), if used { value } else { Value::Null });
    }
    Value::Object(map)
}

fn db_state(c: &Container, db: &ManifestDb) -> &'static str {
    let staged = c.staged.iter().rev().find(|s| s.target() == db.name);
    match staged {
        Some(Staged::CreateDb { .. }) => "create",
        Some(Staged::Copy { .. }) => "copy",
        _ => c.state.as_str(),
    }
}

/// Per-block flags: (cached, dirty).
fn block_flags(engine: &Engine, c: &Container, db: &ManifestDb, index: u32) -> (bool, bool) {
    let cache = engine.cache();
    let dirty_key = CacheKey::Dirty {
        container: c.alias.clone(),
        db: db.id,
        block: index,
    };
    if let Some(slot) = cache.find(&dirty_key)
        && cache.entry(slot).valid
    {
        return (true, true);
    }
    let cached = db
        .local
        .get(index as usize)
        .and_then(|id| cache.find(&CacheKey::Clean(*id)))
        .is_some_and(|slot| cache.entry(slot).valid);
    (cached, false)
}

fn database_row(engine: &Engine, c: &Container, db: &ManifestDb, col_used: u64) -> Value {
    let n_block = c.block_count(&db.id);
    let mut n_cache = 0u32;
    let mut n_dirty = 0u32;
    for i in 0..n_block {
        let (cached, dirty) = block_flags(engine, c, db, i);
        n_cache += u32::from(cached);
        n_dirty += u32::from(dirty);
    }
    row(
        DATABASE_COLUMNS,
        col_used,
        vec![
            json!(c.alias.as_ref()),
            json!(db.name),
            json!(n_block),
            json!(n_cache),
            json!(n_dirty),
            json!(db_state(c, db)),
        ],
    )
}

fn block_rows(engine: &Engine, c: &Container, db: &ManifestDb, col_used: u64) -> Vec<Value> {
    (0..c.block_count(&db.id))
        .map(|i| {
            let (cached, dirty) = block_flags(engine, c, db, i);
            let id = db.local.get(i as usize).filter(|_| !dirty);
            row(
                BLOCK_COLUMNS,
                col_used,
                vec![
                    json!(c.alias.as_ref()),
                    json!(db.name),
                    json!(i),
                    id.map_or(Value::Null, |id| json!(id.to_string())),
                    json!(cached),
                    json!(dirty),
                ],
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_nulls_unused_columns() {
        let value = row(
            CONTAINER_COLUMNS,
            0b00101,
            vec![json!("main"), json!("memory"), json!("acct"), json!("cont"), json!(3)],
        );
        assert_eq!(value["name"], json!("main"));
        assert_eq!(value["storage"], Value::Null);
        assert_eq!(value["user"], json!("acct"));
        assert_eq!(value["ncleanup"], Value::Null);
    }

    #[test]
    fn test_columns_by_table() {
        assert_eq!(columns(BCV_BLOCK).map(<[_]>::len), Some(6));
        assert_eq!(columns(BCV_KV), Some(&["name", "value"][..]));
        assert_eq!(columns("bcv_files"), None);
    }
}

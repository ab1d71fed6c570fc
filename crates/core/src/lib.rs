//! Core domain types and shared logic for the block-cache engine.
//!
//! This crate defines the data model used by every other crate:
//! - Block and database identifiers
//! - The container manifest and its binary codec
//! - Manifest-wide block hashing for deduplication and GC
//! - Daemon, storage and retry configuration

pub mod block;
pub mod config;
pub mod error;
pub mod manifest;
pub mod mhash;
pub mod retry;

pub use block::{BlockId, DbId};
pub use config::{DaemonConfig, RetryConfig, StorageConfig};
pub use error::{Error, Result};
pub use manifest::{GcEntry, Manifest, ManifestDb};
pub use mhash::{BlockAssignment, ManifestHash};
pub use retry::RetryPolicy;

/// Smallest permitted block-id width.
pub const MIN_NAME_BYTES: usize = 12;

/// Largest permitted block-id width.
pub const MAX_NAME_BYTES: usize = 32;

/// Smallest block-id width that carries a content digest (and so dedups).
pub const MIN_MD5_NAME_BYTES: usize = 24;

/// Default block-id width for new containers.
pub const DEFAULT_NAME_BYTES: usize = 16;

/// Default block size: 4 MiB
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024 * 1024;

/// Default cache size: 1 GiB
pub const DEFAULT_CACHE_SIZE: u64 = 1024 * 1024 * 1024;

/// Size of a database name field in the manifest, including the terminator.
pub const DBNAME_SIZE: usize = 128;

/// Size of a database id.
pub const DBID_SIZE: usize = 16;

/// Upper bound on concurrently outstanding storage requests.
pub const MAX_REQUESTS: usize = 32;

/// Name of the manifest object in every container.
pub const MANIFEST_KEY: &str = "manifest.bcv";

/// Name of the key-value store object in every container.
pub const KV_KEY: &str = "bcv_kv.bcv";

/// Name of the local cache file inside the daemon directory.
pub const CACHEFILE_NAME: &str = "cachefile.bcv";

/// Name of the local blocks database inside the daemon directory.
pub const BLOCKSDB_NAME: &str = "blocksdb.bcv";

/// Current wall-clock time in Unix milliseconds, as stored in GC entries.
pub fn now_ms() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}

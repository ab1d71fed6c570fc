//! Container manifest structure and binary codec.
//!
//! A manifest lists every database stored in a container together with the
//! ids of the blocks that make it up, plus the list of blocks waiting for
//! garbage collection. All integers are big-endian.
//!
//! ```text
//! header (20 bytes)   version | block size | db count | gc count | name bytes
//! db header (172)     version | array offset | block count | id[16] | parent[16] | name[128]
//! gc entry            block id | u64 timestamp (ms)
//! block arrays        concatenated, in db order
//! ```

use crate::block::{BlockId, DIGEST_BYTES, DbId};
use md5::{Digest as _, Md5};
use crate::{DBID_SIZE, DBNAME_SIZE, Error, MAX_NAME_BYTES, MIN_NAME_BYTES, Result};
use std::ops::Range;

/// Manifest format version understood by this crate.
pub const MANIFEST_VERSION: u32 = 3;

/// Size of the fixed manifest header in bytes.
pub const MANIFEST_HDR_SIZE: usize = 20;

/// Size of each per-database header in bytes.
pub const MANIFEST_DBHDR_SIZE: usize = 3 * 4 + 2 * DBID_SIZE + DBNAME_SIZE;

/// A block waiting to be deleted from the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcEntry {
    pub block: BlockId,
    /// Milliseconds since the Unix epoch at which the block became unused.
    /// Zero for stray blocks discovered by cleanup.
    pub timestamp: u64,
}

/// One logical database within a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestDb {
    pub id: DbId,
    /// Database this one was copied from, if any.
    pub parent: Option<DbId>,
    pub name: String,
    pub version: u32,
    /// Block array as last durably published.
    pub original: Vec<BlockId>,
    /// Working block array. Equal to `original` outside an upload.
    pub local: Vec<BlockId>,
}

impl ManifestDb {
    /// Create an empty, not yet published database.
    pub fn new(id: DbId, name: &str) -> Result<Self> {
        validate_db_name(name)?;
        Ok(Self {
            id,
            parent: None,
            name: name.to_string(),
            version: 0,
            original: Vec::new(),
            local: Vec::new(),
        })
    }

    /// Number of blocks in the working array.
    pub fn block_count(&self) -> u32 {
        self.local.len() as u32
    }

    /// True if the working array differs from the published one.
    pub fn is_modified(&self) -> bool {
        self.local != self.original
    }

    /// Id of block `index` in the working array.
    pub fn block(&self, index: u32) -> Result<BlockId> {
        self.local
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::BlockOutOfRange {
                name: self.name.clone(),
                index,
                count: self.block_count(),
            })
    }
}

/// Versioned snapshot of a container's contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub block_size: u32,
    pub name_bytes: usize,
    /// Databases, kept sorted by id.
    pub dbs: Vec<ManifestDb>,
    pub gc: Vec<GcEntry>,
    /// Opaque version token from the remote store. Not part of the encoding.
    pub etag: Option<String>,
}

impl Manifest {
    /// Create an empty manifest.
    pub fn new(block_size: u32, name_bytes: usize) -> Result<Self> {
        if !(MIN_NAME_BYTES..=MAX_NAME_BYTES).contains(&name_bytes) {
            return Err(Error::InvalidNameBytes(name_bytes));
        }
        if block_size == 0 {
            return Err(Error::Config("block size must be non-zero".to_string()));
        }
        Ok(Self {
            block_size,
            name_bytes,
            dbs: Vec::new(),
            gc: Vec::new(),
            etag: None,
        })
    }

    /// Parse a manifest blob.
    pub fn parse(data: &[u8], etag: Option<String>) -> Result<Self> {
        let mut rd = Reader::new(data);
        let version = rd.u32()?;
        if version != MANIFEST_VERSION {
            return Err(Error::corrupt(format!(
                "bad manifest version - expected {MANIFEST_VERSION}, found {version}"
            )));
        }
        let block_size = rd.u32()?;
        let n_db = rd.u32()? as usize;
        let n_gc = rd.u32()? as usize;
        let name_bytes = rd.u32()? as usize;
        if !(MIN_NAME_BYTES..=MAX_NAME_BYTES).contains(&name_bytes) {
            return Err(Error::corrupt(format!(
                "name-byte width {name_bytes} outside [{MIN_NAME_BYTES}, {MAX_NAME_BYTES}]"
            )));
        }

        let mut headers = Vec::with_capacity(n_db.min(data.len() / MANIFEST_DBHDR_SIZE));
        for _ in 0..n_db {
            let version = rd.u32()?;
            let offset = rd.u32()? as usize;
            let count = rd.u32()? as usize;
            let id = DbId::from_slice(rd.take(DBID_SIZE)?)?;
            let parent = DbId::from_slice(rd.take(DBID_SIZE)?)?;
            let name = decode_name(rd.take(DBNAME_SIZE)?)?;
            headers.push((version, offset, count, id, parent, name));
        }

        let mut gc = Vec::with_capacity(n_gc.min(data.len() / (name_bytes + 8)));
        for _ in 0..n_gc {
            let block = BlockId::from_slice(rd.take(name_bytes)?)?;
            let timestamp = rd.u64()?;
            gc.push(GcEntry { block, timestamp });
        }

        let mut dbs: Vec<ManifestDb> = Vec::with_capacity(headers.len());
        for (version, offset, count, id, parent, name) in headers {
            if let Some(prev) = dbs.last()
                && prev.id >= id
            {
                return Err(Error::corrupt(format!(
                    "database ids out of order ({} >= {})",
                    prev.id, id
                )));
            }
            let range = array_range(offset, count, name_bytes, data.len())?;
            let blocks = data[range]
                .chunks_exact(name_bytes)
                .map(BlockId::from_slice)
                .collect::<Result<Vec<_>>>()?;
            dbs.push(ManifestDb {
                id,
                parent: (!parent.is_none()).then_some(parent),
                name,
                version,
                original: blocks.clone(),
                local: blocks,
            });
        }

        Ok(Self {
            block_size,
            name_bytes,
            dbs,
            gc,
            etag,
        })
    }

    /// Serialize the manifest, writing each database's working array.
    pub fn compose(&self) -> Vec<u8> {
        let nb = self.name_bytes;
        let hdr_len = MANIFEST_HDR_SIZE + self.dbs.len() * MANIFEST_DBHDR_SIZE;
        let gc_len = self.gc.len() * (nb + 8);
        let blk_len: usize = self.dbs.iter().map(|d| d.local.len() * nb).sum();
        let mut out = Vec::with_capacity(hdr_len + gc_len + blk_len);

        out.extend_from_slice(&MANIFEST_VERSION.to_be_bytes());
        out.extend_from_slice(&self.block_size.to_be_bytes());
        out.extend_from_slice(&(self.dbs.len() as u32).to_be_bytes());
        out.extend_from_slice(&(self.gc.len() as u32).to_be_bytes());
        out.extend_from_slice(&(nb as u32).to_be_bytes());

        let mut offset = hdr_len + gc_len;
        for db in &self.dbs {
            out.extend_from_slice(&db.version.to_be_bytes());
            out.extend_from_slice(&(offset as u32).to_be_bytes());
            out.extend_from_slice(&(db.local.len() as u32).to_be_bytes());
            out.extend_from_slice(db.id.as_bytes());
            out.extend_from_slice(db.parent.unwrap_or(DbId::NONE).as_bytes());
            let mut name = [0u8; DBNAME_SIZE];
            let n = db.name.len().min(DBNAME_SIZE - 1);
            name[..n].copy_from_slice(&db.name.as_bytes()[..n]);
            out.extend_from_slice(&name);
            offset += db.local.len() * nb;
        }

        for entry in &self.gc {
            out.extend_from_slice(entry.block.as_bytes());
            out.extend_from_slice(&entry.timestamp.to_be_bytes());
        }

        for db in &self.dbs {
            for block in &db.local {
                out.extend_from_slice(block.as_bytes());
            }
        }
        out
    }

    /// MD5 of the serialized manifest.
    pub fn digest(&self) -> [u8; DIGEST_BYTES] {
        Md5::digest(self.compose()).into()
    }

    /// Index of the database with display name `name`.
    pub fn find_db(&self, name: &str) -> Option<usize> {
        self.dbs.iter().position(|d| d.name == name)
    }

    /// Database with display name `name`.
    pub fn db(&self, name: &str) -> Result<&ManifestDb> {
        self.find_db(name)
            .map(|i| &self.dbs[i])
            .ok_or_else(|| Error::NoSuchDatabase(name.to_string()))
    }

    /// Index of the database with id `id`.
    pub fn find_db_by_id(&self, id: &DbId) -> Option<usize> {
        self.dbs.binary_search_by(|d| d.id.cmp(id)).ok()
    }

    /// Insert a database, keeping the array sorted by id.
    pub fn insert_db(&mut self, db: ManifestDb) -> Result<usize> {
        if self.find_db(&db.name).is_some() {
            return Err(Error::DatabaseExists(db.name));
        }
        match self.dbs.binary_search_by(|d| d.id.cmp(&db.id)) {
            Ok(_) => Err(Error::DatabaseExists(db.id.to_hex())),
            Err(pos) => {
                self.dbs.insert(pos, db);
                Ok(pos)
            }
        }
    }

    /// Remove and return the database at `index`.
    pub fn remove_db(&mut self, index: usize) -> ManifestDb {
        self.dbs.remove(index)
    }

    /// Promote every working array to published.
    pub fn commit_local(&mut self) {
        for db in &mut self.dbs {
            if db.is_modified() {
                db.original = db.local.clone();
            }
        }
    }

    /// Discard every working-array change.
    pub fn revert_local(&mut self) {
        for db in &mut self.dbs {
            db.local = db.original.clone();
        }
    }

    /// Total number of block references across all databases.
    pub fn block_refs(&self) -> usize {
        self.dbs.iter().map(|d| d.local.len()).sum()
    }
}

/// Check that `name` fits the fixed-size name field.
pub fn validate_db_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidDbName("empty name".to_string()));
    }
    if name.len() >= DBNAME_SIZE {
        return Err(Error::InvalidDbName(format!(
            "database name \"{name}\" is too long (max = {} bytes)",
            DBNAME_SIZE - 1
        )));
    }
    if name.as_bytes().contains(&0) {
        return Err(Error::InvalidDbName(format!("{name:?} contains NUL")));
    }
    Ok(())
}

fn decode_name(raw: &[u8]) -> Result<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8(raw[..end].to_vec())
        .map_err(|e| Error::corrupt(format!("database name is not utf-8: {e}")))
}

fn array_range(offset: usize, count: usize, name_bytes: usize, len: usize) -> Result<Range<usize>> {
    let end = count
        .checked_mul(name_bytes)
        .and_then(|n| n.checked_add(offset))
        .filter(|&end| end <= len)
        .ok_or_else(|| {
            Error::corrupt(format!(
                "block array at offset {offset} ({count} blocks) exceeds {len} byte manifest"
            ))
        })?;
    Ok(offset..end)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => {
                let out = &self.data[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(Error::corrupt(format!(
                "truncated manifest: need {n} bytes at offset {} of {}",
                self.pos,
                self.data.len()
            ))),
        }
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }
}

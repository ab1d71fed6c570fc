//! Manifest-wide block index used for deduplication and GC eligibility.

use crate::block::{BlockId, DIGEST_BYTES, DbId, content_digest};
use crate::manifest::{GcEntry, Manifest};
use crate::{MIN_MD5_NAME_BYTES, Result};

/// Open-addressing hash table over the block ids of a manifest.
#[derive(Debug, Clone)]
pub struct ManifestHash {
    slots: Vec<Option<BlockId>>,
    len: usize,
}

impl ManifestHash {
    /// Index every block of `manifest` except those of database `exclude`.
    ///
    /// GC-listed blocks are included when `include_gc` is set.
    pub fn build(manifest: &Manifest, exclude: Option<&DbId>, include_gc: bool) -> Self {
        let dbs = manifest
            .dbs
            .iter()
            .filter(|db| Some(&db.id) != exclude);
        let mut n_blk: usize = dbs.clone().map(|db| db.local.len()).sum();
        if include_gc {
            n_blk += manifest.gc.len();
        }

        let mut n_hash = 128usize;
        while n_hash < n_blk * 8 {
            n_hash *= 2;
        }

        let mut hash = Self {
            slots: vec![None; n_hash],
            len: 0,
        };
        for db in dbs {
            for id in &db.local {
                hash.insert(*id);
            }
        }
        if include_gc {
            for entry in &manifest.gc {
                hash.insert(entry.block);
            }
        }
        hash
    }

    fn bucket(&self, seed: u32) -> usize {
        seed as usize % self.slots.len()
    }

    /// Index `id`. Inserting an id already present is a no-op.
    pub fn insert(&mut self, id: BlockId) {
        if (self.len + 1) * 2 > self.slots.len() {
            self.grow();
        }
        let mut i = self.bucket(id.hash_seed());
        while let Some(existing) = &self.slots[i] {
            if *existing == id {
                return;
            }
            i = (i + 1) % self.slots.len();
        }
        self.slots[i] = Some(id);
        self.len += 1;
    }

    fn grow(&mut self) {
        let new_len = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![None; new_len]);
        self.len = 0;
        for id in old.into_iter().flatten() {
            self.insert(id);
        }
    }

    /// Number of distinct ids indexed.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing was indexed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if the exact id is indexed.
    pub fn contains(&self, id: &BlockId) -> bool {
        self.probe(id.hash_seed(), |candidate| candidate == id).is_some()
    }

    /// First indexed id whose leading bytes equal `digest`.
    ///
    /// Bytes 4..8 of an id fall inside the digest, so a prefix query lands in
    /// the same probe sequence as the stored id.
    pub fn find_digest(&self, digest: &[u8; DIGEST_BYTES]) -> Option<BlockId> {
        let seed = u32::from_be_bytes([digest[4], digest[5], digest[6], digest[7]]);
        self.probe(seed, |candidate| candidate.as_bytes().starts_with(digest))
    }

    fn probe(&self, seed: u32, matches: impl Fn(&BlockId) -> bool) -> Option<BlockId> {
        let mut i = self.bucket(seed);
        while let Some(candidate) = &self.slots[i] {
            if matches(candidate) {
                return Some(*candidate);
            }
            i = (i + 1) % self.slots.len();
        }
        None
    }
}

/// Outcome of choosing an id for a block about to be uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAssignment {
    /// An identical block already exists; reuse its id and skip the upload.
    Existing(BlockId),
    /// A freshly minted id; the block must be uploaded.
    New(BlockId),
}

impl BlockAssignment {
    /// The id in either case.
    pub fn id(&self) -> BlockId {
        match self {
            Self::Existing(id) | Self::New(id) => *id,
        }
    }
}

/// Choose the id for `data`, reusing an existing block with identical
/// content when the container's id width allows deduplication.
pub fn assign_block_id(
    manifest: &Manifest,
    hash: Option<&ManifestHash>,
    data: &[u8],
) -> Result<BlockAssignment> {
    let block_size = manifest.block_size as usize;
    if manifest.name_bytes >= MIN_MD5_NAME_BYTES
        && let Some(hash) = hash
    {
        let digest = content_digest(block_size, data);
        if let Some(existing) = hash.find_digest(&digest) {
            return Ok(BlockAssignment::Existing(existing));
        }
    }
    BlockId::for_content(manifest.name_bytes, block_size, data).map(BlockAssignment::New)
}

/// Move the blocks of database `index` onto the GC list, stamped with `now_ms`.
///
/// A block is only listed once no other database references the same id, and
/// never twice. Returns the number of entries added.
pub fn delete_blocks(manifest: &mut Manifest, index: usize, now_ms: u64) -> usize {
    let db_id = manifest.dbs[index].id;
    let others = ManifestHash::build(manifest, Some(&db_id), false);
    let mut listed = ManifestHash::build(&manifest.clone_header(), None, true);

    let mut added = Vec::new();
    for id in manifest.dbs[index].local.iter().chain(&manifest.dbs[index].original) {
        if others.contains(id) || listed.contains(id) {
            continue;
        }
        listed.insert(*id);
        added.push(GcEntry {
            block: *id,
            timestamp: now_ms,
        });
    }
    let n = added.len();
    manifest.gc.extend(added);
    n
}

/// Append `ids` to the GC list stamped with `timestamp`, skipping ids that
/// are referenced or already listed. Returns the number of entries added.
pub fn add_gc(
    manifest: &mut Manifest,
    ids: impl IntoIterator<Item = BlockId>,
    timestamp: u64,
) -> usize {
    let mut known = ManifestHash::build(manifest, None, true);
    let mut n = 0;
    for id in ids {
        if known.contains(&id) {
            continue;
        }
        known.insert(id);
        manifest.gc.push(GcEntry {
            block: id,
            timestamp,
        });
        n += 1;
    }
    n
}

/// Append `strays` to the GC list stamped with `now_ms`, the time they were
/// found. They are deleted once they fall outside the retention window.
pub fn add_strays(
    manifest: &mut Manifest,
    strays: impl IntoIterator<Item = BlockId>,
    now_ms: u64,
) -> usize {
    add_gc(manifest, strays, now_ms)
}

/// Split the GC list into entries eligible for deletion and entries to keep.
///
/// With `cutoff_ms == None` every entry is eligible; otherwise an entry is
/// eligible when its timestamp is at or before the cutoff.
pub fn partition_gc(gc: &[GcEntry], cutoff_ms: Option<u64>) -> (Vec<GcEntry>, Vec<GcEntry>) {
    gc.iter()
        .partition(|entry| cutoff_ms.is_none_or(|cutoff| entry.timestamp <= cutoff))
}

impl Manifest {
    /// A copy carrying only the header fields and GC list.
    fn clone_header(&self) -> Manifest {
        Manifest {
            block_size: self.block_size,
            name_bytes: self.name_bytes,
            dbs: Vec::new(),
            gc: self.gc.clone(),
            etag: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestDb;

    fn db(id: u8, name: &str, blocks: Vec<BlockId>) -> ManifestDb {
        let mut db = ManifestDb::new(DbId::from_bytes([id; 16]), name).unwrap();
        db.original = blocks.clone();
        db.local = blocks;
        db
    }

    fn ids(n: usize, width: usize) -> Vec<BlockId> {
        (0..n).map(|_| BlockId::random(width).unwrap()).collect()
    }

    #[test]
    fn test_hash_excludes_database() {
        let mut m = Manifest::new(4096, 16).unwrap();
        let a = ids(3, 16);
        let b = ids(2, 16);
        m.insert_db(db(1, "a", a.clone())).unwrap();
        m.insert_db(db(2, "b", b.clone())).unwrap();

        let all = ManifestHash::build(&m, None, false);
        assert_eq!(all.len(), 5);
        let without_a = ManifestHash::build(&m, Some(&DbId::from_bytes([1; 16])), false);
        assert!(!without_a.contains(&a[0]));
        assert!(without_a.contains(&b[1]));
    }

    #[test]
    fn test_hash_grows_with_block_count() {
        let mut m = Manifest::new(4096, 16).unwrap();
        m.insert_db(db(1, "a", ids(100, 16))).unwrap();
        let hash = ManifestHash::build(&m, None, false);
        assert_eq!(hash.slots.len(), 1024);
        assert_eq!(hash.len(), 100);
    }

    #[test]
    fn test_delete_blocks_skips_shared_ids() {
        let mut m = Manifest::new(4096, 16).unwrap();
        let shared = ids(2, 16);
        let own = ids(2, 16);
        let mut a_blocks = shared.clone();
        a_blocks.extend(own.iter().copied());
        // Repeat one block within the same db; it must be listed only once.
        a_blocks.push(own[0]);
        m.insert_db(db(1, "a", a_blocks)).unwrap();
        m.insert_db(db(2, "b", shared.clone())).unwrap();

        let added = delete_blocks(&mut m, 0, 42);
        assert_eq!(added, 2);
        let listed: Vec<_> = m.gc.iter().map(|e| e.block).collect();
        assert!(listed.contains(&own[0]) && listed.contains(&own[1]));
        assert!(!listed.iter().any(|id| shared.contains(id)));
        assert!(m.gc.iter().all(|e| e.timestamp == 42));
    }

    #[test]
    fn test_assign_reuses_identical_content() {
        let mut m = Manifest::new(64, 24).unwrap();
        let data = vec![7u8; 64];
        let first = assign_block_id(&m, None, &data).unwrap();
        assert!(matches!(first, BlockAssignment::New(_)));
        m.insert_db(db(1, "a", vec![first.id()])).unwrap();

        let hash = ManifestHash::build(&m, None, false);
        let second = assign_block_id(&m, Some(&hash), &data).unwrap();
        assert_eq!(second, BlockAssignment::Existing(first.id()));

        let other = assign_block_id(&m, Some(&hash), &[8u8; 64]).unwrap();
        assert!(matches!(other, BlockAssignment::New(_)));
    }

    #[test]
    fn test_narrow_ids_never_dedup() {
        let mut m = Manifest::new(64, 16).unwrap();
        let first = assign_block_id(&m, None, &[1u8; 64]).unwrap();
        m.insert_db(db(1, "a", vec![first.id()])).unwrap();
        let hash = ManifestHash::build(&m, None, false);
        let second = assign_block_id(&m, Some(&hash), &[1u8; 64]).unwrap();
        assert!(matches!(second, BlockAssignment::New(_)));
    }

    #[test]
    fn test_add_strays_and_partition() {
        let mut m = Manifest::new(4096, 16).unwrap();
        let used = ids(1, 16);
        m.insert_db(db(1, "a", used.clone())).unwrap();
        let stray = ids(2, 16);
        let n = add_strays(&mut m, stray.iter().copied().chain(used.iter().copied()), 500);
        assert_eq!(n, 2);
        assert!(m.gc.iter().all(|entry| entry.timestamp == 500));
        // Listing the same strays again is a no-op.
        assert_eq!(add_strays(&mut m, stray.iter().copied(), 900), 0);

        m.gc.push(GcEntry {
            block: BlockId::random(16).unwrap(),
            timestamp: 5_000,
        });
        let (eligible, keep) = partition_gc(&m.gc, Some(1_000));
        assert_eq!(eligible.len(), 2);
        assert_eq!(keep.len(), 1);
        // Strays found after the cutoff wait like any other entry.
        let (eligible, keep) = partition_gc(&m.gc, Some(400));
        assert!(eligible.is_empty());
        assert_eq!(keep.len(), 3);
        let (eligible, keep) = partition_gc(&m.gc, None);
        assert_eq!(eligible.len(), 3);
        assert!(keep.is_empty());
    }
}

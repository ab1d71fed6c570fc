//! Local block cache index.
//!
//! One [`CacheEntry`] per slot of the cache file, stored in an arena. Hash
//! chains and the LRU list are threaded through the arena as slot indexes.
//!
//! Every slot is either hashed (it has a key) or on the unused list. Hashed
//! entries that are valid, clean and unpinned are also on the LRU list, and
//! only those can be evicted.

use crate::error::{BcvError, BcvResult};
use bcv_core::{BlockId, DbId};
use std::sync::Arc;

/// What a cache slot holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A published block, shared by every database that references it.
    Clean(BlockId),
    /// A locally written block of one database, not yet uploaded.
    Dirty {
        container: Arc<str>,
        db: DbId,
        block: u32,
    },
}

impl CacheKey {
    fn hash_seed(&self) -> u32 {
        match self {
            Self::Clean(id) => id.hash_seed(),
            Self::Dirty { db, block, .. } => {
                let b = db.as_bytes();
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]) ^ block.wrapping_mul(0x9E37_79B1)
            }
        }
    }

    /// True for unpublished data.
    pub fn is_dirty(&self) -> bool {
        matches!(self, Self::Dirty { .. })
    }
}

/// One slot of the cache file.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub key: Option<CacheKey>,
    /// Encryption-key index of the owning container, 0 for none.
    pub key_index: u32,
    /// The slot holds complete data.
    pub valid: bool,
    /// The slot holds unpublished data.
    pub dirty: bool,
    /// Number of outstanding pins.
    pub n_ref: u32,
    /// Logical time of the last use.
    pub tick: u64,
    hash_next: Option<u32>,
    lru_prev: Option<u32>,
    lru_next: Option<u32>,
    in_lru: bool,
}

/// Result of allocating a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub slot: u32,
    /// Key of the entry evicted to make room, if any.
    pub evicted: Option<CacheKey>,
}

/// Fixed-capacity cache index with LRU eviction and pinning.
#[derive(Debug)]
pub struct BlockCache {
    entries: Vec<CacheEntry>,
    buckets: Vec<Option<u32>>,
    unused: Vec<u32>,
    lru_head: Option<u32>,
    lru_tail: Option<u32>,
    tick: u64,
    n_hashed: usize,
}

impl BlockCache {
    /// Create a cache of `n_slots` unused slots.
    pub fn new(n_slots: u32) -> Self {
        let n_buckets = (n_slots as usize * 2).next_power_of_two().max(16);
        Self {
            entries: vec![CacheEntry::default(); n_slots as usize],
            buckets: vec![None; n_buckets],
            unused: (0..n_slots).rev().collect(),
            lru_head: None,
            lru_tail: None,
            tick: 0,
            n_hashed: 0,
        }
    }

    /// Total number of slots.
    pub fn n_slots(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Number of slots on the unused list.
    pub fn n_unused(&self) -> usize {
        self.unused.len()
    }

    /// Number of slots in the hash table.
    pub fn n_hashed(&self) -> usize {
        self.n_hashed
    }

    /// Current logical clock.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Entry for `slot`.
    pub fn entry(&self, slot: u32) -> &CacheEntry {
        &self.entries[slot as usize]
    }

    /// Hashed entries with their slots.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &CacheEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.key.is_some())
            .map(|(i, e)| (i as u32, e))
    }

    fn bucket(&self, key: &CacheKey) -> usize {
        key.hash_seed() as usize & (self.buckets.len() - 1)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Slot holding `key`, whether valid yet or not.
    pub fn find(&self, key: &CacheKey) -> Option<u32> {
        let mut cur = self.buckets[self.bucket(key)];
        while let Some(slot) = cur {
            let entry = &self.entries[slot as usize];
            if entry.key.as_ref() == Some(key) {
                return Some(slot);
            }
            cur = entry.hash_next;
        }
        None
    }

    fn hash_insert(&mut self, slot: u32) {
        let Some(key) = self.entries[slot as usize].key.as_ref() else {
            return;
        };
        let b = self.bucket(key);
        self.entries[slot as usize].hash_next = self.buckets[b];
        self.buckets[b] = Some(slot);
        self.n_hashed += 1;
    }

    fn hash_remove(&mut self, slot: u32) {
        let Some(key) = self.entries[slot as usize].key.as_ref() else {
            return;
        };
        let b = self.bucket(key);
        let next = self.entries[slot as usize].hash_next.take();
        if self.buckets[b] == Some(slot) {
            self.buckets[b] = next;
        } else {
            let mut cur = self.buckets[b];
            while let Some(i) = cur {
                if self.entries[i as usize].hash_next == Some(slot) {
                    self.entries[i as usize].hash_next = next;
                    break;
                }
                cur = self.entries[i as usize].hash_next;
            }
        }
        self.n_hashed -= 1;
    }

    fn lru_push(&mut self, slot: u32) {
        let entry = &self.entries[slot as usize];
        if entry.in_lru || !entry.valid || entry.dirty || entry.n_ref > 0 || entry.key.is_none() {
            return;
        }
        let tail = self.lru_tail;
        {
            let entry = &mut self.entries[slot as usize];
            entry.in_lru = true;
            entry.lru_prev = tail;
            entry.lru_next = None;
        }
        match tail {
            Some(t) => self.entries[t as usize].lru_next = Some(slot),
            None => self.lru_head = Some(slot),
        }
        self.lru_tail = Some(slot);
    }

    fn lru_remove(&mut self, slot: u32) {
        let entry = &mut self.entries[slot as usize];
        if !entry.in_lru {
            return;
        }
        entry.in_lru = false;
        let prev = entry.lru_prev.take();
        let next = entry.lru_next.take();
        match prev {
            Some(p) => self.entries[p as usize].lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.entries[n as usize].lru_prev = prev,
            None => self.lru_tail = prev,
        }
    }

    /// Allocate a slot for `key`.
    ///
    /// Uses an unused slot if there is one, otherwise evicts the least
    /// recently used evictable entry. The new entry is hashed but not valid.
    pub fn alloc(&mut self, key: CacheKey, key_index: u32) -> BcvResult<Allocation> {
        if self.find(&key).is_some() {
            return Err(BcvError::Misuse(format!("{key:?} is already cached")));
        }
        let (slot, evicted) = match self.unused.pop() {
            Some(slot) => (slot, None),
            None => {
                let slot = self.lru_head.ok_or(BcvError::CacheFull)?;
                self.lru_remove(slot);
                self.hash_remove(slot);
                let old = std::mem::take(&mut self.entries[slot as usize]);
                (slot, old.key)
            }
        };

        let tick = self.next_tick();
        self.entries[slot as usize] = CacheEntry {
            dirty: key.is_dirty(),
            key: Some(key),
            key_index,
            tick,
            ..CacheEntry::default()
        };
        self.hash_insert(slot);
        Ok(Allocation { slot, evicted })
    }

    /// Mark a downloaded or written slot as holding complete data.
    pub fn mark_valid(&mut self, slot: u32) {
        let tick = self.next_tick();
        let entry = &mut self.entries[slot as usize];
        entry.valid = true;
        entry.tick = tick;
        self.lru_push(slot);
    }

    /// Drop the entry in `slot` and return the slot to the unused list.
    pub fn discard(&mut self, slot: u32) {
        if self.entries[slot as usize].key.is_none() {
            return;
        }
        self.lru_remove(slot);
        self.hash_remove(slot);
        self.entries[slot as usize] = CacheEntry::default();
        self.unused.push(slot);
    }

    /// Add a reference that prevents eviction.
    pub fn pin(&mut self, slot: u32) {
        self.lru_remove(slot);
        self.entries[slot as usize].n_ref += 1;
    }

    /// Release a reference taken by [`BlockCache::pin`].
    pub fn unpin(&mut self, slot: u32) {
        let entry = &mut self.entries[slot as usize];
        entry.n_ref = entry.n_ref.saturating_sub(1);
        if entry.n_ref == 0 {
            self.touch(slot);
        }
    }

    /// Record a use of `slot`, moving it to the most-recent end of the LRU.
    pub fn touch(&mut self, slot: u32) {
        if self.entries[slot as usize].key.is_none() {
            return;
        }
        let tick = self.next_tick();
        self.entries[slot as usize].tick = tick;
        self.lru_remove(slot);
        self.lru_push(slot);
    }

    /// Turn the dirty entry in `slot` into a clean entry for `id`.
    pub fn make_clean(&mut self, slot: u32, id: BlockId) -> BcvResult<()> {
        let key = CacheKey::Clean(id);
        if self.find(&key).is_some() {
            return Err(BcvError::Misuse(format!("block {id} is already cached")));
        }
        self.hash_remove(slot);
        let entry = &mut self.entries[slot as usize];
        entry.key = Some(key);
        entry.dirty = false;
        self.hash_insert(slot);
        self.lru_push(slot);
        Ok(())
    }

    /// Reinstate a valid entry recovered from the blocks database.
    pub fn restore(&mut self, slot: u32, key: CacheKey, tick: u64) -> BcvResult<()> {
        if slot >= self.n_slots() {
            return Err(BcvError::Misuse(format!("slot {slot} beyond cache end")));
        }
        let pos = self
            .unused
            .iter()
            .position(|&s| s == slot)
            .ok_or_else(|| BcvError::Misuse(format!("slot {slot} restored twice")))?;
        if self.find(&key).is_some() {
            return Err(BcvError::Misuse(format!("{key:?} restored twice")));
        }
        self.unused.remove(pos);
        self.tick = self.tick.max(tick);
        self.entries[slot as usize] = CacheEntry {
            dirty: key.is_dirty(),
            key: Some(key),
            valid: true,
            tick,
            ..CacheEntry::default()
        };
        self.hash_insert(slot);
        self.lru_push(slot);
        Ok(())
    }

    /// Relink the LRU list in tick order, after a batch of restores.
    pub fn sort_lru(&mut self) {
        let mut slots: Vec<u32> = self
            .iter()
            .filter(|(_, e)| e.in_lru)
            .map(|(s, _)| s)
            .collect();
        slots.sort_by_key(|&s| self.entries[s as usize].tick);
        for &slot in &slots {
            self.lru_remove(slot);
        }
        for slot in slots {
            self.lru_push(slot);
        }
    }

    /// Dirty entries belonging to `container`: `(slot, db, block)`.
    pub fn dirty_entries(&self, container: &str) -> Vec<(u32, DbId, u32)> {
        let mut out: Vec<_> = self
            .iter()
            .filter_map(|(slot, e)| match &e.key {
                Some(CacheKey::Dirty {
                    container: c,
                    db,
                    block,
                }) if c.as_ref() == container => Some((slot, *db, *block)),
                _ => None,
            })
            .collect();
        out.sort_by_key(|&(_, db, block)| (db, block));
        out
    }

    /// Verify the structural invariants, returning a description of the
    /// first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = vec![0u8; self.entries.len()];
        for &slot in &self.unused {
            seen[slot as usize] += 1;
            if self.entries[slot as usize].key.is_some() {
                return Err(format!("unused slot {slot} has a key"));
            }
        }
        let mut hashed = 0;
        for (b, head) in self.buckets.iter().enumerate() {
            let mut cur = *head;
            while let Some(slot) = cur {
                let entry = &self.entries[slot as usize];
                let key = entry
                    .key
                    .as_ref()
                    .ok_or_else(|| format!("hashed slot {slot} has no key"))?;
                if self.bucket(key) != b {
                    return Err(format!("slot {slot} in wrong bucket"));
                }
                seen[slot as usize] += 1;
                hashed += 1;
                cur = entry.hash_next;
            }
        }
        if hashed != self.n_hashed {
            return Err(format!("{hashed} hashed entries, expected {}", self.n_hashed));
        }
        if let Some(slot) = seen.iter().position(|&n| n != 1) {
            return Err(format!("slot {slot} accounted for {} times", seen[slot]));
        }

        let mut cur = self.lru_head;
        let mut prev = None;
        let mut last_tick = 0;
        while let Some(slot) = cur {
            let entry = &self.entries[slot as usize];
            if entry.n_ref > 0 || entry.dirty || !entry.valid || !entry.in_lru {
                return Err(format!("slot {slot} must not be on the LRU list"));
            }
            if entry.lru_prev != prev || entry.tick < last_tick {
                return Err(format!("LRU list broken at slot {slot}"));
            }
            last_tick = entry.tick;
            prev = Some(slot);
            cur = entry.lru_next;
        }
        if self.lru_tail != prev {
            return Err("LRU tail mismatch".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean(n: u8) -> CacheKey {
        let mut raw = [0u8; 16];
        raw[7] = n;
        raw[15] = n;
        CacheKey::Clean(BlockId::from_slice(&raw).unwrap())
    }

    fn fill(cache: &mut BlockCache, key: CacheKey) -> u32 {
        let slot = cache.alloc(key, 0).unwrap().slot;
        cache.mark_valid(slot);
        slot
    }

    #[test]
    fn test_alloc_uses_unused_then_evicts_lru() {
        let mut cache = BlockCache::new(3);
        let a = fill(&mut cache, clean(1));
        let _b = fill(&mut cache, clean(2));
        let _c = fill(&mut cache, clean(3));
        assert_eq!(cache.n_unused(), 0);

        cache.touch(a);
        let alloc = cache.alloc(clean(4), 0).unwrap();
        assert_eq!(alloc.evicted, Some(clean(2)));
        assert!(cache.find(&clean(2)).is_none());
        assert!(cache.find(&clean(1)).is_some());
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_pinned_entries_are_never_evicted() {
        let mut cache = BlockCache::new(2);
        let a = fill(&mut cache, clean(1));
        let b = fill(&mut cache, clean(2));
        cache.pin(a);
        cache.pin(b);
        assert!(matches!(cache.alloc(clean(3), 0), Err(BcvError::CacheFull)));

        cache.unpin(b);
        let alloc = cache.alloc(clean(3), 0).unwrap();
        assert_eq!(alloc.slot, b);
        assert_eq!(cache.entry(a).key, Some(clean(1)));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_downloading_and_dirty_entries_are_not_evictable() {
        let mut cache = BlockCache::new(2);
        let _downloading = cache.alloc(clean(1), 0).unwrap().slot;
        let dirty = CacheKey::Dirty {
            container: Arc::from("c"),
            db: DbId::from_bytes([1; 16]),
            block: 0,
        };
        fill(&mut cache, dirty);
        assert!(matches!(cache.alloc(clean(2), 0), Err(BcvError::CacheFull)));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_discard_returns_slot() {
        let mut cache = BlockCache::new(2);
        let slot = cache.alloc(clean(1), 0).unwrap().slot;
        cache.discard(slot);
        assert!(cache.find(&clean(1)).is_none());
        assert_eq!(cache.n_unused(), 2);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_make_clean_rehashes() {
        let mut cache = BlockCache::new(2);
        let key = CacheKey::Dirty {
            container: Arc::from("c"),
            db: DbId::from_bytes([1; 16]),
            block: 4,
        };
        let slot = fill(&mut cache, key.clone());
        assert_eq!(cache.dirty_entries("c"), vec![(slot, DbId::from_bytes([1; 16]), 4)]);

        let CacheKey::Clean(id) = clean(9) else {
            unreachable!()
        };
        cache.make_clean(slot, id).unwrap();
        assert!(cache.find(&key).is_none());
        assert_eq!(cache.find(&clean(9)), Some(slot));
        assert!(cache.dirty_entries("c").is_empty());
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_restore_and_sort() {
        let mut cache = BlockCache::new(4);
        cache.restore(2, clean(1), 50).unwrap();
        cache.restore(0, clean(2), 10).unwrap();
        assert!(cache.restore(0, clean(3), 11).is_err());
        cache.sort_lru();
        cache.check_invariants().unwrap();
        assert!(cache.tick() >= 50);

        // Oldest restored entry goes first.
        cache.alloc(clean(4), 0).unwrap();
        cache.alloc(clean(5), 0).unwrap();
        let alloc = cache.alloc(clean(6), 0).unwrap();
        assert_eq!(alloc.evicted, Some(clean(2)));
    }

    #[test]
    fn test_invariants_under_churn() {
        let mut cache = BlockCache::new(8);
        let mut pinned = Vec::new();
        for i in 0..200u32 {
            let key = clean((i % 37) as u8);
            match cache.find(&key) {
                Some(slot) if i % 3 == 0 && cache.entry(slot).n_ref == 0 => cache.discard(slot),
                Some(slot) => cache.touch(slot),
                None => match cache.alloc(key, 0) {
                    Ok(alloc) => {
                        cache.mark_valid(alloc.slot);
                        if i % 5 == 0 && pinned.len() < 4 {
                            cache.pin(alloc.slot);
                            pinned.push(alloc.slot);
                        }
                    }
                    Err(BcvError::CacheFull) => {}
                    Err(e) => panic!("unexpected {e}"),
                },
            }
            if i % 17 == 0
                && let Some(slot) = pinned.pop()
            {
                cache.unpin(slot);
            }
            for &slot in &pinned {
                assert!(cache.entry(slot).key.is_some(), "pinned slot {slot} evicted");
            }
            cache.check_invariants().unwrap();
        }
    }
}

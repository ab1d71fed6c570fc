//! Block and database identifiers.
//!
//! A block id is an opaque byte string between [`MIN_NAME_BYTES`] and
//! [`MAX_NAME_BYTES`] long. Containers whose width is at least
//! [`MIN_MD5_NAME_BYTES`] use the leading 16 bytes for an MD5 digest of the
//! block content, which is what makes deduplication possible.

use crate::{Error, MAX_NAME_BYTES, MIN_MD5_NAME_BYTES, MIN_NAME_BYTES, Result};
use md5::{Digest as _, Md5};
use rand::RngCore;
use std::fmt;

/// File extension used for block objects in the remote container.
pub const BLOCK_SUFFIX: &str = ".bcv";

/// Length of the content digest that prefixes deduplicating block ids.
pub const DIGEST_BYTES: usize = 16;

/// Fixed-width identifier of an immutable block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    bytes: [u8; MAX_NAME_BYTES],
    len: u8,
}

impl BlockId {
    /// Create a block id from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if !(MIN_NAME_BYTES..=MAX_NAME_BYTES).contains(&bytes.len()) {
            return Err(Error::InvalidBlockId(format!(
                "{} bytes is outside [{MIN_NAME_BYTES}, {MAX_NAME_BYTES}]",
                bytes.len()
            )));
        }
        let mut arr = [0u8; MAX_NAME_BYTES];
        arr[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            bytes: arr,
            len: bytes.len() as u8,
        })
    }

    /// Mint a fully random block id.
    pub fn random(name_bytes: usize) -> Result<Self> {
        if !(MIN_NAME_BYTES..=MAX_NAME_BYTES).contains(&name_bytes) {
            return Err(Error::InvalidNameBytes(name_bytes));
        }
        let mut buf = [0u8; MAX_NAME_BYTES];
        rand::thread_rng().fill_bytes(&mut buf[..name_bytes]);
        Self::from_slice(&buf[..name_bytes])
    }

    /// Mint a block id for `data`.
    ///
    /// When the width allows it the id is the content digest followed by
    /// random bytes; otherwise it is fully random.
    pub fn for_content(name_bytes: usize, block_size: usize, data: &[u8]) -> Result<Self> {
        if name_bytes < MIN_MD5_NAME_BYTES {
            return Self::random(name_bytes);
        }
        let digest = content_digest(block_size, data);
        let mut id = Self::random(name_bytes)?;
        id.bytes[..DIGEST_BYTES].copy_from_slice(&digest);
        Ok(id)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Width of this id in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Block ids are never empty; provided for clippy symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bucket seed used by both the manifest hash and the cache hash table.
    pub fn hash_seed(&self) -> u32 {
        u32::from_be_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]])
    }

    /// Encode as uppercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.as_bytes())
    }

    /// Name of the object that stores this block in the remote container.
    pub fn to_object_key(&self) -> String {
        format!("{}{BLOCK_SUFFIX}", self.to_hex())
    }

    /// Parse an object key produced by [`BlockId::to_object_key`].
    ///
    /// Returns `None` for keys that are not block objects of the given width.
    pub fn from_object_key(key: &str, name_bytes: usize) -> Option<Self> {
        let stem = key.strip_suffix(BLOCK_SUFFIX)?;
        if stem.len() != name_bytes * 2 || stem.bytes().any(|b| b.is_ascii_lowercase()) {
            return None;
        }
        let bytes = hex::decode(stem).ok()?;
        Self::from_slice(&bytes).ok()
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.to_hex())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// MD5 of a block zero-padded to `block_size`.
pub fn content_digest(block_size: usize, data: &[u8]) -> [u8; DIGEST_BYTES] {
    let mut hasher = Md5::new();
    hasher.update(data);
    if data.len() < block_size {
        let zeros = [0u8; 4096];
        let mut remaining = block_size - data.len();
        while remaining > 0 {
            let n = remaining.min(zeros.len());
            hasher.update(&zeros[..n]);
            remaining -= n;
        }
    }
    hasher.finalize().into()
}

/// Stable 16-byte identifier of a database within a container.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DbId([u8; crate::DBID_SIZE]);

impl DbId {
    /// The all-zero id, used on the wire and in the manifest for "no parent".
    pub const NONE: DbId = DbId([0u8; crate::DBID_SIZE]);

    /// Create a DbId from raw bytes.
    pub fn from_bytes(bytes: [u8; crate::DBID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a DbId from a slice, which must be exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; crate::DBID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidDbId(format!("expected 16 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Generate a new random id.
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; crate::DBID_SIZE] {
        &self.0
    }

    /// True for the all-zero id.
    pub fn is_none(&self) -> bool {
        self.0 == [0u8; crate::DBID_SIZE]
    }

    /// Encode as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for DbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DbId({})", self.to_hex())
    }
}

impl fmt::Display for DbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_width_bounds() {
        assert!(BlockId::from_slice(&[0u8; 11]).is_err());
        assert!(BlockId::from_slice(&[0u8; 12]).is_ok());
        assert!(BlockId::from_slice(&[0u8; 32]).is_ok());
        assert!(BlockId::from_slice(&[0u8; 33]).is_err());
    }

    #[test]
    fn test_object_key_round_trip() {
        let id = BlockId::random(16).unwrap();
        let key = id.to_object_key();
        assert!(key.ends_with(".bcv"));
        assert_eq!(key.len(), 32 + 4);
        assert_eq!(BlockId::from_object_key(&key, 16), Some(id));
        // Wrong width or not a block at all.
        assert_eq!(BlockId::from_object_key(&key, 24), None);
        assert_eq!(BlockId::from_object_key("manifest.bcv", 16), None);
        assert_eq!(BlockId::from_object_key(&key.to_lowercase(), 16), None);
    }

    #[test]
    fn test_content_ids_share_digest_prefix() {
        let a = BlockId::for_content(24, 64, b"hello").unwrap();
        let b = BlockId::for_content(24, 64, b"hello").unwrap();
        assert_eq!(a.as_bytes()[..DIGEST_BYTES], b.as_bytes()[..DIGEST_BYTES]);
        // The random suffix keeps the ids distinct.
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_pads_short_blocks() {
        let mut padded = b"abc".to_vec();
        padded.resize(64, 0);
        assert_eq!(content_digest(64, b"abc"), content_digest(64, &padded));
    }

    #[test]
    fn test_narrow_ids_are_random() {
        let a = BlockId::for_content(16, 64, b"same").unwrap();
        let b = BlockId::for_content(16, 64, b"same").unwrap();
        assert_ne!(a.as_bytes()[..DIGEST_BYTES], b.as_bytes()[..DIGEST_BYTES]);
    }

    #[test]
    fn test_db_id_none() {
        assert!(DbId::NONE.is_none());
        assert!(!DbId::new_random().is_none());
        assert!(DbId::from_slice(&[1u8; 15]).is_err());
    }
}

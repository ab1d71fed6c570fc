//! The local cache file: a flat array of block-sized slots.

use crate::error::BcvResult;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Cache file with `n_slots` slots of `block_size` bytes each.
#[derive(Debug)]
pub struct CacheFile {
    file: File,
    path: PathBuf,
    block_size: usize,
    n_slots: u32,
}

impl CacheFile {
    /// Open (creating if needed) the cache file and size it to hold as many
    /// whole blocks as fit in `cache_size` bytes.
    pub async fn open(path: impl AsRef<Path>, cache_size: u64, block_size: u32) -> BcvResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let n_slots = u32::try_from(cache_size / u64::from(block_size)).unwrap_or(u32::MAX);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.set_len(u64::from(n_slots) * u64::from(block_size))
            .await?;
        tracing::debug!(path = %path.display(), n_slots, block_size, "opened cache file");
        Ok(Self {
            file,
            path,
            block_size: block_size as usize,
            n_slots,
        })
    }

    /// Number of slots.
    pub fn n_slots(&self) -> u32 {
        self.n_slots
    }

    /// Size of each slot in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Location of the file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of `slot`.
    pub fn offset(&self, slot: u32) -> u64 {
        u64::from(slot) * self.block_size as u64
    }

    /// Read the whole of `slot`.
    pub async fn read_slot(&mut self, slot: u32) -> BcvResult<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size];
        self.file.seek(SeekFrom::Start(self.offset(slot))).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Write `data` to `slot`, zero-filling the remainder of the slot.
    pub async fn write_slot(&mut self, slot: u32, data: &[u8]) -> BcvResult<()> {
        let n = data.len().min(self.block_size);
        self.file.seek(SeekFrom::Start(self.offset(slot))).await?;
        self.file.write_all(&data[..n]).await?;
        if n < self.block_size {
            self.file.write_all(&vec![0u8; self.block_size - n]).await?;
        }
        self.file.flush().await?;
        Ok(())
    }
}

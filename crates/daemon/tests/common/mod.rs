//! Common test utilities and fixtures.

use bcv_core::{DaemonConfig, MANIFEST_KEY, Manifest};
use bcv_daemon::Embedded;
use bcv_storage::{MemoryAccount, StorageOpener};
use std::sync::Arc;
use tempfile::TempDir;

pub const MEMORY: &str = "memory";
pub const ACCOUNT: &str = "acct";
pub const CONTAINER: &str = "cont";

/// Block size of [`DaemonConfig::for_testing`].
pub const BLOCK_SIZE: usize = 64 * 1024;

/// A temporary directory and an in-memory account shared by every engine
/// opened from it.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestEnv {
    pub dir: TempDir,
    pub opener: Arc<StorageOpener>,
    pub account: Arc<MemoryAccount>,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let opener = StorageOpener::new();
        let account = opener.memory_account(ACCOUNT);
        Self {
            dir,
            opener,
            account,
        }
    }

    /// Test configuration with its own cache directory.
    pub fn config(&self, name: &str) -> DaemonConfig {
        DaemonConfig::for_testing(self.dir.path().join(name))
    }

    pub async fn embedded(&self, name: &str) -> Embedded {
        Embedded::open(self.config(name), self.opener.clone())
            .await
            .expect("Failed to open embedded engine")
    }

    /// Create [`CONTAINER`] and attach it to a fresh embedded engine.
    pub async fn publisher(&self) -> Embedded {
        let mut e = self.embedded("publisher").await;
        e.create(MEMORY, ACCOUNT, CONTAINER, None)
            .await
            .expect("Failed to create container");
        e.attach(MEMORY, ACCOUNT, CONTAINER, None, None, 0)
            .await
            .expect("Failed to attach container");
        e
    }

    /// The manifest currently stored in [`CONTAINER`].
    pub fn remote_manifest(&self) -> Manifest {
        let data = self
            .account
            .object(CONTAINER, MANIFEST_KEY)
            .expect("No manifest in container");
        Manifest::parse(&data, None).expect("Stored manifest is corrupt")
    }
}

/// Generate a full block of deterministic data based on a seed.
pub fn block(seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; BLOCK_SIZE];
    let mut state = seed;
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }
    data
}

/// Create database `name` with `n` distinct blocks seeded from `seed` and
/// upload it. Returns the block contents.
#[allow(dead_code)]
pub async fn publish_db(e: &mut Embedded, name: &str, n: u32, seed: u64) -> Vec<Vec<u8>> {
    e.create_database(CONTAINER, name)
        .expect("Failed to stage database");
    let mut blocks = Vec::new();
    for i in 0..n {
        let data = block(seed + u64::from(i));
        e.write_block(CONTAINER, name, i, &data)
            .await
            .expect("Failed to write block");
        blocks.push(data);
    }
    e.upload(CONTAINER).await.expect("Failed to upload");
    blocks
}

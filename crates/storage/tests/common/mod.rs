use bcv_storage::{CloudStorage, FilesystemBackend, MemoryAccount, MemoryBackend};
use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;

/// Generate deterministic test data using a seeded pseudo-random generator.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
    Bytes::from(data)
}

/// A created container on each local backend, with the guard keeping the
/// filesystem root alive.
pub async fn local_backends() -> (TempDir, Vec<Arc<dyn CloudStorage>>) {
    let temp = TempDir::new().unwrap();
    let fs = FilesystemBackend::new(temp.path(), "cont").await.unwrap();
    let mem = MemoryBackend::new(MemoryAccount::new("acct"), "cont", None);
    let backends: Vec<Arc<dyn CloudStorage>> = vec![Arc::new(fs), Arc::new(mem)];
    for backend in &backends {
        backend.create().await.unwrap();
    }
    (temp, backends)
}

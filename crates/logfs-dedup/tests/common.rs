//! Shared fixtures for the logfs-dedup integration tests.

#![allow(dead_code)]

use logfs_dedup::{DedupConfig, FileSpec, InodeId, Volume, VolumeConfig, PAGE_SIZE};

/// Volume sized for tests: sharing allowed from one byte up.
pub fn test_volume(total_blocks: u64) -> Volume {
    Volume::new(VolumeConfig {
        name: "test".to_string(),
        total_blocks,
        dedup: DedupConfig {
            min_share_bytes: 1,
            revoke_batch_pages: 4,
            drain_timeout_ms: 200,
            sample_seed: Some(7),
            ..Default::default()
        },
    })
    .expect("valid test config")
}

/// Deterministic, page-distinct content of `len` bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / PAGE_SIZE) as u8).wrapping_mul(31).wrapping_add(seed) ^ (i as u8))
        .collect()
}

/// Creates a regular file holding `content` and writes it to stable storage.
pub async fn file_with(vol: &Volume, content: &[u8]) -> InodeId {
    let ino = vol.create_file(FileSpec::regular()).expect("create file");
    vol.write(ino, 0, content).await.expect("write content");
    vol.checkpoint().expect("checkpoint");
    ino
}

/// Creates an outer file and a frozen candidate with identical content.
pub async fn identical_pair(vol: &Volume, content: &[u8]) -> (InodeId, InodeId) {
    let outer = file_with(vol, content).await;
    let candidate = file_with(vol, content).await;
    vol.set_frozen(candidate, true).expect("freeze candidate");
    (outer, candidate)
}

/// Installs a fmt subscriber once so `RUST_LOG` works in tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

//! Block migration by the segment cleaner.
//!
//! The cleaner relocates live blocks so it can reclaim whole segments. It
//! holds the GC barrier shared; sharing transitions hold it exclusively for
//! their data phase, so no block is moved while one is being copied or
//! replaced by a sentinel.

use tracing::trace;

use crate::error::DedupResult;
use crate::sentinel::BlockEntry;
use crate::types::InodeId;
use crate::volume::Volume;

impl Volume {
    /// Moves the private block backing page `index` of `ino` to a fresh
    /// address. Returns false if the page has no private block or was
    /// remapped while being moved.
    pub async fn migrate_block(&self, ino: InodeId, index: u64) -> DedupResult<bool> {
        self.ensure_writable()?;
        let inode = self.inode(ino)?;
        let _gc = self.gc_barrier.read().await;

        let Some(old) = inode.map.lock().get(index).private_addr() else {
            return Ok(false);
        };
        let data = self.store().read(old)?;
        let new = self.store().allocate()?;
        if let Err(e) = self.store().write(new, &data) {
            self.store().invalidate(new);
            return Err(e);
        }

        let moved = {
            let _txn = self.begin_txn();
            let mut map = inode.map.lock();
            if map.get(index) == BlockEntry::Addr(old) {
                map.set(index, BlockEntry::Addr(new));
                true
            } else {
                false
            }
        };
        // cached pages are keyed by logical index and stay valid
        self.store().invalidate(if moved { old } else { new });
        trace!(%ino, index, old, new, moved, "Migrated block");
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::types::{FileSpec, PAGE_SIZE};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_migrate_moves_block() {
        let vol = Volume::new(VolumeConfig::default()).unwrap();
        let ino = vol.create_file(FileSpec::regular()).unwrap();
        vol.write(ino, 0, &vec![3; PAGE_SIZE]).await.unwrap();
        vol.checkpoint().unwrap();
        let inode = vol.inode(ino).unwrap();
        let before = inode.map.lock().get(0);

        assert!(vol.migrate_block(ino, 0).await.unwrap());
        let after = inode.map.lock().get(0);
        assert_ne!(before, after);
        assert_eq!(inode.physical_blocks(), 1);
        inode.cache.evict_all();
        assert_eq!(vol.read(ino, 0, PAGE_SIZE).await.unwrap(), vec![3; PAGE_SIZE]);
    }

    #[tokio::test]
    async fn test_migrate_skips_holes_and_sentinels() {
        let vol = Volume::new(VolumeConfig {
            dedup: crate::config::DedupConfig {
                min_share_bytes: 1,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let a = vol.create_file(FileSpec::regular()).unwrap();
        let b = vol.create_file(FileSpec::regular()).unwrap();
        assert!(!vol.migrate_block(a, 5).await.unwrap());

        vol.write(a, 0, b"abc").await.unwrap();
        vol.write(b, 0, b"abc").await.unwrap();
        vol.set_frozen(b, true).unwrap();
        vol.establish_sharing(a, b, &CancellationToken::new()).await.unwrap();
        assert!(!vol.migrate_block(a, 0).await.unwrap());
        assert!(vol.migrate_block(b, 0).await.unwrap());
    }
}

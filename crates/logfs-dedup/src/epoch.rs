//! Consistency-epoch stamping.
//!
//! Incremental replay logs individual block writes and cannot express a
//! change in sharing topology. A file whose last sharing transition completed
//! in the current checkpoint epoch therefore forces a full checkpoint on
//! fsync.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DedupError, DedupResult};
use crate::inode::Inode;
use crate::types::{Epoch, InodeId};
use crate::volume::Volume;

/// How an fsync was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Only the file's own dirty pages were written.
    Incremental,
    /// A full checkpoint was taken.
    FullCheckpoint,
}

impl Volume {
    pub(crate) fn stamp_transition(&self, inode: &Inode) {
        let epoch = self.current_epoch();
        inode.set_stamp(epoch);
        debug!(ino = %inode.id(), %epoch, "Stamped sharing transition");
    }

    /// True if `ino` completed a sharing transition in the current epoch, in
    /// which case incremental replay must not be trusted for it.
    pub fn needs_full_checkpoint(&self, ino: InodeId) -> DedupResult<bool> {
        let inode = self.inode(ino)?;
        Ok(inode.stamp() == Some(self.current_epoch()))
    }

    /// Makes `ino` durable, forcing a full checkpoint when the file was just
    /// involved in a sharing transition or is in the middle of one.
    pub async fn fsync(&self, ino: InodeId) -> DedupResult<SyncMode> {
        let inode = self.inode(ino)?;
        if inode.is_inner() {
            return Err(DedupError::InnerObject { ino });
        }
        let in_transition = inode.share.read().await.in_transition();
        if in_transition || self.needs_full_checkpoint(ino)? {
            self.checkpoint()?;
            return Ok(SyncMode::FullCheckpoint);
        }
        self.ensure_writable()?;
        self.writeback_inode(&inode)?;
        self.store().flush()?;
        Ok(SyncMode::Incremental)
    }

    /// Writes back every dirty page and starts a new epoch. Files in the
    /// middle of a transition are skipped; the transition writes them back
    /// itself.
    pub fn checkpoint(&self) -> DedupResult<Epoch> {
        self.ensure_writable()?;
        let mut written = 0;
        for inode in self.all_inodes() {
            let busy = inode.share.try_read().map_or(true, |s| s.in_transition());
            if busy {
                continue;
            }
            written += self.writeback_inode(&inode)?;
        }
        self.store().flush()?;
        let epoch = self.advance_epoch();
        info!(%epoch, written, "Checkpoint complete");
        Ok(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::page::Page;
    use crate::types::{FileSpec, PAGE_SIZE};

    #[tokio::test]
    async fn test_stamp_forces_full_checkpoint_once() {
        let vol = Volume::new(VolumeConfig::default()).unwrap();
        let ino = vol.create_file(FileSpec::regular()).unwrap();
        let inode = vol.inode(ino).unwrap();
        assert!(!vol.needs_full_checkpoint(ino).unwrap());

        vol.stamp_transition(&inode);
        assert!(vol.needs_full_checkpoint(ino).unwrap());
        let before = vol.current_epoch();
        assert_eq!(vol.fsync(ino).await.unwrap(), SyncMode::FullCheckpoint);
        assert_ne!(vol.current_epoch(), before);

        assert!(!vol.needs_full_checkpoint(ino).unwrap());
        assert_eq!(vol.fsync(ino).await.unwrap(), SyncMode::Incremental);
    }

    #[tokio::test]
    async fn test_incremental_fsync_writes_back() {
        let vol = Volume::new(VolumeConfig::default()).unwrap();
        let ino = vol.create_file(FileSpec::regular()).unwrap();
        let inode = vol.inode(ino).unwrap();
        inode.cache.replace(Page::new(ino, 0, vec![1; PAGE_SIZE], true));
        assert_eq!(vol.fsync(ino).await.unwrap(), SyncMode::Incremental);
        assert!(!inode.cache.has_dirty());
        assert_eq!(inode.physical_blocks(), 1);
    }

    #[test]
    fn test_checkpoint_advances_epoch() {
        let vol = Volume::new(VolumeConfig::default()).unwrap();
        assert_eq!(vol.current_epoch(), Epoch::INITIAL);
        let next = vol.checkpoint().unwrap();
        assert_eq!(next, Epoch::new(2));
        assert_eq!(vol.current_epoch(), next);
    }
}

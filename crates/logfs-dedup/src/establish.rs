//! Sharing establishment.
//!
//! Moves an outer file from owning its blocks to delegating them to an inner
//! object:
//!
//! 1. verify the candidate's content against the outer;
//! 2. attach under the outer's transition lock (`Establishing`);
//! 3. drain in-flight readers and direct I/O of the outer;
//! 4. flush the outer's dirty pages and wait for the device;
//! 5. replace every block-map entry with the sentinel in one metadata
//!    transaction and drop the outer's cached pages;
//! 6. mark the outer `Shared`, stamp it with the current epoch and remove the
//!    ledger entry.
//!
//! Any failure before step 5 commits detaches the outer again. A crash leaves
//! the ledger entry for remount recovery.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{DedupError, DedupResult};
use crate::fault::FaultPoint;
use crate::inode::{Inode, ShareState};
use crate::lifecycle::LastLink;
use crate::types::{pages_for, EncryptionPolicy, FileType, InodeId};
use crate::verify::Verdict;
use crate::volume::Volume;

impl Volume {
    /// Makes `outer` share the content of `candidate`.
    ///
    /// `candidate` becomes (or already is) an inner object. Returns
    /// [`DedupError::StaleContent`] if the content differs or changed while
    /// being verified, and a retryable error on contention or cancellation.
    pub async fn establish_sharing(
        &self,
        outer: InodeId,
        candidate: InodeId,
        cancel: &CancellationToken,
    ) -> DedupResult<()> {
        self.ensure_writable()?;
        if outer == candidate {
            return Err(DedupError::SameFile { ino: outer });
        }
        let outer_ino = self.inode(outer)?;
        let inner_ino = self.inode(candidate)?;
        self.check_establish(&outer_ino, &inner_ino)?;
        let version = outer_ino.data_version();

        let samples = self.config().dedup.sample_pages;
        if self.compare_sampled(&outer_ino, &inner_ino, samples)? == Verdict::Different {
            return Err(DedupError::StaleContent { outer, inner: candidate });
        }

        let fresh_inner = !inner_ino.is_inner();
        if fresh_inner {
            self.writeback_inode(&inner_ino)?;
            self.store().flush()?;
        }
        let seq = {
            let mut state = outer_ino
                .share
                .try_write()
                .map_err(|_| DedupError::Busy { ino: outer })?;
            if !state.is_independent() {
                return Err(if state.in_transition() {
                    DedupError::Busy { ino: outer }
                } else {
                    DedupError::AlreadyShared { ino: outer }
                });
            }
            if outer_ino.data_version() != version || outer_ino.size() != inner_ino.size() {
                return Err(DedupError::StaleContent { outer, inner: candidate });
            }
            self.attach(&outer_ino, &mut state, &inner_ino, fresh_inner)?
        };

        match self.establish_data_phase(&outer_ino, cancel).await {
            Ok(()) => {}
            Err(e) if e.is_crash() => return Err(e),
            Err(e) => {
                self.abort_establish(&outer_ino, seq, fresh_inner).await;
                return Err(e);
            }
        }

        {
            let mut state = outer_ino.share.write().await;
            if let ShareState::Establishing { inner } = state.clone() {
                *state = ShareState::Shared { inner };
            }
        }
        if self.post_commit(FaultPoint::EstablishStamp, outer)? {
            self.stamp_transition(&outer_ino);
        }
        if self.post_commit(FaultPoint::LedgerRemove, outer)? {
            self.ledger().remove(seq);
        }
        info!(
            %outer,
            inner = %candidate,
            links = inner_ino.link_count(),
            "Established sharing"
        );
        Ok(())
    }

    fn check_establish(&self, outer: &Inode, inner: &Inode) -> DedupResult<()> {
        let ino = outer.id();
        if outer.is_inner() {
            return Err(DedupError::InnerObject { ino });
        }
        if outer.file_type() != FileType::Regular {
            return Err(DedupError::NotRegular { ino });
        }
        let flags = outer.flags();
        if flags.pinned {
            return Err(DedupError::Incompatible { ino, reason: "pinned" });
        }
        if flags.atomic_write {
            return Err(DedupError::Incompatible {
                ino,
                reason: "atomic write in progress",
            });
        }
        if !EncryptionPolicy::compatible(outer.encryption(), inner.encryption()) {
            return Err(DedupError::PolicyMismatch {
                outer: ino,
                inner: inner.id(),
            });
        }
        self.check_designate(inner, outer)?;
        if inner.is_dying() {
            return Err(DedupError::Busy { ino: inner.id() });
        }
        if !inner.is_inner() {
            let state = inner
                .share
                .try_read()
                .map_err(|_| DedupError::Busy { ino: inner.id() })?;
            if !state.is_independent() {
                return Err(DedupError::Incompatible {
                    ino: inner.id(),
                    reason: "candidate is itself attached to an inner object",
                });
            }
        }
        if outer.size() != inner.size() {
            return Err(DedupError::SizeMismatch {
                outer_size: outer.size(),
                inner_size: inner.size(),
            });
        }
        let state = outer.share.try_read().map_err(|_| DedupError::Busy { ino })?;
        match &*state {
            ShareState::Independent => Ok(()),
            ShareState::Shared { .. } => Err(DedupError::AlreadyShared { ino }),
            _ => Err(DedupError::Busy { ino }),
        }
    }

    /// Steps 3 to 5.
    async fn establish_data_phase(
        &self,
        outer: &Arc<Inode>,
        cancel: &CancellationToken,
    ) -> DedupResult<()> {
        let ino = outer.id();
        self.faults().check(FaultPoint::DrainReaders)?;
        outer.drain(self.config().dedup.drain_timeout(), cancel).await?;
        let _gc = self.gc_barrier.write().await;

        self.faults().check(FaultPoint::FlushOuter)?;
        self.writeback_inode(outer)?;
        self.store().flush()?;
        if cancel.is_cancelled() {
            return Err(DedupError::Cancelled { ino });
        }

        let pages = pages_for(outer.size());
        let (shared, freed) = {
            let map = outer.map.lock();
            map.install_sentinels(pages, |_| self.faults().check(FaultPoint::SentinelInstall))?
        };
        {
            let _txn = self.begin_txn();
            self.faults().check(FaultPoint::SentinelCommit)?;
            *outer.map.lock() = shared;
        }
        outer.cache.evict_all();
        for addr in &freed {
            self.store().invalidate(*addr);
        }
        info!(%ino, pages, freed = freed.len(), "Installed sentinels");
        Ok(())
    }

    async fn abort_establish(&self, outer: &Arc<Inode>, seq: u64, fresh_inner: bool) {
        let last = if fresh_inner { LastLink::Revert } else { LastLink::Delete };
        let mut state = outer.share.write().await;
        match self.detach(outer, &mut state, last) {
            Ok(detached) => {
                drop(state);
                self.ledger().remove(seq);
                warn!(
                    ino = %outer.id(),
                    inner = %detached.inner.id(),
                    "Sharing establishment rolled back"
                );
                self.reap_inner(detached).await;
            }
            Err(e) => {
                drop(state);
                self.mark_needs_fsck(format!(
                    "rollback of sharing on {} failed: {}",
                    outer.id(),
                    e
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupConfig, VolumeConfig};
    use crate::fault::{FaultAction, FaultSpec};
    use crate::lifecycle::SharingState;
    use crate::page::Page;
    use crate::sentinel::BlockEntry;
    use crate::types::{FileSpec, PAGE_SIZE};

    fn volume() -> Volume {
        Volume::new(VolumeConfig {
            total_blocks: 256,
            dedup: DedupConfig {
                min_share_bytes: PAGE_SIZE as u64,
                sample_seed: Some(1),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    fn file_with(vol: &Volume, fills: &[u8], frozen: bool) -> InodeId {
        let ino = vol.create_file(FileSpec::regular()).unwrap();
        let inode = vol.inode(ino).unwrap();
        for (i, fill) in fills.iter().enumerate() {
            inode
                .cache
                .replace(Page::new(ino, i as u64, vec![*fill; PAGE_SIZE], true));
        }
        inode.set_size((fills.len() * PAGE_SIZE) as u64);
        vol.writeback_inode(&inode).unwrap();
        inode.update_flags(|f| f.data_frozen = frozen);
        ino
    }

    #[tokio::test]
    async fn test_establish_installs_sentinels() {
        let vol = volume();
        let a = file_with(&vol, &[1, 2, 3], false);
        let b = file_with(&vol, &[1, 2, 3], true);
        let free_before = vol.store().free_blocks();

        vol.establish_sharing(a, b, &CancellationToken::new()).await.unwrap();

        let outer = vol.inode(a).unwrap();
        assert_eq!(outer.physical_blocks(), 0);
        assert_eq!(outer.map.lock().sentinel_count(), 3);
        assert_eq!(outer.map.lock().get(0), BlockEntry::Shared);
        assert_eq!(vol.store().free_blocks(), free_before + 3);
        assert_eq!(outer.stamp(), Some(vol.current_epoch()));
        assert!(vol.ledger().is_empty());
        assert_eq!(
            vol.query_sharing_state(a).await.unwrap(),
            SharingState::Shared { inner: b, link_count: 1 }
        );
    }

    #[tokio::test]
    async fn test_establish_preconditions() {
        let vol = volume();
        let a = file_with(&vol, &[1, 2], false);
        let b = file_with(&vol, &[1, 2], true);
        let small = file_with(&vol, &[1], true);
        let cancel = CancellationToken::new();

        assert!(matches!(
            vol.establish_sharing(a, a, &cancel).await,
            Err(DedupError::SameFile { .. })
        ));
        assert!(matches!(
            vol.establish_sharing(a, small, &cancel).await,
            Err(DedupError::SizeMismatch { .. })
        ));
        let unfrozen = file_with(&vol, &[1, 2], false);
        assert!(matches!(
            vol.establish_sharing(a, unfrozen, &cancel).await,
            Err(DedupError::NotFrozen { .. })
        ));

        vol.establish_sharing(a, b, &cancel).await.unwrap();
        assert!(matches!(
            vol.establish_sharing(a, b, &cancel).await,
            Err(DedupError::AlreadyShared { .. })
        ));
        let c = file_with(&vol, &[1, 2], false);
        assert!(matches!(
            vol.establish_sharing(b, c, &cancel).await,
            Err(DedupError::InnerObject { .. })
        ));
    }

    #[tokio::test]
    async fn test_content_mismatch_changes_nothing() {
        let vol = volume();
        let a = file_with(&vol, &[1, 2], false);
        let b = file_with(&vol, &[7, 7], true);
        let err = vol
            .establish_sharing(a, b, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::StaleContent { .. }));
        assert_eq!(vol.inode(a).unwrap().physical_blocks(), 2);
        assert!(!vol.inode(b).unwrap().is_inner());
        assert!(vol.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_commit_rolls_back() {
        let vol = volume();
        let a = file_with(&vol, &[4, 4], false);
        let b = file_with(&vol, &[4, 4], true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = vol.establish_sharing(a, b, &cancel).await.unwrap_err();
        assert!(err.is_retryable());
        let outer = vol.inode(a).unwrap();
        assert_eq!(outer.physical_blocks(), 2);
        assert!(!outer.map.lock().has_sentinel());
        let inner = vol.inode(b).unwrap();
        assert!(!inner.is_inner());
        assert_eq!(inner.link_count(), 0);
        assert!(vol.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_sentinel_install_failure_leaves_map_untouched() {
        let vol = volume();
        let a = file_with(&vol, &[9, 9, 9, 9], false);
        let b = file_with(&vol, &[9, 9, 9, 9], true);
        vol.faults()
            .arm(FaultPoint::SentinelInstall, FaultSpec::after(2, FaultAction::IoError));
        let err = vol
            .establish_sharing(a, b, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::Io(_)));
        let outer = vol.inode(a).unwrap();
        assert_eq!(outer.physical_blocks(), 4);
        assert!(!outer.map.lock().has_sentinel());
        assert_eq!(vol.query_sharing_state(a).await.unwrap(), SharingState::NotShared);
        assert!(vol.needs_fsck().is_none());
    }

    #[tokio::test]
    async fn test_second_outer_joins_existing_inner() {
        let vol = volume();
        let a = file_with(&vol, &[5, 6], false);
        let c = file_with(&vol, &[5, 6], false);
        let b = file_with(&vol, &[5, 6], true);
        let cancel = CancellationToken::new();
        vol.establish_sharing(a, b, &cancel).await.unwrap();
        vol.establish_sharing(c, b, &cancel).await.unwrap();
        assert_eq!(vol.inode(b).unwrap().link_count(), 2);
    }
}

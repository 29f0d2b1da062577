//! Remount recovery from the orphan ledger.
//!
//! Volatile state (page cache, reader counters) does not survive a crash, so
//! recovery drops it first, then resolves every ledger entry in sequence
//! order:
//! - `Establish`: rolled forward to `Shared` if the sentinel map was
//!   committed, otherwise detached again;
//! - `Revoke`: an outer still `Revoking` has the revocation finished from
//!   the sentinels that remain, under the same entry; an outer already
//!   detached only needs its stamp;
//! - `ReleaseInner`: the inner object is deleted.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::DedupResult;
use crate::inode::ShareState;
use crate::ledger::{LedgerEntry, OrphanIntent};
use crate::lifecycle::LastLink;
use crate::types::InodeId;
use crate::volume::Volume;

/// What remount recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Ledger entries examined
    pub entries: usize,
    /// Establishments completed
    pub rolled_forward: usize,
    /// Establishments undone
    pub rolled_back: usize,
    /// Revocations resumed
    pub revocations_resumed: usize,
    /// Revocations that had already detached
    pub revocations_completed: usize,
    /// Inner objects deleted
    pub inners_released: usize,
    /// Entries that referred to inodes that no longer exist
    pub stale_entries: usize,
}

impl Volume {
    /// Simulates a remount: drops volatile state and resolves every
    /// outstanding ledger entry.
    pub async fn recover(&self) -> DedupResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut dropped = 0;
        for inode in self.all_inodes() {
            dropped += inode.cache.evict_all();
            inode.reset_gate();
        }
        let entries = self.ledger().entries();
        info!(entries = entries.len(), dropped_dirty = dropped, "Starting remount recovery");

        for entry in entries {
            report.entries += 1;
            match entry.intent {
                OrphanIntent::Establish {
                    outer,
                    inner: _,
                    fresh_inner,
                } => self.recover_establish(&entry, outer, fresh_inner, &mut report).await?,
                OrphanIntent::Revoke { outer, .. } => {
                    self.recover_revoke(&entry, outer, &mut report).await?
                }
                // handled by the reap pass below
                OrphanIntent::ReleaseInner { .. } => {}
            }
        }
        report.inners_released = self.reap_pending().await;

        info!(?report, "Remount recovery complete");
        Ok(report)
    }

    async fn recover_establish(
        &self,
        entry: &LedgerEntry,
        outer: InodeId,
        fresh_inner: bool,
        report: &mut RecoveryReport,
    ) -> DedupResult<()> {
        let Ok(inode) = self.inode(outer) else {
            warn!(seq = entry.seq, %outer, "Ledger entry for missing outer");
            self.ledger().remove(entry.seq);
            report.stale_entries += 1;
            return Ok(());
        };
        let mut state = inode.share.write().await;
        match state.clone() {
            ShareState::Establishing { inner } if inode.map.lock().has_sentinel() => {
                *state = ShareState::Shared { inner };
                drop(state);
                self.stamp_transition(&inode);
                report.rolled_forward += 1;
                debug!(%outer, "Establishment rolled forward");
            }
            ShareState::Establishing { .. } => {
                let last = if fresh_inner { LastLink::Revert } else { LastLink::Delete };
                let detached = self.detach(&inode, &mut state, last)?;
                drop(state);
                self.reap_inner(detached).await;
                report.rolled_back += 1;
                debug!(%outer, "Establishment rolled back");
            }
            ShareState::Shared { .. } => {
                drop(state);
                self.stamp_transition(&inode);
                report.rolled_forward += 1;
            }
            // never attached
            ShareState::Independent | ShareState::Revoking { .. } => {
                report.rolled_back += 1;
            }
        }
        self.ledger().remove(entry.seq);
        Ok(())
    }

    async fn recover_revoke(
        &self,
        entry: &LedgerEntry,
        outer: InodeId,
        report: &mut RecoveryReport,
    ) -> DedupResult<()> {
        let Ok(inode) = self.inode(outer) else {
            warn!(seq = entry.seq, %outer, "Ledger entry for missing outer");
            self.ledger().remove(entry.seq);
            report.stale_entries += 1;
            return Ok(());
        };
        let state = inode.share.read().await.clone();
        match state {
            ShareState::Revoking { .. } => {
                report.revocations_resumed += 1;
                // the entry is removed by the revocation once it detaches
                match self.resume_revoke(&inode, entry.seq).await {
                    Ok(()) => debug!(%outer, "Revocation resumed to completion"),
                    Err(e) if e.is_crash() => return Err(e),
                    Err(e) => warn!(%outer, error = %e, "Resumed revocation failed, entry kept"),
                }
                return Ok(());
            }
            ShareState::Independent => {
                self.stamp_transition(&inode);
                report.revocations_completed += 1;
            }
            ShareState::Shared { .. } | ShareState::Establishing { .. } => {}
        }
        self.ledger().remove(entry.seq);
        Ok(())
    }
}

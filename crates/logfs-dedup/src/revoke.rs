//! Unsharing (revocation).
//!
//! Copies the inner object's content back into private blocks of the outer,
//! batch by batch, then detaches. Only entries still holding the sentinel are
//! copied, so a revocation that was cancelled resumes where it stopped.
//!
//! Failure handling is forward-only once copying has started: if a batch
//! cannot be read, allocated or written back, the outer stays `Revoking`
//! with its ledger entry and the volume is flagged for an offline check.
//! Reads keep being served from the inner object, which stays linked until
//! remount recovery has copied the remaining sentinels and detached the
//! outer exactly once.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DedupError, DedupResult};
use crate::fault::FaultPoint;
use crate::inode::{Inode, ShareState};
use crate::ledger::OrphanIntent;
use crate::lifecycle::LastLink;
use crate::page::Page;
use crate::sentinel::BlockEntry;
use crate::types::InodeId;
use crate::volume::Volume;

impl Volume {
    /// Makes `outer` independent again. A no-op for a file that is not
    /// shared.
    pub async fn unshare(&self, outer: InodeId, cancel: &CancellationToken) -> DedupResult<()> {
        let inode = self.inode(outer)?;
        if inode.is_inner() {
            return Err(DedupError::InnerObject { ino: outer });
        }
        self.revoke(&inode, cancel).await
    }

    pub(crate) async fn revoke(
        &self,
        outer: &Arc<Inode>,
        cancel: &CancellationToken,
    ) -> DedupResult<()> {
        let Some((inner, seq)) = self.begin_revoke(outer)? else {
            return Ok(());
        };
        self.complete_revoke(outer, &inner, seq, cancel).await
    }

    /// Finishes a revocation left `Revoking` under ledger entry `seq`. Only
    /// the sentinels that remain are copied.
    pub(crate) async fn resume_revoke(&self, outer: &Arc<Inode>, seq: u64) -> DedupResult<()> {
        let ino = outer.id();
        let link = match &*outer.share.read().await {
            ShareState::Revoking { inner } => inner.clone(),
            _ => return Ok(()),
        };
        let Some(inner) = link.upgrade() else {
            self.mark_needs_fsck(format!("{} is revoking from missing inner {}", ino, link.id()));
            return Err(DedupError::MissingInner {
                outer: ino,
                inner: link.id(),
            });
        };
        self.complete_revoke(outer, &inner, seq, &CancellationToken::new()).await
    }

    async fn complete_revoke(
        &self,
        outer: &Arc<Inode>,
        inner: &Arc<Inode>,
        seq: u64,
        cancel: &CancellationToken,
    ) -> DedupResult<()> {
        match self.revoke_copy(outer, inner, cancel).await {
            Ok(()) => self.finish_revoke(outer, seq).await,
            Err(e) if e.is_crash() => Err(e),
            Err(e @ DedupError::Cancelled { .. }) => {
                self.cancel_revoke(outer, seq).await;
                Err(e)
            }
            Err(e) => Err(self.fail_revoke(outer, seq, e)),
        }
    }

    /// Steps 1 and 2: ledger entry and `Revoking` state, in one metadata
    /// transaction. Returns `None` if the outer is already independent.
    fn begin_revoke(&self, outer: &Inode) -> DedupResult<Option<(Arc<Inode>, u64)>> {
        let ino = outer.id();
        let mut state = outer.share.try_write().map_err(|_| DedupError::Busy { ino })?;
        let link = match &*state {
            ShareState::Independent => return Ok(None),
            ShareState::Shared { inner } => inner.clone(),
            ShareState::Establishing { .. } | ShareState::Revoking { .. } => {
                return Err(DedupError::Busy { ino })
            }
        };
        self.ensure_writable()?;
        let Some(inner) = link.upgrade() else {
            self.mark_needs_fsck(format!("{} is shared with missing inner {}", ino, link.id()));
            return Err(DedupError::MissingInner {
                outer: ino,
                inner: link.id(),
            });
        };

        let _txn = self.begin_txn();
        self.faults().check(FaultPoint::RevokeMark)?;
        self.faults().check(FaultPoint::LedgerAdd)?;
        let seq = self.ledger().add(OrphanIntent::Revoke {
            outer: ino,
            inner: inner.id(),
        })?;
        *state = ShareState::Revoking { inner: link };
        info!(%ino, inner = %inner.id(), "Revoking shared content");
        Ok(Some((inner, seq)))
    }

    /// Steps 3 and 4.
    async fn revoke_copy(
        &self,
        outer: &Arc<Inode>,
        inner: &Arc<Inode>,
        cancel: &CancellationToken,
    ) -> DedupResult<()> {
        let _gc = self.gc_barrier.write().await;
        let pending = outer.map.lock().sentinel_indices();
        let batch = self.config().dedup.revoke_batch_pages;
        for chunk in pending.chunks(batch) {
            if cancel.is_cancelled() {
                return Err(DedupError::Cancelled { ino: outer.id() });
            }
            self.revoke_batch(outer, inner, chunk)?;
            tokio::task::yield_now().await;
        }
        self.faults().check(FaultPoint::RevokeWait)?;
        self.store().flush()?;
        debug!(ino = %outer.id(), pages = pending.len(), "Revoked range written back");
        Ok(())
    }

    fn revoke_batch(&self, outer: &Inode, inner: &Arc<Inode>, indices: &[u64]) -> DedupResult<()> {
        let mut copies = Vec::with_capacity(indices.len());
        let mut holes = Vec::new();
        for &index in indices {
            self.faults().check(FaultPoint::RevokeReadInner)?;
            // inner content is frozen, so a hole there is a hole for good
            if inner.map.lock().get(index) == BlockEntry::Hole {
                holes.push(index);
                continue;
            }
            let src = self.load_page(inner, index)?;
            self.faults().check(FaultPoint::RevokeCopy)?;
            let data = src.lock().data.clone();
            let page = Page::new(outer.id(), index, data, true);
            outer.cache.replace(page.clone());
            copies.push(page);
        }
        if !holes.is_empty() {
            let _txn = self.begin_txn();
            let mut map = outer.map.lock();
            for index in &holes {
                map.remove_sentinel(*index, BlockEntry::Hole);
            }
        }
        self.faults().check(FaultPoint::RevokeWriteback)?;
        let written = self.writeback_pages(outer, &copies, Some(FaultPoint::RevokeAllocate))?;
        debug!(ino = %outer.id(), written, holes = holes.len(), "Revoked batch");
        Ok(())
    }

    /// Steps 5 and 6.
    async fn finish_revoke(&self, outer: &Arc<Inode>, seq: u64) -> DedupResult<()> {
        let ino = outer.id();
        let detached = {
            let mut state = outer.share.write().await;
            match self.detach(outer, &mut state, LastLink::Delete) {
                Ok(detached) => detached,
                Err(e) if e.is_crash() => return Err(e),
                Err(e) => {
                    // every page is already private; back to a consistent shared state
                    if let ShareState::Revoking { inner } = state.clone() {
                        *state = ShareState::Shared { inner };
                    }
                    drop(state);
                    self.ledger().remove(seq);
                    warn!(%ino, error = %e, "Detach failed, file left shared");
                    return Err(e);
                }
            }
        };
        if self.post_commit(FaultPoint::RevokeStamp, ino)? {
            self.stamp_transition(outer);
        }
        if self.post_commit(FaultPoint::LedgerRemove, ino)? {
            self.ledger().remove(seq);
        }
        info!(%ino, inner = %detached.inner.id(), remaining = detached.remaining, "Unshared");
        self.reap_inner(detached).await;
        Ok(())
    }

    async fn cancel_revoke(&self, outer: &Arc<Inode>, seq: u64) {
        let mut state = outer.share.write().await;
        if let ShareState::Revoking { inner } = state.clone() {
            *state = ShareState::Shared { inner };
        }
        drop(state);
        self.ledger().remove(seq);
        info!(
            ino = %outer.id(),
            remaining = outer.map.lock().sentinel_count(),
            "Revocation cancelled"
        );
    }

    /// Copy-back failed past the point of no return. Copied pages and the
    /// remaining sentinels are kept, the outer stays `Revoking` and linked,
    /// and entry `seq` stays in the ledger for recovery. Returns `cause`.
    fn fail_revoke(&self, outer: &Inode, seq: u64, cause: DedupError) -> DedupError {
        let ino = outer.id();
        let remaining = outer.map.lock().sentinel_count();
        self.mark_needs_fsck(format!(
            "revocation of {} failed with {} pages left: {}",
            ino, remaining, cause
        ));
        error!(%ino, seq, remaining, error = %cause, "Revocation failed, volume needs fsck");
        cause
    }
}

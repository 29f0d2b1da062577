//! Reference lifecycle of inner objects.
//!
//! An inner object is created by designating a content-frozen regular file;
//! the file is converted in place and stops being user-accessible. Each
//! attached outer holds one link. When the last link goes the inner is
//! queued in the orphan ledger and deleted as soon as its readers and direct
//! I/O have drained.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DedupError, DedupResult};
use crate::fault::FaultPoint;
use crate::inode::{Inode, InodeGuard, InnerLink, ShareState};
use crate::ledger::OrphanIntent;
use crate::types::{EncryptionPolicy, FileType, InodeId};
use crate::volume::Volume;

/// Sharing state as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharingState {
    /// The file owns its data privately.
    NotShared,
    /// The file's content is delegated to `inner`.
    Shared {
        /// Inner object id
        inner: InodeId,
        /// Number of outers attached to it
        link_count: u32,
    },
    /// The inode is itself an inner object.
    Inner {
        /// Number of outers attached to it
        link_count: u32,
    },
}

/// Counted handle on an inner object. The inner is not deleted while any
/// handle is alive.
#[derive(Debug)]
pub struct InnerRef {
    guard: InodeGuard,
}

impl InnerRef {
    /// Inner object id.
    pub fn id(&self) -> InodeId {
        self.guard.inode().id()
    }

    /// Current link count of the inner object.
    pub fn link_count(&self) -> u32 {
        self.guard.inode().link_count()
    }

    /// Gives the handle back.
    pub fn release(self) {}
}

/// What happens to an inner object whose last link is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LastLink {
    /// Queue it for deletion.
    Delete,
    /// Turn it back into a plain file. Used when the transition that
    /// designated it is rolled back.
    Revert,
}

/// Result of [`Volume::detach`].
#[derive(Debug)]
pub(crate) struct Detached {
    pub inner: Arc<Inode>,
    pub remaining: u32,
    pub release_seq: Option<u64>,
}

impl Volume {
    /// Checks that `candidate` may become the inner object of `outer`.
    pub(crate) fn check_designate(&self, candidate: &Inode, outer: &Inode) -> DedupResult<()> {
        let ino = candidate.id();
        if candidate.file_type() != FileType::Regular {
            return Err(DedupError::NotRegular { ino });
        }
        let flags = candidate.flags();
        if !flags.data_frozen {
            return Err(DedupError::NotFrozen { ino });
        }
        if !EncryptionPolicy::compatible(outer.dir_policy(), candidate.encryption()) {
            return Err(DedupError::PolicyMismatch {
                outer: outer.id(),
                inner: ino,
            });
        }
        let min = self.config().dedup.min_share_bytes;
        if candidate.size() < min {
            return Err(DedupError::TooSmall {
                ino,
                size: candidate.size(),
                min,
            });
        }
        if flags.pinned {
            return Err(DedupError::Incompatible { ino, reason: "pinned" });
        }
        if flags.atomic_write {
            return Err(DedupError::Incompatible {
                ino,
                reason: "atomic write in progress",
            });
        }
        Ok(())
    }

    /// Converts `candidate` into an inner object suitable for sharing with
    /// `intended_outer`. Idempotent for an existing inner object.
    pub fn designate_inner(&self, candidate: InodeId, intended_outer: InodeId) -> DedupResult<()> {
        self.ensure_writable()?;
        let inner = self.inode(candidate)?;
        let outer = self.inode(intended_outer)?;
        if inner.is_inner() {
            if inner.is_dying() {
                return Err(DedupError::Busy { ino: candidate });
            }
            return Ok(());
        }
        self.check_designate(&inner, &outer)?;
        let state = inner
            .share
            .try_read()
            .map_err(|_| DedupError::Busy { ino: candidate })?;
        if !state.is_independent() {
            return Err(DedupError::Incompatible {
                ino: candidate,
                reason: "file is itself attached to an inner object",
            });
        }
        self.writeback_inode(&inner)?;
        self.store().flush()?;
        {
            let _txn = self.begin_txn();
            if !inner.flags().data_frozen {
                return Err(DedupError::NotFrozen { ino: candidate });
            }
            inner.set_inner(true);
        }
        info!(inner = %candidate, outer = %intended_outer, "Designated inner object");
        Ok(())
    }

    /// Turns an unreferenced inner object back into a plain file.
    pub fn undesignate_inner(&self, ino: InodeId) -> DedupResult<()> {
        self.ensure_writable()?;
        let inner = self.inode(ino)?;
        if !inner.is_inner() {
            return Ok(());
        }
        let _txn = self.begin_txn();
        if inner.link_count() > 0 || inner.is_dying() {
            return Err(DedupError::Busy { ino });
        }
        inner.set_inner(false);
        debug!(%ino, "Inner object reverted to a plain file");
        Ok(())
    }

    /// Attaches `outer` to `inner` and moves it to `Establishing`. Returns the
    /// sequence number of the ledger entry protecting the attach.
    pub(crate) fn attach(
        &self,
        outer: &Inode,
        state: &mut ShareState,
        inner: &Arc<Inode>,
        fresh_inner: bool,
    ) -> DedupResult<u64> {
        let _txn = self.begin_txn();
        if inner.is_dying() {
            return Err(DedupError::Busy { ino: inner.id() });
        }
        if !inner.flags().data_frozen {
            return Err(DedupError::NotFrozen { ino: inner.id() });
        }
        self.faults().check(FaultPoint::LedgerAdd)?;
        let seq = self.ledger().add(OrphanIntent::Establish {
            outer: outer.id(),
            inner: inner.id(),
            fresh_inner,
        })?;
        if let Err(e) = self.faults().check(FaultPoint::AttachCommit) {
            if !e.is_crash() {
                self.ledger().remove(seq);
            }
            return Err(e);
        }
        if fresh_inner {
            inner.set_inner(true);
        }
        let links = inner.inc_link();
        *state = ShareState::Establishing {
            inner: InnerLink::new(inner),
        };
        debug!(outer = %outer.id(), inner = %inner.id(), links, seq, "Attached");
        Ok(seq)
    }

    /// Detaches `outer` from its inner object and returns it to
    /// `Independent`. Dropping the last link either queues the inner for
    /// deletion or reverts it, per `last`.
    pub(crate) fn detach(
        &self,
        outer: &Inode,
        state: &mut ShareState,
        last: LastLink,
    ) -> DedupResult<Detached> {
        let link = state
            .inner()
            .cloned()
            .ok_or_else(|| DedupError::other(format!("{} is not attached", outer.id())))?;
        let inner = link.upgrade().ok_or(DedupError::MissingInner {
            outer: outer.id(),
            inner: link.id(),
        })?;

        let _txn = self.begin_txn();
        self.faults().check(FaultPoint::Detach)?;
        let remaining = inner.dec_link().ok_or_else(|| {
            DedupError::other(format!("link count of inner {} is already zero", inner.id()))
        })?;
        *state = ShareState::Independent;

        let mut release_seq = None;
        if remaining == 0 {
            match last {
                LastLink::Revert => inner.set_inner(false),
                LastLink::Delete => {
                    inner.set_dying(true);
                    match self.ledger().add(OrphanIntent::ReleaseInner { inner: inner.id() }) {
                        Ok(seq) => release_seq = Some(seq),
                        Err(e) => self.mark_needs_fsck(format!(
                            "cannot record release of inner {}: {}",
                            inner.id(),
                            e
                        )),
                    }
                }
            }
        }
        debug!(outer = %outer.id(), inner = %inner.id(), remaining, "Detached");
        Ok(Detached {
            inner,
            remaining,
            release_seq,
        })
    }

    /// Deletes an inner object whose last link was dropped, once its readers
    /// drain. If they do not drain in time the ledger entry stays behind for
    /// [`Volume::reap_pending`].
    pub(crate) async fn reap_inner(&self, detached: Detached) {
        let inner = detached.inner;
        if detached.remaining > 0 || !inner.is_dying() {
            return;
        }
        let timeout = self.config().dedup.drain_timeout();
        if let Err(e) = inner.drain(timeout, &CancellationToken::new()).await {
            warn!(inner = %inner.id(), error = %e, "Inner object still in use, deletion deferred");
            return;
        }
        self.delete_inode(&inner);
        if let Some(seq) = detached.release_seq {
            self.ledger().remove(seq);
        }
        info!(inner = %inner.id(), "Released inner object");
    }

    /// Retries deletion of inner objects whose release is still pending in
    /// the ledger. Returns how many were deleted.
    pub async fn reap_pending(&self) -> usize {
        let mut reaped = 0;
        for entry in self.ledger().entries() {
            let OrphanIntent::ReleaseInner { inner } = entry.intent else {
                continue;
            };
            let Ok(inode) = self.inode(inner) else {
                self.ledger().remove(entry.seq);
                continue;
            };
            if inode.link_count() > 0 {
                continue;
            }
            let before = self.contains(inner);
            self.reap_inner(Detached {
                inner: inode,
                remaining: 0,
                release_seq: Some(entry.seq),
            })
            .await;
            if before && !self.contains(inner) {
                reaped += 1;
            }
        }
        reaped
    }

    /// Returns a counted handle on the inner object of `outer`, or `None`
    /// when `outer` is not attached or its inner is being deleted.
    pub async fn get_inner(&self, outer: InodeId) -> DedupResult<Option<InnerRef>> {
        let outer = self.inode(outer)?;
        let state = outer.share.read().await;
        let Some(inner) = state.inner().and_then(InnerLink::upgrade) else {
            return Ok(None);
        };
        let guard = InodeGuard::reader(inner);
        if guard.inode().is_dying() {
            return Ok(None);
        }
        Ok(Some(InnerRef { guard }))
    }

    /// Releases a handle obtained from [`Volume::get_inner`].
    pub fn release_inner(&self, handle: InnerRef) {
        handle.release();
    }

    /// Reports the sharing state of `ino`. Files in the middle of a
    /// transition report as shared.
    pub async fn query_sharing_state(&self, ino: InodeId) -> DedupResult<SharingState> {
        let inode = self.inode(ino)?;
        if inode.is_inner() {
            return Ok(SharingState::Inner {
                link_count: inode.link_count(),
            });
        }
        let state = inode.share.read().await;
        Ok(match state.inner() {
            None => SharingState::NotShared,
            Some(link) => SharingState::Shared {
                inner: link.id(),
                link_count: link.upgrade().map_or(0, |i| i.link_count()),
            },
        })
    }
}

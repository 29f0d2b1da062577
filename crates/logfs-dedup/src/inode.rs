//! File objects and their sharing state.
//!
//! Every file is an [`Inode`]. An inode acting as an outer object records its
//! inner object in [`ShareState`]; an inode acting as an inner object has its
//! inner marker set and carries the link count. The `share` lock is the
//! per-outer transition lock: readers hold it shared only long enough to pick
//! a data source and register with that source's reader gate, transitions
//! hold it exclusively only while flipping state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DedupError, DedupResult};
use crate::page::PageCache;
use crate::sentinel::BlockMap;
use crate::types::{EncryptionPolicy, Epoch, FileSpec, FileType, InodeId};

/// Typed weak handle from an outer object to its inner object.
/// Upgrading fails once the inner has been deleted.
#[derive(Debug, Clone)]
pub struct InnerLink {
    id: InodeId,
    obj: Weak<Inode>,
}

impl InnerLink {
    /// Creates a link to `inner`.
    pub fn new(inner: &Arc<Inode>) -> Self {
        Self {
            id: inner.id(),
            obj: Arc::downgrade(inner),
        }
    }

    /// Id of the inner object.
    pub fn id(&self) -> InodeId {
        self.id
    }

    /// Strong reference to the inner object, if it still exists.
    pub fn upgrade(&self) -> Option<Arc<Inode>> {
        self.obj.upgrade()
    }
}

/// Sharing state of a file. Replaces the shared / sharing-in-progress /
/// revoking flag combination.
#[derive(Debug, Clone, Default)]
pub enum ShareState {
    /// Owns its data privately.
    #[default]
    Independent,
    /// Attached; sentinels not yet committed.
    Establishing {
        /// Inner object being attached.
        inner: InnerLink,
    },
    /// Content is delegated to the inner object.
    Shared {
        /// Inner object holding the content.
        inner: InnerLink,
    },
    /// Content is being copied back into private blocks.
    Revoking {
        /// Inner object being detached.
        inner: InnerLink,
    },
}

impl ShareState {
    /// The inner object this file is attached to, in any attached state.
    pub fn inner(&self) -> Option<&InnerLink> {
        match self {
            ShareState::Independent => None,
            ShareState::Establishing { inner }
            | ShareState::Shared { inner }
            | ShareState::Revoking { inner } => Some(inner),
        }
    }

    /// Returns true for `Independent`.
    pub fn is_independent(&self) -> bool {
        matches!(self, ShareState::Independent)
    }

    /// Returns true while a transition owns the file.
    pub fn in_transition(&self) -> bool {
        matches!(self, ShareState::Establishing { .. } | ShareState::Revoking { .. })
    }

    /// Short state name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ShareState::Independent => "independent",
            ShareState::Establishing { .. } => "establishing",
            ShareState::Shared { .. } => "shared",
            ShareState::Revoking { .. } => "revoking",
        }
    }
}

/// Per-file attribute flags orthogonal to sharing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileFlags {
    /// Data may not change.
    pub data_frozen: bool,
    /// Metadata may not change.
    pub meta_frozen: bool,
    /// Block addresses are pinned in place.
    pub pinned: bool,
    /// An atomic-write session is open.
    pub atomic_write: bool,
    /// Compression enabled.
    pub compressed: bool,
}

/// Counts in-flight readers and direct I/O against one file.
#[derive(Debug, Default)]
pub struct ReaderGate {
    readers: AtomicU32,
    direct_io: AtomicU32,
    idle: Notify,
}

impl ReaderGate {
    fn enter(&self, direct: bool) {
        self.counter(direct).fetch_add(1, Ordering::AcqRel);
    }

    fn exit(&self, direct: bool) {
        // a remount may have reset the counter under a live guard
        let prev = self
            .counter(direct)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev == Ok(1) {
            self.idle.notify_waiters();
        }
    }

    fn counter(&self, direct: bool) -> &AtomicU32 {
        if direct {
            &self.direct_io
        } else {
            &self.readers
        }
    }

    /// In-flight `(readers, direct I/O)` counts.
    pub fn in_flight(&self) -> (u32, u32) {
        (
            self.readers.load(Ordering::Acquire),
            self.direct_io.load(Ordering::Acquire),
        )
    }

    /// Returns true when nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.in_flight() == (0, 0)
    }

    fn reset(&self) {
        self.readers.store(0, Ordering::Release);
        self.direct_io.store(0, Ordering::Release);
    }

    async fn drain(
        &self,
        ino: InodeId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DedupResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(DedupError::Cancelled { ino }),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(DedupError::DrainTimeout { ino })
                }
            }
        }
    }
}

/// Registration with an inode's reader gate; leaves the gate on drop.
#[derive(Debug)]
pub struct InodeGuard {
    inode: Arc<Inode>,
    direct: bool,
}

impl InodeGuard {
    pub(crate) fn reader(inode: Arc<Inode>) -> Self {
        inode.gate.enter(false);
        Self { inode, direct: false }
    }

    pub(crate) fn direct_io(inode: Arc<Inode>) -> Self {
        inode.gate.enter(true);
        Self { inode, direct: true }
    }

    /// The guarded inode.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }
}

impl Drop for InodeGuard {
    fn drop(&mut self) {
        self.inode.gate.exit(self.direct);
    }
}

/// A file object.
#[derive(Debug)]
pub struct Inode {
    id: InodeId,
    file_type: FileType,
    encryption: Option<EncryptionPolicy>,
    dir_policy: Option<EncryptionPolicy>,
    size: AtomicU64,
    data_version: AtomicU64,
    flags: Mutex<FileFlags>,
    /// Block map; mutated only under the volume's metadata-transaction lock.
    pub(crate) map: Mutex<BlockMap>,
    pub(crate) cache: PageCache,
    /// Per-outer transition lock.
    pub(crate) share: RwLock<ShareState>,
    is_inner: AtomicBool,
    link_count: AtomicU32,
    dying: AtomicBool,
    gate: ReaderGate,
    // 0 = never stamped
    stamp: AtomicU64,
}

impl Inode {
    pub(crate) fn new(id: InodeId, spec: &FileSpec) -> Arc<Self> {
        Arc::new(Self {
            id,
            file_type: spec.file_type,
            encryption: spec.encryption,
            dir_policy: spec.dir_policy,
            size: AtomicU64::new(0),
            data_version: AtomicU64::new(0),
            flags: Mutex::new(FileFlags::default()),
            map: Mutex::new(BlockMap::new()),
            cache: PageCache::new(),
            share: RwLock::new(ShareState::Independent),
            is_inner: AtomicBool::new(false),
            link_count: AtomicU32::new(0),
            dying: AtomicBool::new(false),
            gate: ReaderGate::default(),
            stamp: AtomicU64::new(0),
        })
    }

    /// Inode id.
    pub fn id(&self) -> InodeId {
        self.id
    }

    /// Kind of file object.
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Policy the contents are encrypted under.
    pub fn encryption(&self) -> Option<&EncryptionPolicy> {
        self.encryption.as_ref()
    }

    /// Policy of the containing directory.
    pub fn dir_policy(&self) -> Option<&EncryptionPolicy> {
        self.dir_policy.as_ref()
    }

    /// Logical size in bytes. Accurate regardless of sharing.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// Grows the size to `end` if it is smaller.
    pub(crate) fn extend_size(&self, end: u64) {
        self.size.fetch_max(end, Ordering::AcqRel);
    }

    /// Bumped by every data mutation.
    pub fn data_version(&self) -> u64 {
        self.data_version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_data_version(&self) {
        self.data_version.fetch_add(1, Ordering::AcqRel);
    }

    /// Current attribute flags.
    pub fn flags(&self) -> FileFlags {
        *self.flags.lock()
    }

    pub(crate) fn update_flags(&self, f: impl FnOnce(&mut FileFlags)) {
        f(&mut self.flags.lock());
    }

    /// Returns true if this inode is an inner object.
    pub fn is_inner(&self) -> bool {
        self.is_inner.load(Ordering::Acquire)
    }

    pub(crate) fn set_inner(&self, inner: bool) {
        self.is_inner.store(inner, Ordering::Release);
    }

    /// Number of outer objects referencing this inner object.
    pub fn link_count(&self) -> u32 {
        self.link_count.load(Ordering::Acquire)
    }

    pub(crate) fn inc_link(&self) -> u32 {
        self.link_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the link count; `None` if it was already zero.
    pub(crate) fn dec_link(&self) -> Option<u32> {
        self.link_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    /// Returns true once the inner object is queued for deletion.
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    pub(crate) fn set_dying(&self, dying: bool) {
        self.dying.store(dying, Ordering::Release);
    }

    /// In-flight `(readers, direct I/O)` counts.
    pub fn in_flight(&self) -> (u32, u32) {
        self.gate.in_flight()
    }

    pub(crate) async fn drain(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DedupResult<()> {
        self.gate.drain(self.id, timeout, cancel).await
    }

    pub(crate) fn reset_gate(&self) {
        self.gate.reset();
    }

    /// Epoch of the last completed sharing transition.
    pub fn stamp(&self) -> Option<Epoch> {
        match self.stamp.load(Ordering::Acquire) {
            0 => None,
            e => Some(Epoch::new(e)),
        }
    }

    pub(crate) fn set_stamp(&self, epoch: Epoch) {
        self.stamp.store(epoch.as_u64(), Ordering::Release);
    }

    /// Number of private physical blocks.
    pub fn physical_blocks(&self) -> u64 {
        self.map.lock().physical_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inode(id: u64) -> Arc<Inode> {
        Inode::new(InodeId::new(id), &FileSpec::regular())
    }

    #[test]
    fn test_link_count_never_underflows() {
        let ino = inode(1);
        assert_eq!(ino.dec_link(), None);
        assert_eq!(ino.inc_link(), 1);
        assert_eq!(ino.inc_link(), 2);
        assert_eq!(ino.dec_link(), Some(1));
        assert_eq!(ino.dec_link(), Some(0));
        assert_eq!(ino.dec_link(), None);
        assert_eq!(ino.link_count(), 0);
    }

    #[test]
    fn test_inner_link_dies_with_inode() {
        let inner = inode(2);
        let link = InnerLink::new(&inner);
        assert_eq!(link.id(), InodeId::new(2));
        assert!(link.upgrade().is_some());
        drop(inner);
        assert!(link.upgrade().is_none());
    }

    #[test]
    fn test_share_state_accessors() {
        let inner = inode(3);
        let state = ShareState::Revoking { inner: InnerLink::new(&inner) };
        assert_eq!(state.inner().map(|l| l.id()), Some(InodeId::new(3)));
        assert!(state.in_transition());
        assert!(!state.is_independent());
        assert_eq!(state.name(), "revoking");
        assert!(ShareState::default().is_independent());
    }

    #[test]
    fn test_guard_counts() {
        let ino = inode(4);
        let r = InodeGuard::reader(ino.clone());
        let d = InodeGuard::direct_io(ino.clone());
        assert_eq!(ino.in_flight(), (1, 1));
        drop(r);
        drop(d);
        assert_eq!(ino.in_flight(), (0, 0));
    }

    #[test]
    fn test_reset_gate_under_live_guard() {
        let ino = inode(9);
        let guard = InodeGuard::reader(ino.clone());
        ino.reset_gate();
        drop(guard);
        assert_eq!(ino.in_flight(), (0, 0));
    }

    #[test]
    fn test_stamp() {
        let ino = inode(5);
        assert_eq!(ino.stamp(), None);
        ino.set_stamp(Epoch::new(9));
        assert_eq!(ino.stamp(), Some(Epoch::new(9)));
    }

    #[tokio::test]
    async fn test_drain_waits_for_reader() {
        let ino = inode(6);
        let guard = InodeGuard::reader(ino.clone());
        let waiter = {
            let ino = ino.clone();
            tokio::spawn(async move {
                ino.drain(Duration::from_secs(5), &CancellationToken::new()).await
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_drain_cancelled() {
        let ino = inode(7);
        let _guard = InodeGuard::reader(ino.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ino.drain(Duration::from_secs(5), &cancel).await.unwrap_err();
        assert!(matches!(err, DedupError::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let ino = inode(8);
        let _guard = InodeGuard::direct_io(ino.clone());
        let err = ino
            .drain(Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::DrainTimeout { .. }));
    }
}

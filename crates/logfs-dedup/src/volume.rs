//! The volume: shared context passed to every sharing operation.
//!
//! A [`Volume`] owns the inode table, the block store, the orphan ledger, the
//! checkpoint epoch and the two volume-wide locks:
//! - the metadata-transaction lock, held only for block-map and ledger
//!   updates and never across an await;
//! - the GC barrier, taken in write mode by transitions for their data phase
//!   and in read mode by block migration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, trace};

use crate::config::VolumeConfig;
use crate::device::{BlockStore, MemBlockStore};
use crate::error::{DedupError, DedupResult};
use crate::fault::{FaultInjector, FaultPoint};
use crate::inode::Inode;
use crate::ledger::OrphanLedger;
use crate::page::Page;
use crate::sentinel::BlockEntry;
use crate::types::{Epoch, FileSpec, InodeId, PAGE_SIZE};

/// A mounted volume.
pub struct Volume {
    config: VolumeConfig,
    inodes: DashMap<InodeId, Arc<Inode>>,
    next_ino: AtomicU64,
    store: Arc<dyn BlockStore>,
    ledger: OrphanLedger,
    txn: Mutex<()>,
    pub(crate) gc_barrier: tokio::sync::RwLock<()>,
    epoch: AtomicU64,
    needs_fsck: Mutex<Option<String>>,
    faults: FaultInjector,
    pub(crate) rng: Mutex<StdRng>,
}

impl Volume {
    /// Creates a volume backed by an in-memory block store sized from `config`.
    pub fn new(config: VolumeConfig) -> DedupResult<Self> {
        let store = Arc::new(MemBlockStore::new(config.total_blocks));
        Self::with_store(config, store)
    }

    /// Creates a volume on top of an existing block store.
    pub fn with_store(config: VolumeConfig, store: Arc<dyn BlockStore>) -> DedupResult<Self> {
        config.validate()?;
        let rng = match config.dedup.sample_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        info!(
            "Creating volume '{}' with {} blocks, {} sample pages",
            config.name, config.total_blocks, config.dedup.sample_pages
        );
        Ok(Self {
            ledger: OrphanLedger::new(config.dedup.orphan_capacity),
            config,
            inodes: DashMap::new(),
            next_ino: AtomicU64::new(1),
            store,
            txn: Mutex::new(()),
            gc_barrier: tokio::sync::RwLock::new(()),
            epoch: AtomicU64::new(Epoch::INITIAL.as_u64()),
            needs_fsck: Mutex::new(None),
            faults: FaultInjector::new(),
            rng: Mutex::new(rng),
        })
    }

    /// Volume configuration.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Fault-injection registry for this volume.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// The orphan ledger.
    pub fn ledger(&self) -> &OrphanLedger {
        &self.ledger
    }

    /// The block store.
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Looks up an inode.
    pub fn inode(&self, ino: InodeId) -> DedupResult<Arc<Inode>> {
        self.inodes
            .get(&ino)
            .map(|entry| entry.value().clone())
            .ok_or(DedupError::NotFound(ino))
    }

    /// Returns true if `ino` exists.
    pub fn contains(&self, ino: InodeId) -> bool {
        self.inodes.contains_key(&ino)
    }

    /// Number of live inodes, inner objects included.
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    pub(crate) fn all_inodes(&self) -> Vec<Arc<Inode>> {
        let mut all: Vec<Arc<Inode>> = self.inodes.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|i| i.id());
        all
    }

    /// Creates an empty file.
    pub fn create_file(&self, spec: FileSpec) -> DedupResult<InodeId> {
        self.ensure_writable()?;
        let ino = InodeId::new(self.next_ino.fetch_add(1, Ordering::Relaxed));
        self.inodes.insert(ino, Inode::new(ino, &spec));
        debug!(%ino, file_type = ?spec.file_type, "Created file");
        Ok(ino)
    }

    /// Current checkpoint epoch.
    pub fn current_epoch(&self) -> Epoch {
        Epoch::new(self.epoch.load(Ordering::Acquire))
    }

    pub(crate) fn advance_epoch(&self) -> Epoch {
        Epoch::new(self.epoch.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Takes the metadata-transaction lock.
    pub(crate) fn begin_txn(&self) -> MutexGuard<'_, ()> {
        self.txn.lock()
    }

    /// Reason the volume was flagged for an offline check, if it was.
    pub fn needs_fsck(&self) -> Option<String> {
        self.needs_fsck.lock().clone()
    }

    pub(crate) fn mark_needs_fsck(&self, reason: String) {
        error!(volume = %self.config.name, %reason, "Volume marked as needing fsck");
        let mut flag = self.needs_fsck.lock();
        if flag.is_none() {
            *flag = Some(reason);
        }
    }

    /// Clears the needs-fsck flag after an offline check repaired the volume.
    pub fn clear_needs_fsck(&self) {
        *self.needs_fsck.lock() = None;
    }

    pub(crate) fn ensure_writable(&self) -> DedupResult<()> {
        match self.needs_fsck() {
            Some(reason) => Err(DedupError::NeedsFsck { reason }),
            None => Ok(()),
        }
    }

    /// Runs a fault point that sits after a point of no return. A crash still
    /// aborts; any other failure escalates to needs-fsck and returns false so
    /// the caller skips that step and finishes the transition.
    pub(crate) fn post_commit(&self, point: FaultPoint, ino: InodeId) -> DedupResult<bool> {
        match self.faults.check(point) {
            Err(e) if e.is_crash() => Err(e),
            Err(e) => {
                self.mark_needs_fsck(format!("{} failed on {} after commit: {}", point, ino, e));
                Ok(false)
            }
            Ok(()) => Ok(true),
        }
    }

    /// Returns the cached page at `index`, reading it from the block map on a miss.
    pub(crate) fn load_page(&self, inode: &Arc<Inode>, index: u64) -> DedupResult<Arc<Page>> {
        if let Some(page) = inode.cache.lookup(index) {
            return Ok(page);
        }
        let entry = inode.map.lock().get(index);
        let data = match entry {
            BlockEntry::Hole => vec![0u8; PAGE_SIZE],
            BlockEntry::Addr(addr) => self.store.read(addr)?,
            BlockEntry::Shared => {
                return Err(DedupError::other(format!(
                    "page {} of {} is held by its inner object",
                    index,
                    inode.id()
                )))
            }
        };
        Ok(inode.cache.insert_if_absent(Page::new(inode.id(), index, data, false)))
    }

    /// Writes dirty `pages` of `inode` to freshly allocated blocks. Each
    /// block's map entry is switched under the metadata-transaction lock and
    /// the block it replaces is invalidated. `alloc_fault` runs before every
    /// allocation.
    pub(crate) fn writeback_pages(
        &self,
        inode: &Inode,
        pages: &[Arc<Page>],
        alloc_fault: Option<FaultPoint>,
    ) -> DedupResult<usize> {
        let mut written = 0;
        for page in pages {
            let mut state = page.lock();
            if !state.dirty || state.evicted {
                continue;
            }
            if let Some(point) = alloc_fault {
                self.faults.check(point)?;
            }
            let addr = self.store.allocate()?;
            if let Err(e) = self.store.write(addr, &state.data) {
                self.store.invalidate(addr);
                return Err(e);
            }
            let old = {
                let _txn = self.begin_txn();
                inode.map.lock().set(page.index(), BlockEntry::Addr(addr))
            };
            if let Some(old) = old.private_addr() {
                self.store.invalidate(old);
            }
            state.dirty = false;
            written += 1;
        }
        trace!(ino = %inode.id(), written, "Wrote back pages");
        Ok(written)
    }

    /// Writes back every dirty page of `inode`.
    pub(crate) fn writeback_inode(&self, inode: &Inode) -> DedupResult<usize> {
        let dirty = inode.cache.dirty_pages();
        self.writeback_pages(inode, &dirty, None)
    }

    /// Deletes an inode outright: invalidates its private blocks and drops it
    /// from the table.
    pub(crate) fn delete_inode(&self, inode: &Inode) {
        let freed: Vec<u32> = {
            let _txn = self.begin_txn();
            let mut map = inode.map.lock();
            let freed = map.private_blocks().map(|(_, addr)| addr).collect();
            *map = Default::default();
            self.inodes.remove(&inode.id());
            freed
        };
        inode.cache.evict_all();
        for addr in &freed {
            self.store.invalidate(*addr);
        }
        info!(ino = %inode.id(), blocks = freed.len(), "Deleted inode");
    }
}

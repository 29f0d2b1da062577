//! Block store abstraction consumed by the dedup layer.
//!
//! The layer only needs allocate/invalidate from the allocator and
//! read/write/flush from the device. [`MemBlockStore`] is the in-memory
//! implementation used by volumes and tests.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{DedupError, DedupResult};
use crate::types::PAGE_SIZE;

/// Trait for the block allocator plus device.
/// Implementations can be a real log-structured allocator or in-memory for testing.
pub trait BlockStore: Send + Sync {
    /// Allocates a fresh block.
    fn allocate(&self) -> DedupResult<u32>;

    /// Marks a block as garbage so the cleaner can reuse it.
    fn invalidate(&self, addr: u32);

    /// Reads one block. Always returns [`PAGE_SIZE`] bytes.
    fn read(&self, addr: u32) -> DedupResult<Vec<u8>>;

    /// Writes one block. `data` must be [`PAGE_SIZE`] bytes.
    fn write(&self, addr: u32, data: &[u8]) -> DedupResult<()>;

    /// Waits until every completed write is on stable storage.
    fn flush(&self) -> DedupResult<()>;

    /// Number of blocks currently free.
    fn free_blocks(&self) -> u64;
}

/// Counters kept by [`MemBlockStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockStoreStats {
    /// Blocks handed out
    pub allocations: u64,
    /// Blocks invalidated
    pub invalidations: u64,
    /// Blocks read
    pub reads: u64,
    /// Blocks written
    pub writes: u64,
    /// Flushes issued
    pub flushes: u64,
}

struct MemStoreInner {
    free: BTreeSet<u32>,
    blocks: HashMap<u32, Vec<u8>>,
    stats: BlockStoreStats,
}

/// In-memory block store. Addresses run from 1 to `total_blocks`; 0 is
/// reserved for holes. Thread-safe via internal mutex.
pub struct MemBlockStore {
    total_blocks: u64,
    inner: Mutex<MemStoreInner>,
}

impl MemBlockStore {
    /// Creates a store with `total_blocks` free blocks.
    pub fn new(total_blocks: u64) -> Self {
        let free = (1..=total_blocks as u32).collect();
        debug!(total_blocks, "Created in-memory block store");
        Self {
            total_blocks,
            inner: Mutex::new(MemStoreInner {
                free,
                blocks: HashMap::new(),
                stats: BlockStoreStats::default(),
            }),
        }
    }

    /// Total capacity in blocks.
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Number of blocks currently allocated.
    pub fn used_blocks(&self) -> u64 {
        self.total_blocks - self.free_blocks()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BlockStoreStats {
        self.inner.lock().stats.clone()
    }

    fn check_addr(&self, addr: u32) -> DedupResult<()> {
        if addr == 0 || u64::from(addr) > self.total_blocks {
            return Err(DedupError::other(format!("block address {} out of range", addr)));
        }
        Ok(())
    }
}

impl BlockStore for MemBlockStore {
    fn allocate(&self) -> DedupResult<u32> {
        let mut inner = self.inner.lock();
        let addr = inner.free.pop_first().ok_or(DedupError::OutOfSpace)?;
        inner.stats.allocations += 1;
        trace!(addr, "Allocated block");
        Ok(addr)
    }

    fn invalidate(&self, addr: u32) {
        if self.check_addr(addr).is_err() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.blocks.remove(&addr);
        if inner.free.insert(addr) {
            inner.stats.invalidations += 1;
            trace!(addr, "Invalidated block");
        }
    }

    fn read(&self, addr: u32) -> DedupResult<Vec<u8>> {
        self.check_addr(addr)?;
        let mut inner = self.inner.lock();
        inner.stats.reads += 1;
        if inner.free.contains(&addr) {
            return Err(DedupError::other(format!("read of free block {}", addr)));
        }
        Ok(inner
            .blocks
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| vec![0u8; PAGE_SIZE]))
    }

    fn write(&self, addr: u32, data: &[u8]) -> DedupResult<()> {
        self.check_addr(addr)?;
        if data.len() != PAGE_SIZE {
            return Err(DedupError::other(format!(
                "write of {} bytes to block {}, expected {}",
                data.len(),
                addr,
                PAGE_SIZE
            )));
        }
        let mut inner = self.inner.lock();
        if inner.free.contains(&addr) {
            return Err(DedupError::other(format!("write to free block {}", addr)));
        }
        inner.blocks.insert(addr, data.to_vec());
        inner.stats.writes += 1;
        Ok(())
    }

    fn flush(&self) -> DedupResult<()> {
        self.inner.lock().stats.flushes += 1;
        Ok(())
    }

    fn free_blocks(&self) -> u64 {
        self.inner.lock().free.len() as u64
    }
}

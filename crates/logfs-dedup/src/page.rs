//! Minimal per-file page cache.
//!
//! Lock order: a page's own mutex may be taken while no cache mutex is held,
//! and the cache mutex is never held while locking a page.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::types::InodeId;

/// Mutable part of a cached page.
#[derive(Debug)]
pub struct PageState {
    /// Page contents, always `PAGE_SIZE` bytes.
    pub data: Vec<u8>,
    /// Newer than what the block map points at.
    pub dirty: bool,
    /// Dropped from its cache; contents must not be trusted.
    pub evicted: bool,
}

/// A cached page of one file.
#[derive(Debug)]
pub struct Page {
    owner: InodeId,
    index: u64,
    state: Mutex<PageState>,
}

impl Page {
    /// Creates a page owned by `owner` at logical `index`.
    pub fn new(owner: InodeId, index: u64, data: Vec<u8>, dirty: bool) -> Arc<Self> {
        Arc::new(Self {
            owner,
            index,
            state: Mutex::new(PageState {
                data,
                dirty,
                evicted: false,
            }),
        })
    }

    /// File this page belongs to.
    pub fn owner(&self) -> InodeId {
        self.owner
    }

    /// Logical page index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Locks the page.
    pub fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }
}

/// Pages of one file keyed by logical index.
#[derive(Debug, Default)]
pub struct PageCache {
    pages: Mutex<BTreeMap<u64, Arc<Page>>>,
}

impl PageCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached page at `index`.
    pub fn lookup(&self, index: u64) -> Option<Arc<Page>> {
        self.pages.lock().get(&index).cloned()
    }

    /// Returns true if `page` is the page currently cached at its index.
    pub fn is_current(&self, page: &Arc<Page>) -> bool {
        self.pages
            .lock()
            .get(&page.index())
            .is_some_and(|cur| Arc::ptr_eq(cur, page))
    }

    /// Inserts `page` unless another page is already cached at its index;
    /// returns whichever page ends up cached.
    pub fn insert_if_absent(&self, page: Arc<Page>) -> Arc<Page> {
        self.pages.lock().entry(page.index()).or_insert(page).clone()
    }

    /// Inserts `page`, evicting any page it replaces.
    pub fn replace(&self, page: Arc<Page>) {
        let old = self.pages.lock().insert(page.index(), page);
        if let Some(old) = old {
            old.lock().evicted = true;
        }
    }

    /// Evicts the page at `index`.
    pub fn evict(&self, index: u64) {
        let old = self.pages.lock().remove(&index);
        if let Some(old) = old {
            old.lock().evicted = true;
        }
    }

    /// Evicts every page at or beyond `first`; returns how many were dirty.
    pub fn evict_from(&self, first: u64) -> usize {
        let tail = self.pages.lock().split_off(&first);
        Self::mark_evicted(tail.into_values())
    }

    /// Evicts every page; returns how many were dirty.
    pub fn evict_all(&self) -> usize {
        let all = std::mem::take(&mut *self.pages.lock());
        Self::mark_evicted(all.into_values())
    }

    /// Dirty pages in ascending index order.
    pub fn dirty_pages(&self) -> Vec<Arc<Page>> {
        let pages: Vec<Arc<Page>> = self.pages.lock().values().cloned().collect();
        pages.into_iter().filter(|p| p.lock().dirty).collect()
    }

    /// Returns true if any page is dirty.
    pub fn has_dirty(&self) -> bool {
        !self.dirty_pages().is_empty()
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    /// Is the cache empty?
    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    fn mark_evicted(pages: impl Iterator<Item = Arc<Page>>) -> usize {
        let mut dirty = 0;
        for page in pages {
            let mut state = page.lock();
            if state.dirty {
                dirty += 1;
            }
            state.evicted = true;
        }
        dirty
    }
}

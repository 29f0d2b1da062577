//! Block-map entries and the shared-content sentinel.
//!
//! On disk a block-map entry is a raw `u32` block address. Address `0` is a
//! hole and the top of the address space is reserved for markers. The marker
//! [`SHARED_ADDR`] means "no private storage for this page; read it through
//! the inner object". A sentinel never coexists with a private block for the
//! same page: installing one frees the block it replaces.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DedupResult;

/// Raw address of a hole.
pub const NULL_ADDR: u32 = 0;

/// First raw address reserved for markers. Real blocks live below it.
pub const RESERVED_ADDR_START: u32 = 0xFFFF_FFF0;

/// Raw address marking a page whose content lives in the inner object.
pub const SHARED_ADDR: u32 = 0xFFFF_FFFD;

/// Decoded block-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockEntry {
    /// No data; reads return zeros.
    Hole,
    /// Privately owned physical block.
    Addr(u32),
    /// Content lives in the inner object.
    Shared,
}

impl BlockEntry {
    /// Encodes to the raw on-disk address.
    pub fn to_raw(self) -> u32 {
        match self {
            BlockEntry::Hole => NULL_ADDR,
            BlockEntry::Addr(addr) => addr,
            BlockEntry::Shared => SHARED_ADDR,
        }
    }

    /// Decodes a raw address. Reserved values other than the sentinel are
    /// not valid block-map contents.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            NULL_ADDR => Some(BlockEntry::Hole),
            SHARED_ADDR => Some(BlockEntry::Shared),
            r if r >= RESERVED_ADDR_START => None,
            r => Some(BlockEntry::Addr(r)),
        }
    }

    /// Returns the private block address, if any.
    pub fn private_addr(self) -> Option<u32> {
        match self {
            BlockEntry::Addr(addr) => Some(addr),
            _ => None,
        }
    }
}

/// Per-file map from logical page index to raw block address.
/// Absent indices are holes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    entries: BTreeMap<u64, u32>,
}

impl BlockMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `index`.
    pub fn get(&self, index: u64) -> BlockEntry {
        self.entries
            .get(&index)
            .and_then(|raw| BlockEntry::from_raw(*raw))
            .unwrap_or(BlockEntry::Hole)
    }

    /// Sets the entry for `index`; returns the previous entry.
    pub fn set(&mut self, index: u64, entry: BlockEntry) -> BlockEntry {
        let prev = self.get(index);
        match entry {
            BlockEntry::Hole => {
                self.entries.remove(&index);
            }
            other => {
                self.entries.insert(index, other.to_raw());
            }
        }
        prev
    }

    /// Iterates over `(index, address)` for every private block.
    pub fn private_blocks(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.entries
            .iter()
            .filter_map(|(idx, raw)| BlockEntry::from_raw(*raw)?.private_addr().map(|a| (*idx, a)))
    }

    /// Number of private blocks.
    pub fn physical_count(&self) -> u64 {
        self.private_blocks().count() as u64
    }

    /// Returns true if any entry is the sentinel.
    pub fn has_sentinel(&self) -> bool {
        self.entries.values().any(|raw| *raw == SHARED_ADDR)
    }

    /// Indices currently holding the sentinel, ascending.
    pub fn sentinel_indices(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, raw)| **raw == SHARED_ADDR)
            .map(|(idx, _)| *idx)
            .collect()
    }

    /// Number of entries holding the sentinel.
    pub fn sentinel_count(&self) -> u64 {
        self.entries.values().filter(|raw| **raw == SHARED_ADDR).count() as u64
    }

    /// Drops every entry at or beyond `first_page`; returns the private
    /// blocks released.
    pub fn truncate(&mut self, first_page: u64) -> Vec<u32> {
        let tail = self.entries.split_off(&first_page);
        tail.values()
            .filter_map(|raw| BlockEntry::from_raw(*raw)?.private_addr())
            .collect()
    }

    /// Builds the shared view of this map over `pages` logical pages: every
    /// entry in range becomes the sentinel. `check` runs before each entry is
    /// rewritten and may abort the build; `self` is never modified, so an
    /// abort leaves nothing to undo. Returns the new map and the private
    /// blocks it no longer references.
    pub fn install_sentinels<F>(
        &self,
        pages: u64,
        mut check: F,
    ) -> DedupResult<(BlockMap, Vec<u32>)>
    where
        F: FnMut(u64) -> DedupResult<()>,
    {
        let mut shared = BlockMap::new();
        let mut freed = Vec::new();
        for index in 0..pages {
            check(index)?;
            if let Some(addr) = self.get(index).private_addr() {
                freed.push(addr);
            }
            shared.set(index, BlockEntry::Shared);
        }
        // entries past EOF cannot be reached once the file is shared
        freed.extend(
            self.entries
                .range(pages..)
                .filter_map(|(_, raw)| BlockEntry::from_raw(*raw)?.private_addr()),
        );
        Ok((shared, freed))
    }

    /// Replaces a sentinel at `index` with `entry`. Returns false if the
    /// entry was not a sentinel.
    pub fn remove_sentinel(&mut self, index: u64, entry: BlockEntry) -> bool {
        if self.get(index) != BlockEntry::Shared {
            return false;
        }
        self.set(index, entry);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DedupError;

    #[test]
    fn test_raw_codec() {
        assert_eq!(BlockEntry::from_raw(0), Some(BlockEntry::Hole));
        assert_eq!(BlockEntry::from_raw(SHARED_ADDR), Some(BlockEntry::Shared));
        assert_eq!(BlockEntry::from_raw(77), Some(BlockEntry::Addr(77)));
        assert_eq!(BlockEntry::from_raw(0xFFFF_FFFF), None);
        assert_eq!(BlockEntry::Shared.to_raw(), SHARED_ADDR);
        assert_eq!(BlockEntry::Hole.to_raw(), NULL_ADDR);
    }

    #[test]
    fn test_set_hole_removes_entry() {
        let mut map = BlockMap::new();
        map.set(3, BlockEntry::Addr(10));
        assert_eq!(map.set(3, BlockEntry::Hole), BlockEntry::Addr(10));
        assert_eq!(map, BlockMap::new());
    }

    #[test]
    fn test_install_sentinels_frees_private_blocks() {
        let mut map = BlockMap::new();
        map.set(0, BlockEntry::Addr(10));
        map.set(2, BlockEntry::Addr(12));
        map.set(9, BlockEntry::Addr(19));

        let (shared, mut freed) = map.install_sentinels(4, |_| Ok(())).unwrap();
        freed.sort_unstable();
        assert_eq!(freed, vec![10, 12, 19]);
        assert_eq!(shared.sentinel_count(), 4);
        assert_eq!(shared.physical_count(), 0);
        assert_eq!(map.physical_count(), 3);
    }

    #[test]
    fn test_install_sentinels_abort_leaves_source() {
        let mut map = BlockMap::new();
        map.set(0, BlockEntry::Addr(10));
        map.set(1, BlockEntry::Addr(11));
        let original = map.clone();

        let result = map.install_sentinels(2, |idx| {
            if idx == 1 {
                Err(DedupError::OutOfSpace)
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        assert_eq!(map, original);
    }

    #[test]
    fn test_remove_sentinel() {
        let (mut shared, _) = BlockMap::new().install_sentinels(3, |_| Ok(())).unwrap();
        assert!(shared.remove_sentinel(1, BlockEntry::Addr(40)));
        assert!(!shared.remove_sentinel(1, BlockEntry::Addr(41)));
        assert!(shared.remove_sentinel(2, BlockEntry::Hole));
        assert_eq!(shared.sentinel_indices(), vec![0]);
        assert_eq!(shared.get(1), BlockEntry::Addr(40));
        assert_eq!(shared.get(2), BlockEntry::Hole);
    }

    #[test]
    fn test_truncate_keeps_sentinels_below() {
        let mut map = BlockMap::new();
        map.set(0, BlockEntry::Addr(5));
        map.set(1, BlockEntry::Shared);
        map.set(4, BlockEntry::Addr(8));
        assert_eq!(map.truncate(2), vec![8]);
        assert_eq!(map.sentinel_indices(), vec![1]);
        assert_eq!(map.physical_count(), 1);
    }
}

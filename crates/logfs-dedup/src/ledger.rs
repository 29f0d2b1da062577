//! Orphan ledger: crash-durable record of in-flight link transitions.
//!
//! An entry is added before any reference-count mutation that a crash could
//! interrupt, and removed only once the mutation is durable. Remount recovery
//! walks the remaining entries in sequence order and finishes or rolls back
//! each one.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DedupError, DedupResult};
use crate::types::InodeId;

/// The transition an entry protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrphanIntent {
    /// `outer` is being attached to `inner`. `fresh_inner` means `inner` was
    /// designated by this same transition and reverts to a plain file if the
    /// attach is rolled back.
    Establish {
        /// The outer file.
        outer: InodeId,
        /// The inner object.
        inner: InodeId,
        /// Whether `inner` was designated by this transition.
        fresh_inner: bool,
    },
    /// `outer` is copying content back from `inner`.
    Revoke {
        /// The outer file.
        outer: InodeId,
        /// The inner object.
        inner: InodeId,
    },
    /// `inner` dropped to zero links and is waiting for deletion.
    ReleaseInner {
        /// The inner object.
        inner: InodeId,
    },
}

impl OrphanIntent {
    /// The inode the entry is filed under.
    pub fn ino(&self) -> InodeId {
        match self {
            OrphanIntent::Establish { outer, .. } | OrphanIntent::Revoke { outer, .. } => *outer,
            OrphanIntent::ReleaseInner { inner } => *inner,
        }
    }
}

impl fmt::Display for OrphanIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrphanIntent::Establish { outer, inner, .. } => {
                write!(f, "establish {} -> {}", outer, inner)
            }
            OrphanIntent::Revoke { outer, inner } => write!(f, "revoke {} -> {}", outer, inner),
            OrphanIntent::ReleaseInner { inner } => write!(f, "release inner {}", inner),
        }
    }
}

/// A single ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonically increasing sequence number.
    pub seq: u64,
    /// What is in flight.
    pub intent: OrphanIntent,
}

struct LedgerInner {
    entries: BTreeMap<u64, LedgerEntry>,
    next_seq: u64,
}

/// Capacity-limited orphan ledger. Thread-safe via internal mutex.
pub struct OrphanLedger {
    capacity: usize,
    inner: Mutex<LedgerInner>,
}

impl OrphanLedger {
    /// Creates an empty ledger with room for `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LedgerInner {
                entries: BTreeMap::new(),
                next_seq: 1,
            }),
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records `intent`; fails when the ledger is full.
    pub fn add(&self, intent: OrphanIntent) -> DedupResult<u64> {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= self.capacity {
            return Err(DedupError::LedgerFull {
                capacity: self.capacity,
            });
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(seq, LedgerEntry { seq, intent });
        debug!(seq, %intent, "Orphan ledger entry added");
        Ok(seq)
    }

    /// Removes entry `seq`; returns false if it was not present.
    pub fn remove(&self, seq: u64) -> bool {
        let removed = self.inner.lock().entries.remove(&seq);
        if let Some(entry) = &removed {
            debug!(seq, intent = %entry.intent, "Orphan ledger entry removed");
        }
        removed.is_some()
    }

    /// Oldest entry.
    pub fn first(&self) -> Option<LedgerEntry> {
        self.inner.lock().entries.values().next().cloned()
    }

    /// All entries in sequence order.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// Entries filed under `ino`.
    pub fn entries_for(&self, ino: InodeId) -> Vec<LedgerEntry> {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.intent.ino() == ino)
            .cloned()
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Is the ledger empty?
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revoke(outer: u64) -> OrphanIntent {
        OrphanIntent::Revoke {
            outer: InodeId::new(outer),
            inner: InodeId::new(100),
        }
    }

    #[test]
    fn test_add_remove() {
        let ledger = OrphanLedger::new(4);
        let seq = ledger.add(revoke(1)).unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger.remove(seq));
        assert!(!ledger.remove(seq));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_capacity() {
        let ledger = OrphanLedger::new(2);
        ledger.add(revoke(1)).unwrap();
        ledger.add(revoke(2)).unwrap();
        match ledger.add(revoke(3)) {
            Err(DedupError::LedgerFull { capacity }) => assert_eq!(capacity, 2),
            other => panic!("expected LedgerFull, got {:?}", other),
        }
    }

    #[test]
    fn test_sequence_order() {
        let ledger = OrphanLedger::new(8);
        let a = ledger.add(revoke(5)).unwrap();
        let b = ledger.add(OrphanIntent::ReleaseInner { inner: InodeId::new(100) }).unwrap();
        assert!(a < b);
        assert_eq!(ledger.first().unwrap().seq, a);
        let seqs: Vec<u64> = ledger.entries().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![a, b]);
    }

    #[test]
    fn test_entries_for() {
        let ledger = OrphanLedger::new(8);
        ledger.add(revoke(5)).unwrap();
        ledger.add(revoke(6)).unwrap();
        ledger.add(OrphanIntent::ReleaseInner { inner: InodeId::new(5) }).unwrap();
        assert_eq!(ledger.entries_for(InodeId::new(5)).len(), 2);
        assert_eq!(ledger.entries_for(InodeId::new(6)).len(), 1);
    }

    #[test]
    fn test_intent_display() {
        let intent = OrphanIntent::Establish {
            outer: InodeId::new(3),
            inner: InodeId::new(4),
            fresh_inner: true,
        };
        assert_eq!(format!("{}", intent), "establish 3 -> 4");
    }
}

//! Offline consistency check of the sharing topology.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ledger::{LedgerEntry, OrphanIntent};
use crate::types::InodeId;
use crate::volume::Volume;

/// Severity of an fsck finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsckSeverity {
    /// The sharing topology is inconsistent.
    Error,
    /// Work left for remount recovery.
    Warning,
}

impl std::fmt::Display for FsckSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsckSeverity::Error => write!(f, "ERROR"),
            FsckSeverity::Warning => write!(f, "WARNING"),
        }
    }
}

/// Types of sharing inconsistencies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsckIssue {
    /// Inner link count does not match the outers attached to it.
    LinkCountMismatch {
        /// The inner object.
        inner: InodeId,
        /// Outers actually attached.
        expected: u32,
        /// The stored link count.
        actual: u32,
    },
    /// A file that is not attached still holds sentinel entries.
    DanglingSentinel {
        /// The file.
        ino: InodeId,
        /// Number of sentinel entries.
        count: u64,
    },
    /// An outer points at an inode that no longer exists.
    MissingInner {
        /// The outer file.
        outer: InodeId,
        /// The missing inner id.
        inner: InodeId,
    },
    /// An outer points at an inode that is not an inner object.
    NotAnInner {
        /// The outer file.
        outer: InodeId,
        /// The target inode.
        target: InodeId,
    },
    /// An inner object lost its content-frozen attribute.
    InnerNotFrozen {
        /// The inner object.
        inner: InodeId,
    },
    /// An inner object queued for deletion with no ledger entry to finish it.
    UnreferencedInner {
        /// The inner object.
        inner: InodeId,
    },
    /// A file was left in the middle of a transition.
    TransitionInProgress {
        /// The file.
        ino: InodeId,
        /// State name.
        state: String,
    },
    /// A ledger entry is still outstanding.
    PendingLedgerEntry {
        /// The entry.
        entry: LedgerEntry,
    },
}

impl FsckIssue {
    /// Severity of this issue.
    pub fn severity(&self) -> FsckSeverity {
        match self {
            FsckIssue::PendingLedgerEntry { .. } | FsckIssue::TransitionInProgress { .. } => {
                FsckSeverity::Warning
            }
            _ => FsckSeverity::Error,
        }
    }
}

impl std::fmt::Display for FsckIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsckIssue::LinkCountMismatch {
                inner,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Link count mismatch for inner {}: expected {}, got {}",
                    inner, expected, actual
                )
            }
            FsckIssue::DanglingSentinel { ino, count } => {
                write!(f, "Inode {} is not shared but holds {} sentinel entries", ino, count)
            }
            FsckIssue::MissingInner { outer, inner } => {
                write!(f, "Outer {} points to missing inner {}", outer, inner)
            }
            FsckIssue::NotAnInner { outer, target } => {
                write!(f, "Outer {} points to {} which is not an inner object", outer, target)
            }
            FsckIssue::InnerNotFrozen { inner } => {
                write!(f, "Inner {} is not content-frozen", inner)
            }
            FsckIssue::UnreferencedInner { inner } => {
                write!(f, "Inner {} has no links and no pending release", inner)
            }
            FsckIssue::TransitionInProgress { ino, state } => {
                write!(f, "Inode {} left in state {}", ino, state)
            }
            FsckIssue::PendingLedgerEntry { entry } => {
                write!(f, "Pending ledger entry {}: {}", entry.seq, entry.intent)
            }
        }
    }
}

/// Result of a consistency check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsckReport {
    /// Every issue found.
    pub issues: Vec<FsckIssue>,
    /// Inodes examined.
    pub inodes_checked: usize,
    /// Count of error-severity issues.
    pub errors: u64,
    /// Count of warning-severity issues.
    pub warnings: u64,
}

impl FsckReport {
    fn push(&mut self, issue: FsckIssue) {
        match issue.severity() {
            FsckSeverity::Error => self.errors += 1,
            FsckSeverity::Warning => self.warnings += 1,
        }
        self.issues.push(issue);
    }

    /// Returns true if no errors were found.
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

impl Volume {
    /// Checks the sharing topology of the whole volume.
    pub async fn fsck(&self) -> FsckReport {
        let mut report = FsckReport::default();
        let inodes = self.all_inodes();
        report.inodes_checked = inodes.len();

        let mut attached: HashMap<InodeId, u32> = HashMap::new();
        for inode in &inodes {
            let state = inode.share.read().await;
            if state.in_transition() {
                report.push(FsckIssue::TransitionInProgress {
                    ino: inode.id(),
                    state: state.name().to_string(),
                });
            }
            match state.inner() {
                None => {
                    let count = inode.map.lock().sentinel_count();
                    if count > 0 {
                        report.push(FsckIssue::DanglingSentinel { ino: inode.id(), count });
                    }
                }
                Some(link) => match self.inode(link.id()) {
                    Err(_) => report.push(FsckIssue::MissingInner {
                        outer: inode.id(),
                        inner: link.id(),
                    }),
                    Ok(target) if !target.is_inner() => report.push(FsckIssue::NotAnInner {
                        outer: inode.id(),
                        target: target.id(),
                    }),
                    Ok(target) => *attached.entry(target.id()).or_insert(0) += 1,
                },
            }
        }

        let entries = self.ledger().entries();
        for inode in inodes.iter().filter(|i| i.is_inner()) {
            let expected = attached.get(&inode.id()).copied().unwrap_or(0);
            if inode.link_count() != expected {
                report.push(FsckIssue::LinkCountMismatch {
                    inner: inode.id(),
                    expected,
                    actual: inode.link_count(),
                });
            }
            if !inode.flags().data_frozen {
                report.push(FsckIssue::InnerNotFrozen { inner: inode.id() });
            }
            let pending = entries
                .iter()
                .any(|e| e.intent == OrphanIntent::ReleaseInner { inner: inode.id() });
            if inode.is_dying() && inode.link_count() == 0 && !pending {
                report.push(FsckIssue::UnreferencedInner { inner: inode.id() });
            }
        }

        for entry in entries {
            report.push(FsckIssue::PendingLedgerEntry { entry });
        }

        if report.issues.is_empty() {
            info!(inodes = report.inodes_checked, "fsck clean");
        } else {
            for issue in &report.issues {
                warn!("[{}] {}", issue.severity(), issue);
            }
        }
        report
    }
}

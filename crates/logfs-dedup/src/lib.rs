#![warn(missing_docs)]

//! logfs-dedup: file-content sharing for a log-structured filesystem
//!
//! Two or more user-visible files (outer objects) can delegate their content
//! to one hidden, reference-counted file object (the inner object). The
//! outers keep only sentinel block-map entries; reads are served from the
//! inner, and any mutation of an outer first copies the content back into
//! private blocks. This crate owns the sharing state machine, its crash
//! safety via the orphan ledger, and the checkpoint-epoch signal that forces
//! a full checkpoint after a topology change.

pub mod config;
pub mod device;
pub mod epoch;
pub mod error;
pub mod establish;
pub mod fault;
pub mod file_ops;
pub mod fsck;
pub mod gc;
pub mod inode;
pub mod ledger;
pub mod lifecycle;
pub mod page;
pub mod recovery;
pub mod revoke;
pub mod sentinel;
pub mod types;
pub mod verify;
pub mod volume;

pub use config::{DedupConfig, VolumeConfig};
pub use device::{BlockStore, BlockStoreStats, MemBlockStore};
pub use epoch::SyncMode;
pub use error::{DedupError, DedupResult, ErrorKind};
pub use fault::{FaultAction, FaultInjector, FaultPoint, FaultSpec};
pub use fsck::{FsckIssue, FsckReport, FsckSeverity};
pub use inode::{FileFlags, Inode, InodeGuard, InnerLink, ShareState};
pub use ledger::{LedgerEntry, OrphanIntent, OrphanLedger};
pub use lifecycle::{InnerRef, SharingState};
pub use recovery::RecoveryReport;
pub use sentinel::{BlockEntry, BlockMap, NULL_ADDR, SHARED_ADDR};
pub use types::{EncryptionPolicy, Epoch, FileSpec, FileType, InodeId, PAGE_SIZE};
pub use verify::Verdict;
pub use volume::Volume;

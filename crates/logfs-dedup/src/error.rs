//! Error types for the dedup layer.

use thiserror::Error;

use crate::fault::FaultPoint;
use crate::types::InodeId;

/// Result type alias for dedup operations.
pub type DedupResult<T> = Result<T, DedupError>;

/// Coarse classification of a [`DedupError`], used by callers to decide
/// whether to retry, report, or escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any mutation; no state changed.
    Precondition,
    /// Sampled content differed; rejected before any mutation.
    ContentMismatch,
    /// Out of ledger slots or free blocks.
    ResourceExhausted,
    /// I/O failure, or an inconsistency found while transitioning.
    Io,
    /// Another transition holds the file; retry later.
    Contention,
    /// Caller cancelled before the point of no return; retry later.
    Cancelled,
    /// Simulated power loss from the fault harness.
    Crashed,
    /// Volume is flagged for an offline consistency check.
    ReadOnly,
    /// Invalid configuration.
    Config,
}

/// Error variants for dedup operations.
#[derive(Debug, Error)]
pub enum DedupError {
    /// The requested inode does not exist.
    #[error("Inode not found: {0}")]
    NotFound(InodeId),

    /// The file is not a regular file.
    #[error("Not a regular file: {ino}")]
    NotRegular {
        /// Offending inode.
        ino: InodeId,
    },

    /// Outer and candidate are the same file object.
    #[error("Cannot share inode {ino} with itself")]
    SameFile {
        /// Offending inode.
        ino: InodeId,
    },

    /// Outer and candidate differ in logical size.
    #[error("Size mismatch: outer {outer_size} bytes, inner {inner_size} bytes")]
    SizeMismatch {
        /// Logical size of the outer file.
        outer_size: u64,
        /// Logical size of the candidate inner file.
        inner_size: u64,
    },

    /// Encryption policies of the two files are not compatible.
    #[error("Encryption policy mismatch between {outer} and {inner}")]
    PolicyMismatch {
        /// The outer file.
        outer: InodeId,
        /// The candidate inner file.
        inner: InodeId,
    },

    /// The outer file already delegates its content.
    #[error("Inode {ino} is already shared")]
    AlreadyShared {
        /// Offending inode.
        ino: InodeId,
    },

    /// The candidate is not content-frozen.
    #[error("Inode {ino} is not content-frozen")]
    NotFrozen {
        /// Offending inode.
        ino: InodeId,
    },

    /// The file is frozen and refuses data mutation.
    #[error("Inode {ino} is frozen")]
    Frozen {
        /// Offending inode.
        ino: InodeId,
    },

    /// The candidate is too small for sharing to pay off.
    #[error("Inode {ino} too small to share: {size} bytes, minimum {min}")]
    TooSmall {
        /// Offending inode.
        ino: InodeId,
        /// Its logical size.
        size: u64,
        /// Configured minimum.
        min: u64,
    },

    /// The file is in a state that cannot take part in sharing.
    #[error("Inode {ino} cannot take part in sharing: {reason}")]
    Incompatible {
        /// Offending inode.
        ino: InodeId,
        /// Which attribute blocks it.
        reason: &'static str,
    },

    /// The byte range ends past the largest representable file offset.
    #[error("Range at offset {offset} with length {len} overflows inode {ino}")]
    OutOfRange {
        /// Offending inode.
        ino: InodeId,
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
    },

    /// Inner objects are hidden and cannot be accessed directly.
    #[error("Inode {ino} is an inner object and cannot be accessed directly")]
    InnerObject {
        /// Offending inode.
        ino: InodeId,
    },

    /// Content-equality verification found a difference.
    #[error("Stale content: {outer} and {inner} differ")]
    StaleContent {
        /// The outer file.
        outer: InodeId,
        /// The candidate inner file.
        inner: InodeId,
    },

    /// The orphan ledger has no free slot.
    #[error("Orphan ledger full: capacity {capacity}")]
    LedgerFull {
        /// Configured ledger capacity.
        capacity: usize,
    },

    /// No free blocks available.
    #[error("Out of space: no free blocks available")]
    OutOfSpace,

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An outer file points at an inner object that is gone.
    #[error("Outer {outer} references missing inner object {inner}")]
    MissingInner {
        /// The outer file.
        outer: InodeId,
        /// The inner id it references.
        inner: InodeId,
    },

    /// Another sharing transition holds the file.
    #[error("Sharing transition in progress on {ino}, try again")]
    Busy {
        /// Offending inode.
        ino: InodeId,
    },

    /// In-flight readers or direct I/O did not drain in time.
    #[error("Timed out waiting for in-flight I/O on {ino}")]
    DrainTimeout {
        /// Inode being drained.
        ino: InodeId,
    },

    /// The caller cancelled the transition before its point of no return.
    #[error("Sharing transition on {ino} cancelled")]
    Cancelled {
        /// Inode being transitioned.
        ino: InodeId,
    },

    /// Simulated power loss at a fault point.
    #[error("Simulated crash at {point}")]
    Crashed {
        /// Where the crash was injected.
        point: FaultPoint,
    },

    /// The volume needs an offline consistency check and refuses mutation.
    #[error("Volume needs fsck: {reason}")]
    NeedsFsck {
        /// Why the volume was flagged.
        reason: String,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl DedupError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DedupError::NotFound(_)
            | DedupError::NotRegular { .. }
            | DedupError::SameFile { .. }
            | DedupError::SizeMismatch { .. }
            | DedupError::PolicyMismatch { .. }
            | DedupError::AlreadyShared { .. }
            | DedupError::NotFrozen { .. }
            | DedupError::Frozen { .. }
            | DedupError::TooSmall { .. }
            | DedupError::Incompatible { .. }
            | DedupError::OutOfRange { .. }
            | DedupError::InnerObject { .. } => ErrorKind::Precondition,
            DedupError::StaleContent { .. } => ErrorKind::ContentMismatch,
            DedupError::LedgerFull { .. } | DedupError::OutOfSpace => ErrorKind::ResourceExhausted,
            DedupError::Io(_) | DedupError::MissingInner { .. } => ErrorKind::Io,
            DedupError::Busy { .. } | DedupError::DrainTimeout { .. } => ErrorKind::Contention,
            DedupError::Cancelled { .. } => ErrorKind::Cancelled,
            DedupError::Crashed { .. } => ErrorKind::Crashed,
            DedupError::NeedsFsck { .. } => ErrorKind::ReadOnly,
            DedupError::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    /// Returns true if the same request may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Contention | ErrorKind::Cancelled)
    }

    /// Returns true for a simulated power loss. Protocols never compensate
    /// after a crash; recovery does.
    pub fn is_crash(&self) -> bool {
        matches!(self, DedupError::Crashed { .. })
    }

    pub(crate) fn other(msg: impl Into<String>) -> Self {
        DedupError::Io(std::io::Error::other(msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_result_alias() {
        let ok: DedupResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: DedupResult<i32> = Err(DedupError::OutOfSpace);
        assert!(err.is_err());
    }

    #[test]
    fn test_kinds() {
        let ino = InodeId::new(3);
        assert_eq!(DedupError::AlreadyShared { ino }.kind(), ErrorKind::Precondition);
        assert_eq!(
            DedupError::StaleContent { outer: ino, inner: InodeId::new(4) }.kind(),
            ErrorKind::ContentMismatch
        );
        assert_eq!(DedupError::LedgerFull { capacity: 8 }.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(DedupError::other("boom").kind(), ErrorKind::Io);
        assert_eq!(DedupError::Busy { ino }.kind(), ErrorKind::Contention);
    }

    #[test]
    fn test_retryable() {
        let ino = InodeId::new(9);
        assert!(DedupError::Busy { ino }.is_retryable());
        assert!(DedupError::Cancelled { ino }.is_retryable());
        assert!(DedupError::DrainTimeout { ino }.is_retryable());
        assert!(!DedupError::OutOfSpace.is_retryable());
        assert!(!DedupError::Crashed { point: FaultPoint::Detach }.is_retryable());
    }

    #[test]
    fn test_messages() {
        let err = DedupError::SizeMismatch { outer_size: 100, inner_size: 200 };
        assert_eq!(format!("{}", err), "Size mismatch: outer 100 bytes, inner 200 bytes");

        let err = DedupError::Crashed { point: FaultPoint::SentinelCommit };
        assert!(format!("{}", err).contains("sentinel-commit"));
    }
}

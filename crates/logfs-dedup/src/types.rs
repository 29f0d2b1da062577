//! Identifiers and small value types shared across the dedup layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a logical page and of a physical block, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Unique identifier for a file object on the volume.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// Creates a new InodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checkpoint generation counter.
///
/// Epochs are only compared for equality against the current epoch; they carry
/// no ordering meaning across checkpoints.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch(u64);

impl Epoch {
    /// The epoch a freshly formatted volume starts in.
    pub const INITIAL: Epoch = Epoch(1);

    /// Creates a new Epoch from a raw u64 value
    pub fn new(e: u64) -> Self {
        Epoch(e)
    }

    /// Returns the raw u64 value of this epoch
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of file object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileType {
    /// Regular data file
    #[default]
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
}

/// Encryption policy attached to a file or to its parent directory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionPolicy {
    /// Master key identifier
    pub key_id: [u8; 16],
    /// Contents encryption mode
    pub contents_mode: u8,
}

impl EncryptionPolicy {
    /// Returns true if content encrypted under `candidate` may be served to a
    /// file governed by `target`. Unencrypted content only matches unencrypted
    /// targets.
    pub fn compatible(
        target: Option<&EncryptionPolicy>,
        candidate: Option<&EncryptionPolicy>,
    ) -> bool {
        target == candidate
    }
}

/// Attributes supplied when creating a file.
#[derive(Clone, Debug, Default)]
pub struct FileSpec {
    /// Kind of file object
    pub file_type: FileType,
    /// Policy the file's own contents are encrypted under
    pub encryption: Option<EncryptionPolicy>,
    /// Policy of the directory the file lives in
    pub dir_policy: Option<EncryptionPolicy>,
}

impl FileSpec {
    /// An unencrypted regular file.
    pub fn regular() -> Self {
        Self::default()
    }

    /// A regular file encrypted under `policy`, living in a directory with the same policy.
    pub fn encrypted(policy: EncryptionPolicy) -> Self {
        Self {
            file_type: FileType::Regular,
            encryption: Some(policy),
            dir_policy: Some(policy),
        }
    }

    /// Overrides the file type.
    pub fn with_type(mut self, file_type: FileType) -> Self {
        self.file_type = file_type;
        self
    }
}

/// Number of pages needed to hold `size` bytes.
pub fn pages_for(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE as u64)
}

#![forbid(unsafe_code)]
//! Error types for the V6 filesystem reader.
//!
//! # Error Taxonomy
//!
//! Two layers, mirroring the crate split:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `v6fs-types` | Byte ranges that do not decode |
//! | Runtime | `V6Error` | `v6fs-error` (this crate) | Everything a caller of the filesystem sees |
//!
//! Every `V6Error` variant belongs to exactly one [`ErrorKind`]:
//!
//! | Kind | Variants | Meaning |
//! |------|----------|---------|
//! | `NotFound` | `NotFound`, `InodeOutOfRange` | Expected, frequent; never logged above debug |
//! | `IoFailure` | `Io`, `Device` | The sector store failed; never retried |
//! | `InvalidArgument` | `InvalidArgument`, `BlockOutOfRange`, `NotDirectory`, `NoFreeDescriptor`, `BadDescriptor`, `ReadOnly` | Caller asked for something the format or API cannot give |
//! | `FormatViolation` | `Unallocated`, `Format`, `Corruption`, `Parse` | The image is corrupt or not a V6 filesystem |
//!
//! Conversion from `ParseError` happens in the crate that knows
//! the sector being decoded, so `Corruption` always carries a sector number.
//!
//! ## errno Mapping
//!
//! [`V6Error::to_errno`] is exhaustive; adding a variant is a compile error
//! until it is assigned an errno. `Unallocated` maps to `ENOENT`: a caller
//! that walks into a free inode sees "no such file", even though the
//! taxonomy records it as a format violation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a [`V6Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    IoFailure,
    InvalidArgument,
    FormatViolation,
}

/// Unified error type for all filesystem operations.
#[derive(Debug, Error)]
pub enum V6Error {
    /// Operating system I/O error from the backing image.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The sector store refused a sector (out of range, read-only, short write).
    #[error("device error at sector {sector}: {detail}")]
    Device { sector: u32, detail: String },

    /// Path component or directory entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Inode number outside `1..=inode_count`.
    #[error("inode {ino} out of range (inode count {inode_count})")]
    InodeOutOfRange { ino: u32, inode_count: u32 },

    /// Inode record fetched, but its allocated flag is clear.
    #[error("inode {0} is not allocated")]
    Unallocated(u32),

    /// Logical block outside what the inode can address.
    #[error("block {block} out of range for inode of size {size}")]
    BlockOutOfRange { block: u32, size: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A path component that must be a directory is not one.
    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// Structurally invalid image (superblock geometry, wrong filesystem).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Metadata read from a live image does not make sense.
    #[error("corrupt metadata at sector {sector}: {detail}")]
    Corruption { sector: u32, detail: String },

    /// Parse-layer error with no sector context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Every descriptor slot is in use.
    #[error("too many open files")]
    NoFreeDescriptor,

    /// Descriptor was never opened, already closed, or its slot was reused.
    #[error("bad file descriptor: {0}")]
    BadDescriptor(String),

    /// Write attempted against a read-only store.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl V6Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::InodeOutOfRange { .. } => ErrorKind::NotFound,
            Self::Io(_) | Self::Device { .. } => ErrorKind::IoFailure,
            Self::InvalidArgument(_)
            | Self::BlockOutOfRange { .. }
            | Self::NotDirectory(_)
            | Self::NoFreeDescriptor
            | Self::BadDescriptor(_)
            | Self::ReadOnly => ErrorKind::InvalidArgument,
            Self::Unallocated(_) | Self::Format(_) | Self::Corruption { .. } | Self::Parse(_) => {
                ErrorKind::FormatViolation
            }
        }
    }

    /// Whether this is the expected "does not exist" outcome rather than a
    /// fault. Unallocated inodes count: callers treat them as missing files.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound || matches!(self, Self::Unallocated(_))
    }

    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Device { .. } | Self::Corruption { .. } => libc::EIO,
            Self::NotFound(_) | Self::InodeOutOfRange { .. } | Self::Unallocated(_) => {
                libc::ENOENT
            }
            Self::BlockOutOfRange { .. }
            | Self::InvalidArgument(_)
            | Self::Format(_)
            | Self::Parse(_) => libc::EINVAL,
            Self::NotDirectory(_) => libc::ENOTDIR,
            Self::NoFreeDescriptor => libc::EMFILE,
            Self::BadDescriptor(_) => libc::EBADF,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `V6Error`.
pub type Result<T> = std::result::Result<T, V6Error>;

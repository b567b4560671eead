#![forbid(unsafe_code)]
//! Read-only access to Unix V6 filesystem images.
//!
//! Re-exports the filesystem handle from `v6fs-core` together with the
//! types callers need to use it. This is the crate the CLI and the
//! integration tests depend on.

pub use v6fs_block::{
    CacheStats, DEFAULT_CACHE_KB, FileSectorStore, MemSectorStore, SectorBuf, SectorCache,
    SectorStore, capacity_for_budget_kb,
};
pub use v6fs_core::*;
pub use v6fs_error::{ErrorKind, Result, V6Error};
pub use v6fs_inode::{FileBlock, InodeGeometry, block_count, valid_bytes_in_block};
pub use v6fs_ondisk::{DirEntry, Inode, InodeKind, Superblock, names_equal};
pub use v6fs_pathstore::{Checksum, InsertOutcome, PathStore, PathStoreStats, checksum_path};
pub use v6fs_types::{InodeNumber, SECTOR_SIZE, SectorNumber};

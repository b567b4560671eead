#![forbid(unsafe_code)]
//! Shared vocabulary for the V6 filesystem crates.
//!
//! Unit-carrying newtypes for sectors and inodes, the fixed geometry of the
//! on-disk format, and bounds-checked readers that every decoder uses instead
//! of reinterpreting raw memory.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of one addressable sector (and one file block) in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector holding the superblock. Sector 0 is the boot block.
pub const SUPERBLOCK_SECTOR: SectorNumber = SectorNumber(1);
/// First sector of the inode list.
pub const INODE_START_SECTOR: SectorNumber = SectorNumber(2);

/// On-disk inode record size.
pub const INODE_SIZE: usize = 32;
pub const INODES_PER_SECTOR: usize = SECTOR_SIZE / INODE_SIZE;

/// Number of block address slots in an inode.
pub const INODE_ADDR_SLOTS: usize = 8;
/// Slots `0..7` of a large file are single-indirect; slot 7 is doubly indirect.
pub const SINGLE_INDIRECT_SLOTS: usize = 7;
pub const DOUBLE_INDIRECT_SLOT: usize = 7;

/// Width of one block pointer inside an indirect sector.
pub const POINTER_SIZE: usize = 2;
pub const POINTERS_PER_SECTOR: usize = SECTOR_SIZE / POINTER_SIZE;

/// Largest logical block addressable by a large file.
pub const MAX_LARGE_FILE_BLOCK: u32 =
    (SINGLE_INDIRECT_SLOTS * POINTERS_PER_SECTOR + POINTERS_PER_SECTOR * POINTERS_PER_SECTOR - 1)
        as u32;

/// Fixed width of a directory entry name. Names are NOT NUL-terminated when
/// they use all 14 bytes.
pub const DIRENT_NAME_LEN: usize = 14;
pub const DIRENT_SIZE: usize = 2 + DIRENT_NAME_LEN;
pub const DIRENTS_PER_SECTOR: usize = SECTOR_SIZE / DIRENT_SIZE;

// ── i_mode bits ─────────────────────────────────────────────────────────────

pub const IALLOC: u16 = 0o100_000;
pub const IFMT: u16 = 0o060_000;
pub const IFDIR: u16 = 0o040_000;
pub const IFCHR: u16 = 0o020_000;
pub const IFBLK: u16 = 0o060_000;
pub const ILARG: u16 = 0o010_000;
pub const ISUID: u16 = 0o004_000;
pub const ISGID: u16 = 0o002_000;
pub const ISVTX: u16 = 0o001_000;
pub const PERMISSION_MASK: u16 = 0o777;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorNumber(pub u32);

impl SectorNumber {
    /// Byte offset of this sector on the device.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * SECTOR_SIZE as u64
    }
}

/// 1-based inode number. `0` never names an inode; directory entries use it
/// to mark free slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

impl InodeNumber {
    pub const ROOT: Self = Self(1);
}

impl fmt::Display for SectorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a 32-bit value stored as two little-endian u16 words, high word
/// first (the PDP-11 layout used for V6 timestamps).
#[inline]
pub fn read_split_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let high = read_le_u16(data, offset)?;
    let low = read_le_u16(data, offset + 2)?;
    Ok((u32::from(high) << 16) | u32::from(low))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Bytes of a NUL-padded field up to (not including) the first NUL.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

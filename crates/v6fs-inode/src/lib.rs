#![forbid(unsafe_code)]
//! Inode access.
//!
//! Fetches inode records from the inode list, maps a file's logical block
//! numbers to device sectors (direct, single indirect, double indirect), and
//! reads one file block with its valid byte count. Every sector read goes
//! through the caller's [`SectorStore`], normally the sector cache.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use v6fs_block::SectorStore;
use v6fs_error::{Result, V6Error};
use v6fs_ondisk::{Inode, Superblock, inode_position};
use v6fs_types::{
    DOUBLE_INDIRECT_SLOT, INODE_SIZE, INODE_START_SECTOR, INODES_PER_SECTOR,
    InodeNumber, MAX_LARGE_FILE_BLOCK, POINTER_SIZE, POINTERS_PER_SECTOR, ParseError,
    SECTOR_SIZE, SINGLE_INDIRECT_SLOTS, SectorNumber, ensure_slice, read_le_u16,
};

/// Shape of the inode list, derived once at mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeGeometry {
    /// First sector of the inode list.
    pub start: SectorNumber,
    /// Sectors occupied by the inode list (`s_isize`).
    pub sectors: u32,
}

impl InodeGeometry {
    #[must_use]
    pub fn from_superblock(sb: &Superblock) -> Self {
        Self {
            start: INODE_START_SECTOR,
            sectors: u32::from(sb.isize),
        }
    }

    #[must_use]
    pub fn inode_count(&self) -> u32 {
        self.sectors.saturating_mul(INODES_PER_SECTOR as u32)
    }

    #[must_use]
    pub fn contains(&self, ino: InodeNumber) -> bool {
        ino.0 >= 1 && ino.0 <= self.inode_count()
    }

    /// Sector holding `ino` and the byte offset of its record in that sector.
    pub fn locate(&self, ino: InodeNumber) -> Result<(SectorNumber, usize)> {
        let out_of_range = || V6Error::InodeOutOfRange {
            ino: ino.0,
            inode_count: self.inode_count(),
        };
        if !self.contains(ino) {
            return Err(out_of_range());
        }
        let (rel, offset) = inode_position(ino).ok_or_else(out_of_range)?;
        Ok((SectorNumber(self.start.0 + rel), offset))
    }
}

fn corruption(sector: SectorNumber, err: &ParseError) -> V6Error {
    V6Error::Corruption {
        sector: sector.0,
        detail: err.to_string(),
    }
}

// ── Inode fetch ─────────────────────────────────────────────────────────────

/// Decode inode `ino` without checking its allocated flag.
///
/// Performs exactly one sector read. Out-of-range numbers fail before any I/O.
pub fn fetch_raw(
    dev: &mut dyn SectorStore,
    geom: &InodeGeometry,
    ino: InodeNumber,
) -> Result<Inode> {
    let (sector, offset) = geom.locate(ino)?;
    let buf = dev.read_sector(sector)?;
    let record =
        ensure_slice(buf.valid_bytes(), offset, INODE_SIZE).map_err(|e| corruption(sector, &e))?;
    let inode = Inode::parse_from_bytes(record).map_err(|e| corruption(sector, &e))?;
    debug!(
        target: "v6fs::inode",
        ino = ino.0,
        sector = sector.0,
        offset,
        mode = inode.mode,
        size = inode.size(),
        "inode fetched"
    );
    Ok(inode)
}

/// Fetch inode `ino`, failing with [`V6Error::Unallocated`] when the record
/// is not in use.
pub fn fetch(dev: &mut dyn SectorStore, geom: &InodeGeometry, ino: InodeNumber) -> Result<Inode> {
    let inode = fetch_raw(dev, geom, ino)?;
    if !inode.is_allocated() {
        return Err(V6Error::Unallocated(ino.0));
    }
    Ok(inode)
}

// ── Block resolution ────────────────────────────────────────────────────────

/// Number of blocks holding the file's content: `ceil(size / 512)`.
#[must_use]
pub fn block_count(inode: &Inode) -> u32 {
    inode.size().div_ceil(SECTOR_SIZE as u32)
}

/// Valid bytes in logical block `block` of a file of `size` bytes.
///
/// The last block holds `size % 512` bytes; every earlier block is full. A
/// block starting exactly at EOF holds nothing.
#[must_use]
pub fn valid_bytes_in_block(size: u32, block: u32) -> usize {
    let end = (u64::from(block) + 1) * SECTOR_SIZE as u64;
    if end > u64::from(size) {
        size as usize % SECTOR_SIZE
    } else {
        SECTOR_SIZE
    }
}

/// Read pointer `index` from indirect sector `sector`.
fn read_pointer(dev: &mut dyn SectorStore, sector: SectorNumber, index: usize) -> Result<u16> {
    let buf = dev.read_sector(sector)?;
    read_le_u16(buf.valid_bytes(), index * POINTER_SIZE).map_err(|e| corruption(sector, &e))
}

/// An indirect pointer of zero would send the walk into the boot block.
fn indirect_sector(ptr: u16, holder: u32, index: usize) -> Result<SectorNumber> {
    if ptr == 0 {
        return Err(V6Error::Corruption {
            sector: holder,
            detail: format!("indirect pointer {index} is zero"),
        });
    }
    Ok(SectorNumber(u32::from(ptr)))
}

/// Map logical block `block` of `inode` to a device sector.
///
/// `block * 512 <= size` must hold; one block past the final partial block
/// is accepted so callers can compute sizes. Small files cost no extra
/// reads, single-indirect blocks cost one, double-indirect blocks two.
pub fn resolve_block(dev: &mut dyn SectorStore, inode: &Inode, block: u32) -> Result<SectorNumber> {
    let size = inode.size();
    let out_of_range = || V6Error::BlockOutOfRange { block, size };
    if u64::from(block) * SECTOR_SIZE as u64 > u64::from(size) {
        return Err(out_of_range());
    }
    let lb = block as usize;

    if !inode.is_large() {
        let sector = *inode.addr.get(lb).ok_or_else(out_of_range)?;
        trace!(target: "v6fs::inode", block, sector, "direct");
        return Ok(SectorNumber(u32::from(sector)));
    }

    let slot = lb / POINTERS_PER_SECTOR;
    if slot < SINGLE_INDIRECT_SLOTS {
        let indirect = indirect_sector(inode.addr[slot], 0, slot)?;
        let sector = read_pointer(dev, indirect, lb % POINTERS_PER_SECTOR)?;
        trace!(
            target: "v6fs::inode",
            block,
            indirect = indirect.0,
            sector,
            "single indirect"
        );
        return Ok(SectorNumber(u32::from(sector)));
    }

    if block > MAX_LARGE_FILE_BLOCK {
        return Err(out_of_range());
    }
    let rel = lb - SINGLE_INDIRECT_SLOTS * POINTERS_PER_SECTOR;
    let double = indirect_sector(inode.addr[DOUBLE_INDIRECT_SLOT], 0, DOUBLE_INDIRECT_SLOT)?;
    let index = rel / POINTERS_PER_SECTOR;
    let indirect = indirect_sector(read_pointer(dev, double, index)?, double.0, index)?;
    let sector = read_pointer(dev, indirect, rel % POINTERS_PER_SECTOR)?;
    trace!(
        target: "v6fs::inode",
        block,
        double = double.0,
        indirect = indirect.0,
        sector,
        "double indirect"
    );
    Ok(SectorNumber(u32::from(sector)))
}

// ── Block reads ─────────────────────────────────────────────────────────────

/// One logical block of file content. `data` is always a full sector; only
/// the first `valid` bytes belong to the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    pub data: Vec<u8>,
    pub valid: usize,
}

impl FileBlock {
    fn empty() -> Self {
        Self {
            data: vec![0; SECTOR_SIZE],
            valid: 0,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.valid]
    }
}

/// Read logical block `block` of an inode the caller already holds.
pub fn read_inode_block(dev: &mut dyn SectorStore, inode: &Inode, block: u32) -> Result<FileBlock> {
    let size = inode.size();
    let valid = valid_bytes_in_block(size, block);
    if valid == 0 && u64::from(block) * SECTOR_SIZE as u64 == u64::from(size) {
        // Block starts at EOF: nothing to resolve or read.
        return Ok(FileBlock::empty());
    }
    let sector = resolve_block(dev, inode, block)?;
    let buf = dev.read_sector(sector)?;
    if buf.valid_len() < valid {
        return Err(V6Error::Device {
            sector: sector.0,
            detail: format!("short sector: {} of {valid} bytes", buf.valid_len()),
        });
    }
    Ok(FileBlock {
        data: buf.into_inner(),
        valid,
    })
}

/// Fetch inode `ino` and read its logical block `block`.
pub fn read_block(
    dev: &mut dyn SectorStore,
    geom: &InodeGeometry,
    ino: InodeNumber,
    block: u32,
) -> Result<FileBlock> {
    let inode = fetch(dev, geom, ino)?;
    read_inode_block(dev, &inode, block)
}

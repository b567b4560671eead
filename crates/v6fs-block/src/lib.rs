#![forbid(unsafe_code)]
//! Sector I/O layer.
//!
//! Provides the [`SectorStore`] trait (the raw device boundary), a file-backed
//! and an in-memory store, and [`SectorCache`], a direct-mapped read cache
//! that every higher layer routes its sector fetches through.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, trace};
use v6fs_error::{Result, V6Error};
use v6fs_types::{SECTOR_SIZE, SectorNumber};

/// Default memory budget for the sector cache, in kilobytes.
pub const DEFAULT_CACHE_KB: usize = 1024;

/// One sector's worth of bytes plus how many of them the store produced.
///
/// Invariant: `bytes.len() == SECTOR_SIZE` and `valid <= SECTOR_SIZE`. Bytes
/// past `valid` are zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorBuf {
    bytes: Vec<u8>,
    valid: usize,
}

impl SectorBuf {
    /// Wrap `bytes`, zero-padding or truncating to one sector. The valid
    /// count is the number of input bytes that fit.
    #[must_use]
    pub fn new(mut bytes: Vec<u8>) -> Self {
        let valid = bytes.len().min(SECTOR_SIZE);
        bytes.resize(SECTOR_SIZE, 0);
        Self { bytes, valid }
    }

    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: vec![0_u8; SECTOR_SIZE],
            valid: 0,
        }
    }

    /// The whole sector, including any zero padding past the valid count.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Only the bytes the store actually produced.
    #[must_use]
    pub fn valid_bytes(&self) -> &[u8] {
        &self.bytes[..self.valid]
    }

    #[must_use]
    pub fn valid_len(&self) -> usize {
        self.valid
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Fixed-size sector device: the only component that touches storage.
///
/// Reads either return a whole `SectorBuf` or an error, never partial data
/// plus an error. A store is used from one thread at a time; share it behind
/// a single lock if needed.
pub trait SectorStore: Send {
    /// Read one sector.
    fn read_sector(&mut self, sector: SectorNumber) -> Result<SectorBuf>;

    /// Write one sector. `data.len()` MUST equal `SECTOR_SIZE`. Returns the
    /// number of bytes written.
    fn write_sector(&mut self, sector: SectorNumber, data: &[u8]) -> Result<usize>;

    /// Total image length in bytes.
    fn len_bytes(&self) -> u64;

    /// Number of sectors, counting a trailing partial sector.
    fn sector_count(&self) -> u64 {
        self.len_bytes().div_ceil(SECTOR_SIZE as u64)
    }
}

impl<S: SectorStore + ?Sized> SectorStore for Box<S> {
    fn read_sector(&mut self, sector: SectorNumber) -> Result<SectorBuf> {
        (**self).read_sector(sector)
    }

    fn write_sector(&mut self, sector: SectorNumber, data: &[u8]) -> Result<usize> {
        (**self).write_sector(sector, data)
    }

    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }
}

/// Byte offset and readable length of `sector` on an image of `len` bytes.
fn read_range(sector: SectorNumber, len: u64) -> Result<(u64, usize)> {
    let offset = sector.byte_offset();
    if offset >= len {
        return Err(V6Error::Device {
            sector: sector.0,
            detail: format!("read past end of image (len={len})"),
        });
    }
    let available = len - offset;
    let valid = usize::try_from(available.min(SECTOR_SIZE as u64)).unwrap_or(SECTOR_SIZE);
    Ok((offset, valid))
}

fn write_range(sector: SectorNumber, data: &[u8], len: u64) -> Result<u64> {
    if data.len() != SECTOR_SIZE {
        return Err(V6Error::InvalidArgument(format!(
            "write_sector data size mismatch: got={} expected={SECTOR_SIZE}",
            data.len()
        )));
    }
    let offset = sector.byte_offset();
    if offset + SECTOR_SIZE as u64 > len {
        return Err(V6Error::Device {
            sector: sector.0,
            detail: format!("write past end of image (len={len})"),
        });
    }
    Ok(offset)
}

/// Image file accessed with positional reads and writes.
#[derive(Debug)]
pub struct FileSectorStore {
    file: File,
    len: u64,
    writable: bool,
}

impl FileSectorStore {
    /// Open read-write when permitted, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        debug!(target: "v6fs::block", len, writable, "opened image file");
        Ok(Self {
            file,
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl SectorStore for FileSectorStore {
    fn read_sector(&mut self, sector: SectorNumber) -> Result<SectorBuf> {
        let (offset, valid) = read_range(sector, self.len)?;
        let mut buf = vec![0_u8; SECTOR_SIZE];
        self.file.read_exact_at(&mut buf[..valid], offset)?;
        Ok(SectorBuf { bytes: buf, valid })
    }

    fn write_sector(&mut self, sector: SectorNumber, data: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(V6Error::ReadOnly);
        }
        let offset = write_range(sector, data, self.len)?;
        self.file.write_all_at(data, offset)?;
        Ok(SECTOR_SIZE)
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }
}

/// Whole image held in memory.
#[derive(Debug, Clone)]
pub struct MemSectorStore {
    bytes: Vec<u8>,
    read_only: bool,
}

impl MemSectorStore {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            read_only: false,
        }
    }

    #[must_use]
    pub fn read_only(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            read_only: true,
        }
    }
}

impl SectorStore for MemSectorStore {
    fn read_sector(&mut self, sector: SectorNumber) -> Result<SectorBuf> {
        let (offset, valid) = read_range(sector, self.len_bytes())?;
        // read_range bounds offset by len, which came from a usize.
        let start = usize::try_from(offset).map_err(|_| V6Error::Device {
            sector: sector.0,
            detail: "offset overflows usize".to_owned(),
        })?;
        Ok(SectorBuf::new(self.bytes[start..start + valid].to_vec()))
    }

    fn write_sector(&mut self, sector: SectorNumber, data: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(V6Error::ReadOnly);
        }
        let offset = write_range(sector, data, self.len_bytes())?;
        let start = usize::try_from(offset).map_err(|_| V6Error::Device {
            sector: sector.0,
            detail: "offset overflows usize".to_owned(),
        })?;
        self.bytes[start..start + SECTOR_SIZE].copy_from_slice(data);
        Ok(SECTOR_SIZE)
    }

    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Number of cache slots a memory budget of `kb` kilobytes buys.
#[must_use]
pub fn capacity_for_budget_kb(kb: usize) -> usize {
    kb.saturating_mul(1024) / SECTOR_SIZE
}

/// Counters for the sector cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub reads: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

#[derive(Debug, Clone, Default)]
struct CacheSlot {
    /// `None` is the empty sentinel.
    sector: Option<SectorNumber>,
    valid: usize,
    /// Empty until the slot is first filled.
    data: Vec<u8>,
}

/// Direct-mapped sector cache in front of a [`SectorStore`].
///
/// Sector `n` can only live in slot `n % capacity`; a newer sector silently
/// evicts whatever shares its slot. A failed store read leaves the slot as it
/// was. Writes go straight to the store and refresh the slot only if it
/// already holds that sector.
#[derive(Debug)]
pub struct SectorCache<S: SectorStore> {
    inner: S,
    slots: Vec<CacheSlot>,
    stats: CacheStats,
}

impl<S: SectorStore> SectorCache<S> {
    pub fn new(inner: S, capacity_sectors: usize) -> Result<Self> {
        if capacity_sectors == 0 {
            return Err(V6Error::InvalidArgument(
                "sector cache capacity must be at least one sector".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            slots: vec![CacheSlot::default(); capacity_sectors],
            stats: CacheStats::default(),
        })
    }

    /// Size the cache from a memory budget in kilobytes.
    pub fn with_budget_kb(inner: S, kb: usize) -> Result<Self> {
        let capacity = capacity_for_budget_kb(kb);
        if capacity == 0 {
            return Err(V6Error::InvalidArgument(format!(
                "cache budget of {kb} KiB holds no {SECTOR_SIZE}-byte sectors"
            )));
        }
        Self::new(inner, capacity)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    #[must_use]
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn slot_index(&self, sector: SectorNumber) -> usize {
        // u32 -> usize is lossless on every supported target.
        sector.0 as usize % self.slots.len()
    }

    /// Whether `sector` is currently resident.
    #[must_use]
    pub fn contains(&self, sector: SectorNumber) -> bool {
        self.slots[self.slot_index(sector)].sector == Some(sector)
    }

    /// Reset every slot to the empty sentinel.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = CacheSlot::default();
        }
    }
}

impl<S: SectorStore> SectorStore for SectorCache<S> {
    fn read_sector(&mut self, sector: SectorNumber) -> Result<SectorBuf> {
        self.stats.reads += 1;
        let index = self.slot_index(sector);
        let slot = &self.slots[index];
        if slot.sector == Some(sector) {
            self.stats.hits += 1;
            trace!(target: "v6fs::cache", sector = sector.0, slot = index, "hit");
            let mut bytes = slot.data.clone();
            bytes.truncate(slot.valid);
            return Ok(SectorBuf::new(bytes));
        }

        self.stats.misses += 1;
        trace!(
            target: "v6fs::cache",
            sector = sector.0,
            slot = index,
            evicting = slot.sector.map(|s| s.0),
            "miss"
        );
        let buf = self.inner.read_sector(sector)?;
        let slot = &mut self.slots[index];
        slot.sector = Some(sector);
        slot.valid = buf.valid_len();
        slot.data.clear();
        slot.data.extend_from_slice(buf.as_slice());
        Ok(buf)
    }

    fn write_sector(&mut self, sector: SectorNumber, data: &[u8]) -> Result<usize> {
        self.stats.writes += 1;
        let written = self.inner.write_sector(sector, data)?;
        let index = self.slot_index(sector);
        let slot = &mut self.slots[index];
        if slot.sector == Some(sector) {
            slot.data.clear();
            slot.data.extend_from_slice(data);
            slot.valid = written;
        }
        Ok(written)
    }

    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn sector_count(&self) -> u64 {
        self.inner.sector_count()
    }
}

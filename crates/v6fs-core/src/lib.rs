#![forbid(unsafe_code)]
//! Filesystem handle for Unix V6 images.
//!
//! [`Filesystem`] owns the sector cache, the decoded superblock, and the
//! descriptor table. Every layer below it is a free function over a
//! [`SectorStore`]; the handle threads its cache through them so that
//! independent handles share no state.
//!
//! The handle is single-threaded (`&mut self` everywhere). Callers that
//! need concurrent access wrap the whole handle in one mutex.

mod fileops;
mod path;

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use v6fs_block::{DEFAULT_CACHE_KB, FileSectorStore, SectorCache, SectorStore};
use v6fs_error::{Result, V6Error};
use v6fs_inode::{FileBlock, InodeGeometry, block_count};
use v6fs_ondisk::{DirEntry, Inode, Superblock};
use v6fs_types::{InodeNumber, SECTOR_SIZE, SUPERBLOCK_SECTOR, SectorNumber};

pub use fileops::{DescriptorTable, Fd, FileopsStats, MAX_OPEN_FILES};
pub use path::resolve_path;
pub use v6fs_block::CacheStats;

/// Options controlling how an image is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Sector cache memory budget in KiB; capacity is `cache_kb * 1024 / 512`
    /// sectors and must come out non-zero.
    pub cache_kb: usize,
    /// Parse the superblock without checking its geometry against the
    /// device. For diagnostics on damaged images only.
    pub skip_validation: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            cache_kb: DEFAULT_CACHE_KB,
            skip_validation: false,
        }
    }
}

/// An opened V6 image.
pub struct Filesystem {
    superblock: Superblock,
    geometry: InodeGeometry,
    cache: SectorCache<Box<dyn SectorStore>>,
    files: DescriptorTable,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("superblock", &self.superblock)
            .field("geometry", &self.geometry)
            .field("cache_capacity", &self.cache.capacity())
            .field("dev_len", &self.cache.len_bytes())
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Open an image file with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let store = FileSectorStore::open(path.as_ref())?;
        Self::from_store(Box::new(store), options)
    }

    /// Mount an already-opened sector store.
    pub fn from_store(store: Box<dyn SectorStore>, options: &OpenOptions) -> Result<Self> {
        let mut cache = SectorCache::with_budget_kb(store, options.cache_kb)?;
        let sector = cache.read_sector(SUPERBLOCK_SECTOR)?;
        let superblock = Superblock::parse_from_sector(sector.valid_bytes())
            .map_err(|e| V6Error::Format(format!("superblock: {e}")))?;
        if !options.skip_validation {
            superblock
                .validate(cache.len_bytes() / SECTOR_SIZE as u64)
                .map_err(|e| V6Error::Format(format!("superblock: {e}")))?;
        }
        let geometry = InodeGeometry::from_superblock(&superblock);
        info!(
            target: "v6fs::mount",
            isize = superblock.isize,
            fsize = superblock.fsize,
            inodes = geometry.inode_count(),
            cache_sectors = cache.capacity(),
            dev_len = cache.len_bytes(),
            "mounted"
        );
        Ok(Self {
            superblock,
            geometry,
            cache,
            files: DescriptorTable::new(),
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub fn geometry(&self) -> &InodeGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn inode_count(&self) -> u32 {
        self.geometry.inode_count()
    }

    /// Size of the underlying store in bytes.
    #[must_use]
    pub fn device_len(&self) -> u64 {
        self.cache.len_bytes()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    #[must_use]
    pub fn fileops_stats(&self) -> FileopsStats {
        self.files.stats()
    }

    /// Read one sector through the cache.
    pub fn read_sector(&mut self, sector: SectorNumber) -> Result<Vec<u8>> {
        Ok(self.cache.read_sector(sector)?.valid_bytes().to_vec())
    }

    // ── Inodes and blocks ─────────────────────────────────────────────

    /// Fetch an allocated inode.
    pub fn read_inode(&mut self, ino: InodeNumber) -> Result<Inode> {
        v6fs_inode::fetch(&mut self.cache, &self.geometry, ino)
    }

    /// Fetch an inode record whether or not it is allocated.
    pub fn read_inode_raw(&mut self, ino: InodeNumber) -> Result<Inode> {
        v6fs_inode::fetch_raw(&mut self.cache, &self.geometry, ino)
    }

    pub fn resolve_block(&mut self, inode: &Inode, block: u32) -> Result<SectorNumber> {
        v6fs_inode::resolve_block(&mut self.cache, inode, block)
    }

    /// Logical block `block` of inode `ino` with its valid byte count.
    pub fn read_block(&mut self, ino: InodeNumber, block: u32) -> Result<FileBlock> {
        v6fs_inode::read_block(&mut self.cache, &self.geometry, ino, block)
    }

    /// Whole content of inode `ino`.
    pub fn read_file(&mut self, ino: InodeNumber) -> Result<Vec<u8>> {
        let inode = self.read_inode(ino)?;
        let mut out = Vec::with_capacity(inode.size() as usize);
        for block in 0..block_count(&inode) {
            let data = v6fs_inode::read_inode_block(&mut self.cache, &inode, block)?;
            out.extend_from_slice(data.bytes());
        }
        Ok(out)
    }

    // ── Directories and paths ─────────────────────────────────────────

    /// Look up `name` in directory `dir`. `Ok(None)` means absent.
    pub fn lookup(&mut self, dir: InodeNumber, name: &[u8]) -> Result<Option<DirEntry>> {
        v6fs_dir::find_by_name(&mut self.cache, &self.geometry, dir, name)
    }

    /// Live entries of directory `dir` in on-disk order.
    pub fn read_dir(&mut self, dir: InodeNumber) -> Result<Vec<DirEntry>> {
        v6fs_dir::read_dir(&mut self.cache, &self.geometry, dir)
    }

    pub fn resolve_path(&mut self, path: &str) -> Result<InodeNumber> {
        path::resolve_path(&mut self.cache, &self.geometry, path)
    }

    /// Resolve `path` and fetch its inode.
    pub fn stat_path(&mut self, path: &str) -> Result<(InodeNumber, Inode)> {
        let ino = self.resolve_path(path)?;
        Ok((ino, self.read_inode(ino)?))
    }

    // ── Descriptors ───────────────────────────────────────────────────

    pub fn open_file(&mut self, path: &str) -> Result<Fd> {
        self.files.open(path)
    }

    /// Next byte from `fd`, `None` at end of file.
    pub fn getchar(&mut self, fd: Fd) -> Result<Option<u8>> {
        let Self {
            cache,
            geometry,
            files,
            ..
        } = self;
        files.getchar(cache, geometry, fd)
    }

    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let Self {
            cache,
            geometry,
            files,
            ..
        } = self;
        files.read(cache, geometry, fd, buf)
    }

    pub fn tell(&self, fd: Fd) -> Result<u32> {
        self.files.tell(fd)
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        self.files.close(fd)
    }

    pub fn is_regular_file(&mut self, path: &str) -> bool {
        let Self {
            cache,
            geometry,
            files,
            ..
        } = self;
        files.is_regular_file(cache, geometry, path)
    }

    #[must_use]
    pub fn open_file_count(&self) -> usize {
        self.files.open_count()
    }
}

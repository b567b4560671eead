//! Descriptor table: Unix-style open/read/close over pathnames.
//!
//! A descriptor remembers only its pathname until the first byte is read;
//! the path is then resolved once and the inode number and size are kept
//! in the slot for the descriptor's lifetime. Each slot also holds the last
//! file block it read so sequential byte reads touch the block layer once
//! per block.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use v6fs_block::SectorStore;
use v6fs_error::{Result, V6Error};
use v6fs_inode::{FileBlock, InodeGeometry, fetch, read_block};
use v6fs_types::{InodeNumber, SECTOR_SIZE};

use crate::path::resolve_path;

/// Compiled-in size of the descriptor table.
pub const MAX_OPEN_FILES: usize = 64;

/// Handle returned by `open`. A handle is tied to one use of its slot: once
/// closed, it is rejected even if the slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd {
    slot: usize,
    generation: u64,
}

impl Fd {
    /// Table slot this descriptor occupies.
    #[must_use]
    pub fn slot(self) -> usize {
        self.slot
    }
}

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd{}#{}", self.slot, self.generation)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileopsStats {
    pub opens: u64,
    pub reads: u64,
    pub getchars: u64,
    pub isfiles: u64,
}

#[derive(Debug, Clone, Copy)]
struct Resolved {
    ino: InodeNumber,
    size: u32,
}

#[derive(Debug)]
struct OpenFile {
    path: String,
    generation: u64,
    cursor: u32,
    resolved: Option<Resolved>,
    /// Last block read for this descriptor and its logical index.
    block: Option<(u32, FileBlock)>,
}

#[derive(Debug)]
pub struct DescriptorTable {
    slots: Vec<Option<OpenFile>>,
    next_generation: u64,
    stats: FileopsStats,
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_OPEN_FILES).map(|_| None).collect(),
            next_generation: 1,
            stats: FileopsStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> FileopsStats {
        self.stats
    }

    /// Number of descriptors currently open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn slot(&self, fd: Fd) -> Result<&OpenFile> {
        match self.slots.get(fd.slot) {
            Some(Some(file)) if file.generation == fd.generation => Ok(file),
            _ => Err(V6Error::BadDescriptor(fd.to_string())),
        }
    }

    fn slot_mut(&mut self, fd: Fd) -> Result<&mut OpenFile> {
        match self.slots.get_mut(fd.slot) {
            Some(Some(file)) if file.generation == fd.generation => Ok(file),
            _ => Err(V6Error::BadDescriptor(fd.to_string())),
        }
    }

    /// Claim the lowest free slot for `path`. Resolution is deferred to the
    /// first read.
    pub fn open(&mut self, path: &str) -> Result<Fd> {
        self.stats.opens += 1;
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(V6Error::NoFreeDescriptor)?;
        let generation = self.next_generation;
        self.next_generation += 1;
        self.slots[slot] = Some(OpenFile {
            path: path.to_owned(),
            generation,
            cursor: 0,
            resolved: None,
            block: None,
        });
        let fd = Fd { slot, generation };
        debug!(target: "v6fs::fileops", %fd, path, "open");
        Ok(fd)
    }

    /// Next byte of the file, or `None` at end of file.
    pub fn getchar(
        &mut self,
        dev: &mut dyn SectorStore,
        geom: &InodeGeometry,
        fd: Fd,
    ) -> Result<Option<u8>> {
        self.stats.getchars += 1;
        let file = self.slot_mut(fd)?;

        let resolved = match file.resolved {
            Some(resolved) => resolved,
            None => {
                let ino = resolve_path(dev, geom, &file.path)?;
                let inode = fetch(dev, geom, ino)?;
                let resolved = Resolved {
                    ino,
                    size: inode.size(),
                };
                debug!(
                    target: "v6fs::fileops",
                    %fd,
                    ino = ino.0,
                    size = resolved.size,
                    "descriptor resolved"
                );
                file.resolved = Some(resolved);
                resolved
            }
        };

        if file.cursor >= resolved.size {
            return Ok(None);
        }
        let block = file.cursor / SECTOR_SIZE as u32;
        let offset = file.cursor as usize % SECTOR_SIZE;

        let cached = matches!(&file.block, Some((b, _)) if *b == block);
        if !cached {
            trace!(target: "v6fs::fileops", %fd, block, "block load");
            let data = read_block(dev, geom, resolved.ino, block)?;
            file.block = Some((block, data));
        }
        let byte = file
            .block
            .as_ref()
            .and_then(|(_, data)| data.bytes().get(offset).copied())
            .ok_or_else(|| {
                V6Error::Format(format!(
                    "inode {} block {block} shorter than its file size",
                    resolved.ino
                ))
            })?;
        file.cursor += 1;
        Ok(Some(byte))
    }

    /// Fill `buf` byte by byte until it is full or the file ends. Returns the
    /// number of bytes stored. An error after some bytes were read yields the
    /// partial count; the error resurfaces on the next call.
    pub fn read(
        &mut self,
        dev: &mut dyn SectorStore,
        geom: &InodeGeometry,
        fd: Fd,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.stats.reads += 1;
        let mut n = 0;
        while n < buf.len() {
            match self.getchar(dev, geom, fd) {
                Ok(Some(byte)) => {
                    buf[n] = byte;
                    n += 1;
                }
                Ok(None) => break,
                Err(err) if n == 0 => return Err(err),
                Err(err) => {
                    debug!(target: "v6fs::fileops", %fd, n, error = %err, "short read");
                    break;
                }
            }
        }
        Ok(n)
    }

    /// Current cursor position.
    pub fn tell(&self, fd: Fd) -> Result<u32> {
        Ok(self.slot(fd)?.cursor)
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        self.slot(fd)?;
        self.slots[fd.slot] = None;
        debug!(target: "v6fs::fileops", %fd, "close");
        Ok(())
    }

    /// Whether `path` names an allocated plain file. Lookup failures of any
    /// kind answer `false`.
    pub fn is_regular_file(
        &mut self,
        dev: &mut dyn SectorStore,
        geom: &InodeGeometry,
        path: &str,
    ) -> bool {
        self.stats.isfiles += 1;
        let inode = resolve_path(dev, geom, path).and_then(|ino| fetch(dev, geom, ino));
        match inode {
            Ok(inode) => inode.is_allocated() && inode.is_regular(),
            Err(err) => {
                debug!(target: "v6fs::fileops", path, error = %err, "isfile lookup failed");
                false
            }
        }
    }
}

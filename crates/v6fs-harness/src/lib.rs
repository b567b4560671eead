#![forbid(unsafe_code)]
//! Test and tooling support for v6fs.
//!
//! [`ImageBuilder`] lays out complete V6 images in memory from a tree of
//! directories and files. [`CountingStore`] wraps any sector store and logs
//! every sector read so tests can assert on I/O cost after the store has
//! been handed to a cache.

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use v6fs_block::{MemSectorStore, SectorBuf, SectorStore};
use v6fs_ondisk::{DirEntry, Inode, Superblock, inode_position};
use v6fs_types::{
    DOUBLE_INDIRECT_SLOT, IALLOC, IFDIR, IFMT, ILARG, INODE_ADDR_SLOTS, INODE_SIZE,
    INODE_START_SECTOR, INODES_PER_SECTOR, InodeNumber, MAX_LARGE_FILE_BLOCK,
    POINTERS_PER_SECTOR, SECTOR_SIZE, SINGLE_INDIRECT_SLOTS, SectorNumber,
};

// ── I/O accounting ──────────────────────────────────────────────────────────

/// Shared record of the sectors a [`CountingStore`] was asked to read.
#[derive(Debug, Clone, Default)]
pub struct ReadLog(Arc<Mutex<Vec<u32>>>);

impl ReadLog {
    #[must_use]
    pub fn count(&self) -> usize {
        self.0.lock().len()
    }

    /// Sectors read, in order.
    #[must_use]
    pub fn sectors(&self) -> Vec<u32> {
        self.0.lock().clone()
    }

    #[must_use]
    pub fn count_of(&self, sector: u32) -> usize {
        self.0.lock().iter().filter(|&&s| s == sector).count()
    }

    pub fn reset(&self) {
        self.0.lock().clear();
    }
}

/// Store wrapper that logs every read into a [`ReadLog`].
#[derive(Debug)]
pub struct CountingStore<S> {
    inner: S,
    log: ReadLog,
}

impl<S: SectorStore> CountingStore<S> {
    /// Wrap `inner`, returning the store and a handle on its read log.
    pub fn new(inner: S) -> (Self, ReadLog) {
        let log = ReadLog::default();
        (
            Self {
                inner,
                log: log.clone(),
            },
            log,
        )
    }
}

impl<S: SectorStore> SectorStore for CountingStore<S> {
    fn read_sector(&mut self, sector: SectorNumber) -> v6fs_error::Result<SectorBuf> {
        self.log.0.lock().push(sector.0);
        self.inner.read_sector(sector)
    }

    fn write_sector(&mut self, sector: SectorNumber, data: &[u8]) -> v6fs_error::Result<usize> {
        self.inner.write_sector(sector, data)
    }

    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }
}

// ── Image synthesis ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Content {
    Dir(Vec<DirEntry>),
    Data(Vec<u8>),
    Empty,
}

#[derive(Debug, Clone)]
struct Node {
    mode: u16,
    nlink: u8,
    uid: u8,
    gid: u8,
    atime: u32,
    mtime: u32,
    content: Content,
    force_large: bool,
}

impl Node {
    fn new(mode: u16, content: Content) -> Self {
        Self {
            mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            content,
            force_large: false,
        }
    }
}

/// Summary of a built image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub inode_sectors: u16,
    pub inodes_used: u32,
    pub total_sectors: u32,
}

/// In-memory V6 image synthesizer.
///
/// Inode 1 is the root directory. Directories get `.` and `..` entries.
/// Files of more than eight blocks are laid out as large files (single and,
/// past 1792 blocks, double indirect); smaller files use direct addresses
/// unless added with [`add_large_file`](Self::add_large_file).
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    inode_sectors: u16,
    nodes: Vec<Option<Node>>,
    time: u32,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(inode_sectors: u16) -> Self {
        let root = Node {
            nlink: 2,
            ..Node::new(
                IALLOC | IFDIR | 0o755,
                Content::Dir(vec![DirEntry::new(1, b"."), DirEntry::new(1, b"..")]),
            )
        };
        Self {
            inode_sectors,
            nodes: vec![Some(root)],
            time: 0,
        }
    }

    /// Superblock timestamp.
    pub fn set_time(&mut self, time: u32) {
        self.time = time;
    }

    fn capacity(&self) -> u32 {
        u32::from(self.inode_sectors) * INODES_PER_SECTOR as u32
    }

    fn node_mut(&mut self, ino: InodeNumber) -> Result<&mut Node> {
        let index = (ino.0 as usize)
            .checked_sub(1)
            .context("inode numbers start at 1")?;
        self.nodes
            .get_mut(index)
            .and_then(Option::as_mut)
            .with_context(|| format!("no inode {ino}"))
    }

    fn alloc(&mut self, node: Node) -> Result<InodeNumber> {
        let ino = u32::try_from(self.nodes.len() + 1)?;
        if ino > self.capacity() || ino > u32::from(u16::MAX) {
            bail!("inode list full ({} inodes)", self.capacity());
        }
        self.nodes.push(Some(node));
        Ok(InodeNumber(ino))
    }

    /// Reject bad names and non-directory parents before anything is
    /// allocated.
    fn check_link(&mut self, parent: InodeNumber, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            bail!("invalid entry name {name:?}");
        }
        if !matches!(self.node_mut(parent)?.content, Content::Dir(_)) {
            bail!("inode {parent} is not a directory");
        }
        Ok(())
    }

    fn link(&mut self, parent: InodeNumber, ino: InodeNumber, name: &str) -> Result<()> {
        self.add_raw_entry(parent, u16::try_from(ino.0)?, name.as_bytes())
    }

    /// Append a directory entry with arbitrary name bytes (truncated to 14)
    /// and inode number. Inode 0 writes a free slot.
    pub fn add_raw_entry(&mut self, dir: InodeNumber, ino: u16, name: &[u8]) -> Result<()> {
        match &mut self.node_mut(dir)?.content {
            Content::Dir(entries) => {
                entries.push(DirEntry::new(ino, name));
                Ok(())
            }
            _ => bail!("inode {dir} is not a directory"),
        }
    }

    pub fn mkdir(&mut self, parent: InodeNumber, name: &str) -> Result<InodeNumber> {
        let parent_num = u16::try_from(parent.0)?;
        let next = u16::try_from(self.nodes.len() + 1)?;
        let node = Node {
            nlink: 2,
            ..Node::new(
                IALLOC | IFDIR | 0o755,
                Content::Dir(vec![
                    DirEntry::new(next, b"."),
                    DirEntry::new(parent_num, b".."),
                ]),
            )
        };
        self.check_link(parent, name)?;
        let ino = self.alloc(node)?;
        self.link(parent, ino, name)?;
        let parent_node = self.node_mut(parent)?;
        parent_node.nlink = parent_node.nlink.saturating_add(1);
        Ok(ino)
    }

    pub fn add_file(
        &mut self,
        parent: InodeNumber,
        name: &str,
        content: &[u8],
    ) -> Result<InodeNumber> {
        self.add_file_node(parent, name, content, false)
    }

    /// Add a file laid out with indirect blocks regardless of its size.
    pub fn add_large_file(
        &mut self,
        parent: InodeNumber,
        name: &str,
        content: &[u8],
    ) -> Result<InodeNumber> {
        self.add_file_node(parent, name, content, true)
    }

    fn add_file_node(
        &mut self,
        parent: InodeNumber,
        name: &str,
        content: &[u8],
        force_large: bool,
    ) -> Result<InodeNumber> {
        if content.len() > 0x00FF_FFFF {
            bail!("file {name:?} exceeds the 24-bit size field");
        }
        self.check_link(parent, name)?;
        let node = Node {
            force_large,
            ..Node::new(IALLOC | 0o644, Content::Data(content.to_vec()))
        };
        let ino = self.alloc(node)?;
        self.link(parent, ino, name)?;
        Ok(ino)
    }

    /// Add a device node. `format` is one of the `IFMT` encodings.
    pub fn add_special(
        &mut self,
        parent: InodeNumber,
        name: &str,
        format: u16,
    ) -> Result<InodeNumber> {
        self.check_link(parent, name)?;
        let ino = self.alloc(Node::new(IALLOC | (format & IFMT) | 0o600, Content::Empty))?;
        self.link(parent, ino, name)?;
        Ok(ino)
    }

    /// Clear the allocated flag of `ino`, leaving entries that name it.
    pub fn free_inode(&mut self, ino: InodeNumber) {
        if let Ok(node) = self.node_mut(ino) {
            node.mode &= !IALLOC;
        }
    }

    pub fn set_owner(&mut self, ino: InodeNumber, uid: u8, gid: u8) -> Result<()> {
        let node = self.node_mut(ino)?;
        node.uid = uid;
        node.gid = gid;
        Ok(())
    }

    pub fn set_times(&mut self, ino: InodeNumber, atime: u32, mtime: u32) -> Result<()> {
        let node = self.node_mut(ino)?;
        node.atime = atime;
        node.mtime = mtime;
        Ok(())
    }

    /// Serialize the image.
    pub fn build(&self) -> Result<Vec<u8>> {
        Ok(self.build_with_summary()?.0)
    }

    pub fn build_store(&self) -> Result<MemSectorStore> {
        Ok(MemSectorStore::new(self.build()?))
    }

    pub fn build_with_summary(&self) -> Result<(Vec<u8>, ImageSummary)> {
        if self.inode_sectors == 0 {
            bail!("inode list must have at least one sector");
        }
        let data_start = INODE_START_SECTOR.0 as usize + usize::from(self.inode_sectors);
        let mut layout = Layout {
            sectors: vec![vec![0_u8; SECTOR_SIZE]; data_start],
        };

        let mut inodes = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.iter().flatten() {
            let bytes = match &node.content {
                Content::Dir(entries) => entries.iter().flat_map(DirEntry::to_bytes).collect(),
                Content::Data(data) => data.clone(),
                Content::Empty => Vec::new(),
            };
            let mut inode = Inode {
                mode: node.mode,
                nlink: node.nlink,
                uid: node.uid,
                gid: node.gid,
                size_high: 0,
                size_low: 0,
                addr: [0; INODE_ADDR_SLOTS],
                atime: node.atime,
                mtime: node.mtime,
            };
            inode.set_size(u32::try_from(bytes.len())?);
            layout.place(&mut inode, &bytes, node.force_large)?;
            inodes.push(inode);
        }

        let total = layout.sectors.len();
        let superblock = Superblock {
            isize: self.inode_sectors,
            fsize: u16::try_from(total).context("image exceeds 65535 sectors")?,
            nfree: 0,
            ninode: 0,
            flock: 0,
            ilock: 0,
            fmod: 0,
            ronly: 0,
            time: self.time,
        };
        layout.sectors[1] = superblock.to_sector();
        for (index, inode) in inodes.iter().enumerate() {
            let ino = InodeNumber(u32::try_from(index + 1)?);
            let (rel, offset) =
                inode_position(ino).with_context(|| format!("inode {ino} has no slot"))?;
            let sector = &mut layout.sectors[INODE_START_SECTOR.0 as usize + rel as usize];
            sector[offset..offset + INODE_SIZE].copy_from_slice(&inode.to_bytes());
        }

        let summary = ImageSummary {
            inode_sectors: self.inode_sectors,
            inodes_used: u32::try_from(inodes.len())?,
            total_sectors: u32::try_from(total)?,
        };
        Ok((layout.sectors.concat(), summary))
    }
}

/// Sector allocator used while building.
struct Layout {
    sectors: Vec<Vec<u8>>,
}

impl Layout {
    fn push(&mut self, data: Vec<u8>) -> Result<u16> {
        let sector = u16::try_from(self.sectors.len()).context("image exceeds 65535 sectors")?;
        self.sectors.push(data);
        Ok(sector)
    }

    fn push_pointers(&mut self, pointers: &[u16]) -> Result<u16> {
        let mut data = vec![0_u8; SECTOR_SIZE];
        for (i, p) in pointers.iter().enumerate() {
            data[i * 2..i * 2 + 2].copy_from_slice(&p.to_le_bytes());
        }
        self.push(data)
    }

    fn place(&mut self, inode: &mut Inode, bytes: &[u8], force_large: bool) -> Result<()> {
        let mut blocks = Vec::new();
        for chunk in bytes.chunks(SECTOR_SIZE) {
            let mut data = chunk.to_vec();
            data.resize(SECTOR_SIZE, 0);
            blocks.push(self.push(data)?);
        }

        if !force_large && blocks.len() <= INODE_ADDR_SLOTS {
            inode.mode &= !ILARG;
            inode.addr[..blocks.len()].copy_from_slice(&blocks);
            return Ok(());
        }

        if blocks.len() > MAX_LARGE_FILE_BLOCK as usize + 1 {
            bail!("{} blocks exceed the large-file limit", blocks.len());
        }
        inode.mode |= ILARG;
        let single_span = SINGLE_INDIRECT_SLOTS * POINTERS_PER_SECTOR;
        let (single, rest) = blocks.split_at(blocks.len().min(single_span));
        for (slot, chunk) in single.chunks(POINTERS_PER_SECTOR).enumerate() {
            inode.addr[slot] = self.push_pointers(chunk)?;
        }
        if !rest.is_empty() {
            let mut indirects = Vec::new();
            for chunk in rest.chunks(POINTERS_PER_SECTOR) {
                indirects.push(self.push_pointers(chunk)?);
            }
            inode.addr[DOUBLE_INDIRECT_SLOT] = self.push_pointers(&indirects)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use v6fs_ondisk::parse_dir_block;

    fn inode_at(image: &[u8], ino: u32) -> Inode {
        let (rel, off) = inode_position(InodeNumber(ino)).unwrap();
        let base = (2 + rel as usize) * SECTOR_SIZE + off;
        Inode::parse_from_bytes(&image[base..base + INODE_SIZE]).unwrap()
    }

    #[test]
    fn empty_image_has_root_directory() {
        let (image, summary) = ImageBuilder::new(1).build_with_summary().unwrap();
        assert_eq!(summary.inodes_used, 1);
        assert_eq!(summary.total_sectors, 4);
        assert_eq!(image.len(), 4 * SECTOR_SIZE);
        let sb = Superblock::parse_from_sector(&image[SECTOR_SIZE..2 * SECTOR_SIZE]).unwrap();
        assert_eq!(sb.isize, 1);
        assert_eq!(sb.fsize, 4);
        let root = inode_at(&image, 1);
        assert!(root.is_dir() && root.is_allocated());
        assert_eq!(root.size(), 32);
        assert_eq!(root.addr[0], 3);
        let entries = parse_dir_block(&image[3 * SECTOR_SIZE..], 32).unwrap();
        assert_eq!(entries[0].name_bytes(), b".");
        assert_eq!(entries[1].name_bytes(), b"..");
    }

    #[test]
    fn small_and_large_layouts() {
        let mut b = ImageBuilder::new(1);
        b.add_file(InodeNumber::ROOT, "small", &[1; 8 * 512]).unwrap();
        b.add_file(InodeNumber::ROOT, "large", &[2; 8 * 512 + 1]).unwrap();
        b.add_large_file(InodeNumber::ROOT, "forced", b"tiny").unwrap();
        let image = b.build().unwrap();
        assert!(!inode_at(&image, 2).is_large());
        let large = inode_at(&image, 3);
        assert!(large.is_large());
        assert_ne!(large.addr[0], 0);
        assert_eq!(large.addr[1], 0);
        let forced = inode_at(&image, 4);
        assert!(forced.is_large());
        assert_eq!(forced.size(), 4);
    }

    #[test]
    fn double_indirect_layout() {
        let blocks = SINGLE_INDIRECT_SLOTS * POINTERS_PER_SECTOR + 3;
        let mut b = ImageBuilder::new(1);
        b.add_file(InodeNumber::ROOT, "huge", &vec![7; blocks * SECTOR_SIZE]).unwrap();
        let image = b.build().unwrap();
        let huge = inode_at(&image, 2);
        assert!(huge.addr.iter().all(|&a| a != 0));
        let double = usize::from(huge.addr[7]) * SECTOR_SIZE;
        let first = u16::from_le_bytes([image[double], image[double + 1]]);
        assert_ne!(first, 0);
        assert_eq!(&image[double + 2..double + 4], &[0, 0]);
    }

    #[test]
    fn inode_list_overflow_is_reported() {
        let mut b = ImageBuilder::new(1);
        for i in 0..15 {
            b.add_file(InodeNumber::ROOT, &format!("f{i}"), b"").unwrap();
        }
        assert!(b.add_file(InodeNumber::ROOT, "one_too_many", b"").is_err());
    }

    #[test]
    fn cannot_add_into_a_file() {
        let mut b = ImageBuilder::new(1);
        let f = b.add_file(InodeNumber::ROOT, "f", b"x").unwrap();
        assert!(b.mkdir(f, "d").is_err());
        assert!(b.add_file(f, "g", b"").is_err());
        assert!(b.add_raw_entry(f, 1, b"h").is_err());
        assert!(b.add_file(InodeNumber::ROOT, "a/b", b"").is_err());
    }

    #[test]
    fn counting_store_logs_reads() {
        let (mut store, log) = CountingStore::new(MemSectorStore::new(vec![0; 4 * SECTOR_SIZE]));
        store.read_sector(SectorNumber(2)).unwrap();
        store.read_sector(SectorNumber(2)).unwrap();
        store.read_sector(SectorNumber(0)).unwrap();
        assert_eq!(log.sectors(), vec![2, 2, 0]);
        assert_eq!(log.count_of(2), 2);
        log.reset();
        assert_eq!(log.count(), 0);
    }
}

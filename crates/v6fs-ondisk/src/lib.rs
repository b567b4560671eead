#![forbid(unsafe_code)]
//! On-disk format parsing for Unix V6 structures.
//!
//! Pure parsing crate: no I/O. Turns byte slices into typed superblock,
//! inode, and directory-entry values by reading fixed byte ranges, and
//! encodes them back for image construction.

use serde::{Deserialize, Serialize};
use v6fs_types::{
    DIRENT_NAME_LEN, DIRENT_SIZE, IALLOC, IFBLK, IFCHR, IFDIR, IFMT, ILARG, INODE_ADDR_SLOTS,
    INODE_SIZE, INODES_PER_SECTOR, INODE_START_SECTOR, ISGID, ISUID, ISVTX, InodeNumber,
    PERMISSION_MASK, ParseError, SECTOR_SIZE, ensure_slice, read_fixed, read_le_u16,
    read_split_u32, read_u8, trim_nul_padded,
};

// ── Superblock ──────────────────────────────────────────────────────────────

const SB_ISIZE: usize = 0;
const SB_FSIZE: usize = 2;
const SB_NFREE: usize = 4;
const SB_NINODE: usize = 206;
const SB_FLOCK: usize = 408;
const SB_ILOCK: usize = 409;
const SB_FMOD: usize = 410;
const SB_RONLY: usize = 411;
const SB_TIME: usize = 412;
/// Bytes of the superblock that carry fields.
const SB_USED_LEN: usize = 416;

/// V6 superblock (sector 1). Only the fields a reader needs are decoded;
/// the free lists are left on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    /// Number of sectors in the inode list.
    pub isize: u16,
    /// Filesystem size in sectors.
    pub fsize: u16,
    pub nfree: u16,
    pub ninode: u16,
    pub flock: u8,
    pub ilock: u8,
    pub fmod: u8,
    pub ronly: u8,
    /// Last superblock update, seconds since the epoch.
    pub time: u32,
}

impl Superblock {
    pub fn parse_from_sector(sector: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(sector, 0, SB_USED_LEN)?;
        Ok(Self {
            isize: read_le_u16(sector, SB_ISIZE)?,
            fsize: read_le_u16(sector, SB_FSIZE)?,
            nfree: read_le_u16(sector, SB_NFREE)?,
            ninode: read_le_u16(sector, SB_NINODE)?,
            flock: read_u8(sector, SB_FLOCK)?,
            ilock: read_u8(sector, SB_ILOCK)?,
            fmod: read_u8(sector, SB_FMOD)?,
            ronly: read_u8(sector, SB_RONLY)?,
            time: read_split_u32(sector, SB_TIME)?,
        })
    }

    /// Encode into a full zero-filled sector.
    #[must_use]
    pub fn to_sector(&self) -> Vec<u8> {
        let mut out = vec![0_u8; SECTOR_SIZE];
        out[SB_ISIZE..SB_ISIZE + 2].copy_from_slice(&self.isize.to_le_bytes());
        out[SB_FSIZE..SB_FSIZE + 2].copy_from_slice(&self.fsize.to_le_bytes());
        out[SB_NFREE..SB_NFREE + 2].copy_from_slice(&self.nfree.to_le_bytes());
        out[SB_NINODE..SB_NINODE + 2].copy_from_slice(&self.ninode.to_le_bytes());
        out[SB_FLOCK] = self.flock;
        out[SB_ILOCK] = self.ilock;
        out[SB_FMOD] = self.fmod;
        out[SB_RONLY] = self.ronly;
        write_split_u32(&mut out, SB_TIME, self.time);
        out
    }

    /// Largest valid inode number.
    #[must_use]
    pub fn inode_count(&self) -> u32 {
        u32::from(self.isize) * INODES_PER_SECTOR as u32
    }

    /// First sector past the inode list.
    #[must_use]
    pub fn data_start_sector(&self) -> u32 {
        INODE_START_SECTOR.0 + u32::from(self.isize)
    }

    /// Geometry checks a mount performs before trusting the image.
    ///
    /// `device_sectors` is the number of whole sectors the store holds.
    pub fn validate(&self, device_sectors: u64) -> Result<(), ParseError> {
        if self.isize == 0 {
            return Err(ParseError::InvalidField {
                field: "s_isize",
                reason: "inode list is empty",
            });
        }
        let data_start = u64::from(self.data_start_sector());
        if data_start > device_sectors {
            return Err(ParseError::InvalidField {
                field: "s_isize",
                reason: "inode list extends past end of device",
            });
        }
        if self.fsize != 0 && u64::from(self.fsize) < data_start {
            return Err(ParseError::InvalidField {
                field: "s_fsize",
                reason: "filesystem smaller than its inode list",
            });
        }
        Ok(())
    }
}

// ── Inodes ──────────────────────────────────────────────────────────────────

const I_MODE: usize = 0;
const I_NLINK: usize = 2;
const I_UID: usize = 3;
const I_GID: usize = 4;
const I_SIZE0: usize = 5;
const I_SIZE1: usize = 6;
const I_ADDR: usize = 8;
const I_ATIME: usize = 24;
const I_MTIME: usize = 28;

/// File type encoded in the `IFMT` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InodeKind {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
}

/// Decoded 32-byte inode record. A value of this type is a snapshot; it is
/// never written back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub mode: u16,
    pub nlink: u8,
    pub uid: u8,
    pub gid: u8,
    /// High part of the size (`i_size0`).
    pub size_high: u8,
    /// Low 16 bits of the size (`i_size1`).
    pub size_low: u16,
    pub addr: [u16; INODE_ADDR_SLOTS],
    pub atime: u32,
    pub mtime: u32,
}

impl Inode {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INODE_SIZE)?;
        let mut addr = [0_u16; INODE_ADDR_SLOTS];
        for (i, slot) in addr.iter_mut().enumerate() {
            *slot = read_le_u16(bytes, I_ADDR + i * 2)?;
        }
        Ok(Self {
            mode: read_le_u16(bytes, I_MODE)?,
            nlink: read_u8(bytes, I_NLINK)?,
            uid: read_u8(bytes, I_UID)?,
            gid: read_u8(bytes, I_GID)?,
            size_high: read_u8(bytes, I_SIZE0)?,
            size_low: read_le_u16(bytes, I_SIZE1)?,
            addr,
            atime: read_split_u32(bytes, I_ATIME)?,
            mtime: read_split_u32(bytes, I_MTIME)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut out = [0_u8; INODE_SIZE];
        out[I_MODE..I_MODE + 2].copy_from_slice(&self.mode.to_le_bytes());
        out[I_NLINK] = self.nlink;
        out[I_UID] = self.uid;
        out[I_GID] = self.gid;
        out[I_SIZE0] = self.size_high;
        out[I_SIZE1..I_SIZE1 + 2].copy_from_slice(&self.size_low.to_le_bytes());
        for (i, addr) in self.addr.iter().enumerate() {
            let off = I_ADDR + i * 2;
            out[off..off + 2].copy_from_slice(&addr.to_le_bytes());
        }
        write_split_u32(&mut out, I_ATIME, self.atime);
        write_split_u32(&mut out, I_MTIME, self.mtime);
        out
    }

    /// File size in bytes: `(size_high << 16) | size_low`.
    #[must_use]
    pub fn size(&self) -> u32 {
        (u32::from(self.size_high) << 16) | u32::from(self.size_low)
    }

    /// Split `size` into the two packed fields. Sizes above 24 bits are
    /// truncated to what the format can hold.
    pub fn set_size(&mut self, size: u32) {
        self.size_high = ((size >> 16) & 0xFF) as u8;
        self.size_low = (size & 0xFFFF) as u16;
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.mode & IALLOC != 0
    }

    /// Large files address their data through indirect sectors.
    #[must_use]
    pub fn is_large(&self) -> bool {
        self.mode & ILARG != 0
    }

    #[must_use]
    pub fn kind(&self) -> InodeKind {
        match self.mode & IFMT {
            IFDIR => InodeKind::Directory,
            IFCHR => InodeKind::CharDevice,
            IFBLK => InodeKind::BlockDevice,
            _ => InodeKind::Regular,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind() == InodeKind::Directory
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.kind() == InodeKind::Regular
    }

    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & PERMISSION_MASK
    }

    #[must_use]
    pub fn is_setuid(&self) -> bool {
        self.mode & ISUID != 0
    }

    #[must_use]
    pub fn is_setgid(&self) -> bool {
        self.mode & ISGID != 0
    }

    #[must_use]
    pub fn is_sticky(&self) -> bool {
        self.mode & ISVTX != 0
    }

    #[must_use]
    pub fn atime_system_time(&self) -> std::time::SystemTime {
        to_system_time(self.atime)
    }

    #[must_use]
    pub fn mtime_system_time(&self) -> std::time::SystemTime {
        to_system_time(self.mtime)
    }
}

fn to_system_time(secs: u32) -> std::time::SystemTime {
    std::time::UNIX_EPOCH + std::time::Duration::from_secs(u64::from(secs))
}

fn write_split_u32(out: &mut [u8], offset: usize, value: u32) {
    let high = (value >> 16) as u16;
    let low = (value & 0xFFFF) as u16;
    out[offset..offset + 2].copy_from_slice(&high.to_le_bytes());
    out[offset + 2..offset + 4].copy_from_slice(&low.to_le_bytes());
}

/// Byte offset of inode `ino` within its sector of the inode list, and the
/// sector index relative to the start of the list. `None` for inode 0,
/// which has no slot in the list.
#[must_use]
pub fn inode_position(ino: InodeNumber) -> Option<(u32, usize)> {
    let index = ino.0.checked_sub(1)? as usize;
    let byte = index * INODE_SIZE;
    Some(((byte / SECTOR_SIZE) as u32, byte % SECTOR_SIZE))
}

// ── Directory entries ───────────────────────────────────────────────────────

/// One 16-byte directory record: inode number plus a fixed 14-byte name
/// that is NUL-padded when shorter and unterminated when exactly 14 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub inode: u16,
    pub name: [u8; DIRENT_NAME_LEN],
}

impl DirEntry {
    /// Build an entry, truncating `name` to the field width.
    #[must_use]
    pub fn new(inode: u16, name: &[u8]) -> Self {
        let mut field = [0_u8; DIRENT_NAME_LEN];
        let len = name.len().min(DIRENT_NAME_LEN);
        field[..len].copy_from_slice(&name[..len]);
        Self { inode, name: field }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            inode: read_le_u16(bytes, 0)?,
            name: read_fixed::<DIRENT_NAME_LEN>(bytes, 2)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; DIRENT_SIZE] {
        let mut out = [0_u8; DIRENT_SIZE];
        out[..2].copy_from_slice(&self.inode.to_le_bytes());
        out[2..].copy_from_slice(&self.name);
        out
    }

    /// A zero inode number marks a free slot.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.inode == 0
    }

    #[must_use]
    pub fn inode_number(&self) -> InodeNumber {
        InodeNumber(u32::from(self.inode))
    }

    /// Name bytes up to the first NUL, never more than 14.
    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        trim_nul_padded(&self.name)
    }

    #[must_use]
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    #[must_use]
    pub fn name_matches(&self, query: &[u8]) -> bool {
        names_equal(query, &self.name)
    }
}

/// Compare two names the way the format always has: at most the first 14
/// bytes of each, stopping early at a NUL in both.
///
/// This is a deliberate legacy truncation, not a bug: a 15-byte query
/// matches a stored entry whose 14 bytes equal the query's first 14. Bytes
/// past the field width are never examined.
#[must_use]
pub fn names_equal(a: &[u8], b: &[u8]) -> bool {
    for i in 0..DIRENT_NAME_LEN {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return false;
        }
        if x == 0 {
            return true;
        }
    }
    true
}

/// Decode the directory entries contained in the first `valid_len` bytes of a
/// directory block. A trailing fragment shorter than one entry is ignored.
pub fn parse_dir_block(block: &[u8], valid_len: usize) -> Result<Vec<DirEntry>, ParseError> {
    let region = ensure_slice(block, 0, valid_len)?;
    region
        .chunks_exact(DIRENT_SIZE)
        .map(DirEntry::parse_from_bytes)
        .collect()
}

/// First live entry in a directory block whose name matches `name`.
pub fn lookup_in_dir_block(
    block: &[u8],
    valid_len: usize,
    name: &[u8],
) -> Result<Option<DirEntry>, ParseError> {
    let region = ensure_slice(block, 0, valid_len)?;
    for chunk in region.chunks_exact(DIRENT_SIZE) {
        let entry = DirEntry::parse_from_bytes(chunk)?;
        if !entry.is_free() && entry.name_matches(name) {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use v6fs_types::DIRENTS_PER_SECTOR;

    fn sample_inode() -> Inode {
        Inode {
            mode: IALLOC | IFDIR | ILARG | 0o755,
            nlink: 2,
            uid: 3,
            gid: 4,
            size_high: 0x01,
            size_low: 0x0203,
            addr: [10, 11, 12, 13, 14, 15, 16, 17],
            atime: 0x0001_0002,
            mtime: 0x7FFF_0000,
        }
    }

    #[test]
    fn inode_field_offsets() {
        let bytes = sample_inode().to_bytes();
        assert_eq!(&bytes[0..2], &(IALLOC | IFDIR | ILARG | 0o755).to_le_bytes());
        assert_eq!(bytes[2], 2);
        assert_eq!(bytes[5], 0x01);
        assert_eq!(&bytes[6..8], &[0x03, 0x02]);
        assert_eq!(&bytes[8..10], &[10, 0]);
        assert_eq!(&bytes[22..24], &[17, 0]);
        // atime high word first
        assert_eq!(&bytes[24..28], &[0x01, 0x00, 0x02, 0x00]);
        let parsed = Inode::parse_from_bytes(&bytes).unwrap();
        assert_eq!(parsed, sample_inode());
    }

    #[test]
    fn inode_size_combines_halves() {
        let inode = sample_inode();
        assert_eq!(inode.size(), 0x01_0203);
        let mut other = inode.clone();
        other.set_size(513);
        assert_eq!((other.size_high, other.size_low), (0, 513));
        other.set_size(0x00AB_CDEF);
        assert_eq!(other.size(), 0x00AB_CDEF);
    }

    #[test]
    fn inode_mode_predicates() {
        let dir = sample_inode();
        assert!(dir.is_allocated());
        assert!(dir.is_large());
        assert!(dir.is_dir());
        assert_eq!(dir.permission_bits(), 0o755);

        let mut file = sample_inode();
        file.mode = IALLOC | 0o644;
        assert_eq!(file.kind(), InodeKind::Regular);
        assert!(!file.is_large());

        file.mode = IALLOC | IFCHR;
        assert_eq!(file.kind(), InodeKind::CharDevice);
        file.mode = IALLOC | IFBLK;
        assert_eq!(file.kind(), InodeKind::BlockDevice);
        file.mode = 0;
        assert!(!file.is_allocated());
        file.mode = ISUID | ISGID | ISVTX;
        assert!(file.is_setuid() && file.is_setgid() && file.is_sticky());
    }

    #[test]
    fn inode_parse_rejects_short_input() {
        let err = Inode::parse_from_bytes(&[0_u8; 31]).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { needed: 32, .. }));
    }

    #[test]
    fn inode_position_in_list() {
        assert_eq!(inode_position(InodeNumber(1)), Some((0, 0)));
        assert_eq!(inode_position(InodeNumber(2)), Some((0, 32)));
        assert_eq!(inode_position(InodeNumber(16)), Some((0, 480)));
        assert_eq!(inode_position(InodeNumber(17)), Some((1, 0)));
    }

    #[test]
    fn inode_zero_has_no_position() {
        assert_eq!(inode_position(InodeNumber(0)), None);
    }

    #[test]
    fn superblock_roundtrip_and_geometry() {
        let sb = Superblock {
            isize: 4,
            fsize: 100,
            nfree: 0,
            ninode: 0,
            flock: 0,
            ilock: 0,
            fmod: 1,
            ronly: 0,
            time: 0x1234_5678,
        };
        let sector = sb.to_sector();
        assert_eq!(&sector[0..2], &[4, 0]);
        assert_eq!(&sector[412..416], &[0x34, 0x12, 0x78, 0x56]);
        let parsed = Superblock::parse_from_sector(&sector).unwrap();
        assert_eq!(parsed, sb);
        assert_eq!(parsed.inode_count(), 64);
        assert_eq!(parsed.data_start_sector(), 6);
        assert!(parsed.validate(100).is_ok());
    }

    #[test]
    fn superblock_validation_failures() {
        let mut sb = Superblock::parse_from_sector(&[0_u8; SECTOR_SIZE]).unwrap();
        assert!(matches!(
            sb.validate(10),
            Err(ParseError::InvalidField { field: "s_isize", .. })
        ));
        sb.isize = 20;
        assert!(sb.validate(10).is_err());
        sb.isize = 2;
        sb.fsize = 3;
        assert!(matches!(
            sb.validate(10),
            Err(ParseError::InvalidField { field: "s_fsize", .. })
        ));
        sb.fsize = 0;
        assert!(sb.validate(10).is_ok());
    }

    #[test]
    fn names_compare_at_most_fourteen_bytes() {
        let stored = DirEntry::new(5, b"averylongname1");
        assert!(stored.name_matches(b"averylongname1"));
        assert!(stored.name_matches(b"averylongname123"));
        assert!(!stored.name_matches(b"averylongname2"));
        assert!(!stored.name_matches(b"averylongname"));

        let short = DirEntry::new(6, b"abc");
        assert!(short.name_matches(b"abc"));
        assert!(!short.name_matches(b"abcd"));
        assert!(!short.name_matches(b"ab"));
        assert_eq!(short.name_bytes(), b"abc");
    }

    #[test]
    fn fifteen_byte_stored_name_is_truncated() {
        let entry = DirEntry::new(9, b"fifteen_chars_x");
        assert_eq!(entry.name_bytes(), b"fifteen_chars_");
        assert!(entry.name_matches(b"fifteen_chars_y"));
        assert!(names_equal(b"fifteen_chars_x", b"fifteen_chars_z"));
    }

    #[test]
    fn dir_block_parsing_respects_valid_len() {
        let mut block = vec![0_u8; SECTOR_SIZE];
        for i in 0..DIRENTS_PER_SECTOR {
            let name = format!("f{i}");
            let entry = DirEntry::new(u16::try_from(i + 1).unwrap(), name.as_bytes());
            block[i * DIRENT_SIZE..(i + 1) * DIRENT_SIZE].copy_from_slice(&entry.to_bytes());
        }
        let all = parse_dir_block(&block, SECTOR_SIZE).unwrap();
        assert_eq!(all.len(), 32);
        let partial = parse_dir_block(&block, 3 * DIRENT_SIZE + 5).unwrap();
        assert_eq!(partial.len(), 3);
        assert_eq!(partial[2].name_bytes(), b"f2");

        let hit = lookup_in_dir_block(&block, 3 * DIRENT_SIZE, b"f2").unwrap();
        assert_eq!(hit.map(|e| e.inode), Some(3));
        assert!(lookup_in_dir_block(&block, 3 * DIRENT_SIZE, b"f3")
            .unwrap()
            .is_none());
        assert!(parse_dir_block(&block, SECTOR_SIZE + 1).is_err());
    }

    #[test]
    fn free_entries_never_match() {
        let mut block = vec![0_u8; SECTOR_SIZE];
        block[..DIRENT_SIZE].copy_from_slice(&DirEntry::new(0, b"gone").to_bytes());
        block[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(&DirEntry::new(4, b"gone").to_bytes());
        let hit = lookup_in_dir_block(&block, 2 * DIRENT_SIZE, b"gone").unwrap();
        assert_eq!(hit.map(|e| e.inode), Some(4));
        // All-zero slots do not match the empty name either.
        assert!(lookup_in_dir_block(&block, SECTOR_SIZE, b"").unwrap().is_none());
    }
}

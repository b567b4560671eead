#![forbid(unsafe_code)]

use std::time::{Duration, UNIX_EPOCH};
use v6fs::{
    Filesystem, InodeNumber, InsertOutcome, MemSectorStore, OpenOptions, PathStore, SECTOR_SIZE,
    SectorCache, SectorNumber, SectorStore, V6Error,
};
use v6fs_harness::{CountingStore, ImageBuilder, ReadLog};

/// File content whose block `b` is the little-endian `b` repeated.
fn striped(blocks: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(blocks * SECTOR_SIZE);
    for b in 0..blocks {
        let tag = u16::try_from(b).expect("block index fits u16").to_le_bytes();
        for _ in 0..SECTOR_SIZE / 2 {
            out.extend_from_slice(&tag);
        }
    }
    out
}

fn mount(builder: &ImageBuilder) -> (Filesystem, ReadLog) {
    let (store, log) = CountingStore::new(builder.build_store().expect("build image"));
    let fs = Filesystem::from_store(Box::new(store), &OpenOptions::default()).expect("mount");
    (fs, log)
}

fn block_tag(fs: &mut Filesystem, ino: InodeNumber, block: u32) -> u16 {
    let data = fs.read_block(ino, block).expect("read block");
    u16::from_le_bytes([data.data[0], data.data[1]])
}

// ── Block index resolution cost ─────────────────────────────────────────────

#[test]
fn small_file_resolution_is_direct() {
    let mut b = ImageBuilder::new(1);
    let ino = b
        .add_file(InodeNumber::ROOT, "small", &striped(8))
        .expect("add file");
    let (mut fs, _) = mount(&b);
    let inode = fs.read_inode(ino).expect("inode");
    assert!(!inode.is_large());

    for block in 0..8 {
        let before = fs.cache_stats().reads;
        let sector = fs.resolve_block(&inode, block).expect("resolve");
        assert_eq!(fs.cache_stats().reads, before, "block {block} did I/O");
        assert_eq!(sector, SectorNumber(u32::from(inode.addr[block as usize])));
    }
}

#[test]
fn indirect_resolution_costs_one_or_two_reads() {
    let blocks = 7 * 256 + 300;
    let mut b = ImageBuilder::new(1);
    let ino = b
        .add_file(InodeNumber::ROOT, "huge", &striped(blocks))
        .expect("add file");
    let (mut fs, _) = mount(&b);
    let inode = fs.read_inode(ino).expect("inode");
    assert!(inode.is_large());

    for (block, extra) in [
        (0_u32, 1_u64),
        (255, 1),
        (256, 1),
        (1791, 1),
        (1792, 2),
        (2047, 2),
        (2048, 2),
        (u32::try_from(blocks).unwrap() - 1, 2),
    ] {
        let before = fs.cache_stats().reads;
        fs.resolve_block(&inode, block).expect("resolve");
        assert_eq!(fs.cache_stats().reads - before, extra, "block {block}");

        // Whole read: inode, indirection, data sector.
        let before = fs.cache_stats().reads;
        assert_eq!(u32::from(block_tag(&mut fs, ino, block)), block);
        assert_eq!(fs.cache_stats().reads - before, 2 + extra, "block {block}");
    }
}

#[test]
fn resolution_past_eof_is_rejected() {
    let mut b = ImageBuilder::new(1);
    let ino = b
        .add_file(InodeNumber::ROOT, "f", &[1; 1000])
        .expect("add file");
    let (mut fs, _) = mount(&b);
    let inode = fs.read_inode(ino).expect("inode");
    assert!(fs.resolve_block(&inode, 1).is_ok());
    assert!(matches!(
        fs.resolve_block(&inode, 2),
        Err(V6Error::BlockOutOfRange { block: 2, size: 1000 })
    ));
    assert!(fs.read_block(ino, 5).is_err());
}

// ── Valid byte counts ───────────────────────────────────────────────────────

#[test]
fn final_block_valid_bytes() {
    let sizes = [0_usize, 1, 511, 512, 513, 4096];
    let mut b = ImageBuilder::new(1);
    let inos: Vec<InodeNumber> = sizes
        .iter()
        .map(|&size| {
            b.add_file(InodeNumber::ROOT, &format!("s{size}"), &vec![b'z'; size])
                .expect("add file")
        })
        .collect();
    let (mut fs, _) = mount(&b);

    for (&size, &ino) in sizes.iter().zip(&inos) {
        let last = if size == 0 { 0 } else { (size - 1) / SECTOR_SIZE };
        let block = fs
            .read_block(ino, u32::try_from(last).unwrap())
            .expect("read block");
        let expected = match size % SECTOR_SIZE {
            0 if size == 0 => 0,
            0 => SECTOR_SIZE,
            rem => rem,
        };
        assert_eq!(block.valid, expected, "size {size}");
        assert!(block.bytes().iter().all(|&c| c == b'z'));
        assert_eq!(fs.read_file(ino).expect("read file").len(), size);
    }
}

// ── Names ───────────────────────────────────────────────────────────────────

#[test]
fn fourteen_and_fifteen_byte_names() {
    let mut b = ImageBuilder::new(1);
    let exact = b
        .add_file(InodeNumber::ROOT, "exactly_14_chr", b"fourteen")
        .expect("add file");
    let long = b
        .add_file(InodeNumber::ROOT, "fifteen_chars_x", b"fifteen")
        .expect("add file");
    let (mut fs, _) = mount(&b);

    assert_eq!(fs.resolve_path("/exactly_14_chr").unwrap(), exact);
    assert_eq!(fs.resolve_path("/exactly_14_chr_and_more").unwrap(), exact);
    assert!(fs.resolve_path("/exactly_14_ch").is_err());

    // The stored name kept 14 bytes; any query sharing them matches.
    assert_eq!(fs.resolve_path("/fifteen_chars_x").unwrap(), long);
    assert_eq!(fs.resolve_path("/fifteen_chars_").unwrap(), long);
    assert_eq!(fs.resolve_path("/fifteen_chars_y").unwrap(), long);
    assert!(fs.resolve_path("/fifteen_chars").is_err());

    let entry = fs
        .lookup(InodeNumber::ROOT, b"fifteen_chars_x")
        .unwrap()
        .expect("entry");
    assert_eq!(entry.name_bytes(), b"fifteen_chars_");
}

#[test]
fn first_matching_entry_wins() {
    let mut b = ImageBuilder::new(1);
    let first = b
        .add_file(InodeNumber::ROOT, "twin", b"first")
        .expect("add file");
    let second = b
        .add_file(InodeNumber::ROOT, "other", b"second")
        .expect("add file");
    b.add_raw_entry(InodeNumber::ROOT, 0, b"ghost").unwrap();
    b.add_raw_entry(InodeNumber::ROOT, u16::try_from(second.0).unwrap(), b"twin")
        .unwrap();
    let (mut fs, _) = mount(&b);
    assert_eq!(fs.resolve_path("/twin").unwrap(), first);
    assert!(fs.lookup(InodeNumber::ROOT, b"ghost").unwrap().is_none());
}

// ── Path resolution ─────────────────────────────────────────────────────────

#[test]
fn path_through_a_file_fails_at_that_step() {
    let mut b = ImageBuilder::new(1);
    b.add_file(InodeNumber::ROOT, "a", b"plain").expect("add file");
    let elsewhere = b.mkdir(InodeNumber::ROOT, "d").expect("mkdir");
    let inner = b.mkdir(elsewhere, "b").expect("mkdir");
    b.add_file(inner, "c", b"deep").expect("add file");
    let (mut fs, _) = mount(&b);

    assert!(fs.resolve_path("/d/b/c").is_ok());
    let err = fs.resolve_path("/a/b/c").unwrap_err();
    assert!(matches!(err, V6Error::NotDirectory(ref p) if p == "/a"), "{err}");
    assert_eq!(err.kind(), v6fs::ErrorKind::InvalidArgument);
}

#[test]
fn not_found_is_distinct_from_unreadable() {
    let mut b = ImageBuilder::new(1);
    let d = b.mkdir(InodeNumber::ROOT, "d").expect("mkdir");
    // Entry naming an inode beyond the inode list.
    b.add_raw_entry(d, 500, b"dangling").unwrap();
    let (mut fs, _) = mount(&b);

    let missing = fs.resolve_path("/d/nothing").unwrap_err();
    assert!(missing.is_not_found());
    assert_eq!(missing.to_errno(), libc::ENOENT);

    let dangling = fs.resolve_path("/d/dangling/x").unwrap_err();
    assert!(matches!(dangling, V6Error::InodeOutOfRange { ino: 500, .. }));
}

// ── Descriptors ─────────────────────────────────────────────────────────────

#[test]
fn descriptor_reads_match_block_reconstruction() {
    let sizes = [0_usize, 1, 700, 4096, 9 * 512 + 17, 1800 * 512 + 3];
    let mut b = ImageBuilder::new(1);
    for &size in &sizes {
        let content: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
        b.add_file(InodeNumber::ROOT, &format!("f{size}"), &content)
            .expect("add file");
    }
    let (mut fs, _) = mount(&b);

    for &size in &sizes {
        let path = format!("/f{size}");
        let (ino, inode) = fs.stat_path(&path).unwrap();

        let mut reference = Vec::new();
        for block in 0..v6fs::block_count(&inode) {
            reference.extend_from_slice(fs.read_block(ino, block).unwrap().bytes());
        }

        let fd = fs.open_file(&path).unwrap();
        let mut via_fd = Vec::new();
        let mut buf = [0_u8; 333];
        loop {
            let n = fs.read(fd, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            via_fd.extend_from_slice(&buf[..n]);
        }
        assert_eq!(via_fd.len(), size);
        assert_eq!(via_fd, reference, "{path}");
        assert_eq!(fs.tell(fd).unwrap() as usize, size);
        fs.close(fd).unwrap();
    }
    assert_eq!(fs.open_file_count(), 0);
}

#[test]
fn descriptors_are_independent() {
    let mut b = ImageBuilder::new(1);
    b.add_file(InodeNumber::ROOT, "x", b"abcdef").unwrap();
    b.add_file(InodeNumber::ROOT, "y", b"uvwxyz").unwrap();
    let (mut fs, _) = mount(&b);
    let fx = fs.open_file("/x").unwrap();
    let fy = fs.open_file("/y").unwrap();
    let fx2 = fs.open_file("/x").unwrap();
    assert_eq!(fs.getchar(fx).unwrap(), Some(b'a'));
    assert_eq!(fs.getchar(fy).unwrap(), Some(b'u'));
    assert_eq!(fs.getchar(fx).unwrap(), Some(b'b'));
    assert_eq!(fs.getchar(fx2).unwrap(), Some(b'a'));
    assert_eq!(fs.tell(fx).unwrap(), 2);
    assert_eq!(fs.tell(fy).unwrap(), 1);
}

#[test]
fn unallocated_file_cannot_be_read() {
    let mut b = ImageBuilder::new(1);
    let ino = b.add_file(InodeNumber::ROOT, "freed", b"data").unwrap();
    b.free_inode(ino);
    let (mut fs, _) = mount(&b);
    let fd = fs.open_file("/freed").unwrap();
    assert!(matches!(fs.getchar(fd), Err(V6Error::Unallocated(_))));
    let mut buf = [0_u8; 4];
    assert!(fs.read(fd, &mut buf).is_err());
    assert!(!fs.is_regular_file("/freed"));
}

// ── Dedup ───────────────────────────────────────────────────────────────────

fn dedup_image() -> ImageBuilder {
    let mut b = ImageBuilder::new(1);
    let content = striped(20);
    b.add_file(InodeNumber::ROOT, "orig", &content).unwrap();
    let d = b.mkdir(InodeNumber::ROOT, "copies").unwrap();
    b.add_file(d, "copy", &content).unwrap();
    b
}

#[test]
fn dedup_discards_identical_content() {
    let (mut fs, _) = mount(&dedup_image());
    let mut store = PathStore::new();
    store.insert(&mut fs, "/orig", true);
    let outcome = store.insert(&mut fs, "/copies/copy", true);
    assert_eq!(
        outcome,
        InsertOutcome::Duplicate {
            existing: "/orig".to_owned()
        }
    );
    assert_eq!(store.len(), 1);
}

#[test]
fn dedup_keeps_both_without_discard() {
    let (mut fs, _) = mount(&dedup_image());
    let mut store = PathStore::new();
    store.insert(&mut fs, "/orig", false);
    store.insert(&mut fs, "/copies/copy", false);
    assert_eq!(store.len(), 2);
}

#[test]
fn dedup_same_literal_path_does_no_io() {
    let (mut fs, log) = mount(&dedup_image());
    let mut store = PathStore::new();
    store.insert(&mut fs, "/orig", true);
    let cache_before = fs.cache_stats();
    log.reset();
    assert!(store.insert(&mut fs, "/orig", true).is_duplicate());
    assert_eq!(log.count(), 0);
    assert_eq!(fs.cache_stats(), cache_before);
    assert_eq!(fs.fileops_stats().opens, 0);
}

// ── Sector cache ────────────────────────────────────────────────────────────

#[test]
fn cache_evicts_on_collision_and_hits_on_repeat() {
    let (store, log) = CountingStore::new(MemSectorStore::new(vec![0; 64 * SECTOR_SIZE]));
    let mut cache = SectorCache::new(store, 8).unwrap();
    let k = SectorNumber(3);
    let collide = SectorNumber(3 + 8);

    cache.read_sector(k).unwrap();
    cache.read_sector(k).unwrap();
    assert_eq!(log.count_of(3), 1);

    cache.read_sector(collide).unwrap();
    cache.read_sector(k).unwrap();
    assert_eq!(log.count_of(3), 2);
    assert_eq!(log.sectors(), vec![3, 11, 3]);

    let stats = cache.stats();
    assert_eq!((stats.reads, stats.hits, stats.misses), (4, 1, 3));
}

#[test]
fn cache_budget_controls_capacity() {
    let store = dedup_image().build_store().unwrap();
    let opts = OpenOptions {
        cache_kb: 2,
        ..OpenOptions::default()
    };
    let fs = Filesystem::from_store(Box::new(store), &opts).unwrap();
    assert_eq!(fs.cache_capacity(), 4);
}

#[test]
fn tiny_cache_still_reads_correctly() {
    let (store, _) = CountingStore::new(dedup_image().build_store().unwrap());
    let opts = OpenOptions {
        cache_kb: 1,
        ..OpenOptions::default()
    };
    let mut fs = Filesystem::from_store(Box::new(store), &opts).unwrap();
    let (ino, _) = fs.stat_path("/copies/copy").unwrap();
    assert_eq!(fs.read_file(ino).unwrap(), striped(20));
    let stats = fs.cache_stats();
    assert_eq!(stats.hits + stats.misses, stats.reads);
}

#[test]
fn file_backed_image_round_trip() {
    let image = dedup_image().build().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v6.img");
    std::fs::write(&path, &image).unwrap();

    let mut fs = Filesystem::open(&path).unwrap();
    let (ino, _) = fs.stat_path("/orig").unwrap();
    assert_eq!(fs.read_file(ino).unwrap(), striped(20));
    assert_eq!(fs.device_len(), image.len() as u64);
}

#[test]
fn owners_and_timestamps_survive_the_image() {
    let mut b = ImageBuilder::new(1);
    b.set_time(1_000_000);
    let ino = b.add_file(InodeNumber::ROOT, "stamped", b"x").expect("add file");
    b.set_owner(ino, 7, 9).expect("owner");
    b.set_times(ino, 1_700_000_000, 86_400).expect("times");
    let (mut fs, _) = mount(&b);

    assert_eq!(fs.superblock().time, 1_000_000);
    let inode = fs.read_inode(ino).expect("inode");
    assert_eq!((inode.uid, inode.gid), (7, 9));
    assert_eq!(inode.mtime_system_time(), UNIX_EPOCH + Duration::from_secs(86_400));
    assert_eq!(inode.atime_system_time(), UNIX_EPOCH + Duration::from_secs(1_700_000_000));
    assert!(b.set_owner(InodeNumber(99), 0, 0).is_err());
}

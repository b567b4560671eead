#![forbid(unsafe_code)]
//! Directory operations.
//!
//! Linear scan of a directory's blocks for a name, and full listing.
//! Directories are ordinary files of 16-byte entries; only the valid bytes
//! of each block are examined.

use tracing::{debug, trace};
use v6fs_block::SectorStore;
use v6fs_error::{Result, V6Error};
use v6fs_inode::{InodeGeometry, block_count, fetch, read_inode_block};
use v6fs_ondisk::{DirEntry, Inode, lookup_in_dir_block, parse_dir_block};
use v6fs_types::InodeNumber;

fn dir_inode(dev: &mut dyn SectorStore, geom: &InodeGeometry, dir: InodeNumber) -> Result<Inode> {
    let inode = fetch(dev, geom, dir)?;
    if !inode.is_dir() {
        return Err(V6Error::NotDirectory(format!("inode {dir}")));
    }
    Ok(inode)
}

fn block_corruption(dir: InodeNumber, block: u32, err: &v6fs_types::ParseError) -> V6Error {
    V6Error::Parse(format!("directory inode {dir} block {block}: {err}"))
}

/// Find the first live entry in directory `dir` whose name matches `name`
/// under the 14-byte comparison rule.
///
/// `Ok(None)` means the directory was scanned completely and the name is
/// absent; an unreadable directory is an `Err`.
pub fn find_by_name(
    dev: &mut dyn SectorStore,
    geom: &InodeGeometry,
    dir: InodeNumber,
    name: &[u8],
) -> Result<Option<DirEntry>> {
    let inode = dir_inode(dev, geom, dir)?;
    let blocks = block_count(&inode);
    for block in 0..blocks {
        let content = read_inode_block(dev, &inode, block)?;
        let hit = lookup_in_dir_block(&content.data, content.valid, name)
            .map_err(|e| block_corruption(dir, block, &e))?;
        if let Some(entry) = hit {
            trace!(
                target: "v6fs::dir",
                dir = dir.0,
                block,
                ino = entry.inode,
                "name found"
            );
            return Ok(Some(entry));
        }
    }
    debug!(
        target: "v6fs::dir",
        dir = dir.0,
        blocks,
        name = %String::from_utf8_lossy(name),
        "name not found"
    );
    Ok(None)
}

/// Every live entry of directory `dir`, in on-disk order.
pub fn read_dir(
    dev: &mut dyn SectorStore,
    geom: &InodeGeometry,
    dir: InodeNumber,
) -> Result<Vec<DirEntry>> {
    let inode = dir_inode(dev, geom, dir)?;
    let blocks = block_count(&inode);
    let mut entries = Vec::new();
    for block in 0..blocks {
        let content = read_inode_block(dev, &inode, block)?;
        let parsed = parse_dir_block(&content.data, content.valid)
            .map_err(|e| block_corruption(dir, block, &e))?;
        entries.extend(parsed.into_iter().filter(|e| !e.is_free()));
    }
    debug!(target: "v6fs::dir", dir = dir.0, blocks, entries = entries.len(), "read_dir");
    Ok(entries)
}

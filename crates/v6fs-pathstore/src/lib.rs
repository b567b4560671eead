#![forbid(unsafe_code)]
//! Pathname store with duplicate-content detection.
//!
//! Inserting a pathname with `discard_duplicates` set first checks whether
//! some stored pathname names a file with the same bytes. Comparison is
//! staged from cheap to expensive:
//!
//! 1. identical pathnames are the same file (no I/O);
//! 2. differing BLAKE3 digests mean different files;
//! 3. matching digests are confirmed by reading both files in lockstep
//!    through the descriptor API.
//!
//! Digests are computed at most once per stored pathname and cached.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use v6fs_core::{Fd, Filesystem};
use v6fs_error::Result;
use v6fs_inode::block_count;

/// Whole-file BLAKE3 digest.
pub type Checksum = [u8; 32];

/// Digest of the file at `path`, streamed block by block.
pub fn checksum_path(fs: &mut Filesystem, path: &str) -> Result<Checksum> {
    let (ino, inode) = fs.stat_path(path)?;
    let mut hasher = Hasher::new();
    for block in 0..block_count(&inode) {
        let data = fs.read_block(ino, block)?;
        hasher.update(data.bytes());
    }
    Ok(*hasher.finalize().as_bytes())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStoreStats {
    /// Calls to `insert`.
    pub stores: u64,
    /// Inserts discarded as duplicates.
    pub duplicates: u64,
    /// Pairwise comparisons started.
    pub compares: u64,
    /// Comparisons settled by differing digests.
    pub checksum_diffs: u64,
    /// Byte comparisons that found identical content.
    pub compare_success: u64,
    /// Byte comparisons that found a difference.
    pub compare_fail: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The pathname was added to the store.
    Stored(String),
    /// The pathname was discarded; `existing` has the same content.
    Duplicate { existing: String },
}

impl InsertOutcome {
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

#[derive(Debug)]
struct Element {
    path: String,
    checksum: Option<Checksum>,
}

#[derive(Debug, Default)]
pub struct PathStore {
    elements: Vec<Element>,
    stats: PathStoreStats,
}

impl PathStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Stored pathnames in insertion order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.elements.iter().map(|e| e.path.as_str())
    }

    #[must_use]
    pub fn stats(&self) -> PathStoreStats {
        self.stats
    }

    pub fn insert(
        &mut self,
        fs: &mut Filesystem,
        path: &str,
        discard_duplicates: bool,
    ) -> InsertOutcome {
        self.stats.stores += 1;
        let mut new_checksum = None;
        if discard_duplicates {
            if let Some(existing) = self.find_same(fs, path, &mut new_checksum) {
                self.stats.duplicates += 1;
                debug!(target: "v6fs::pathstore", path, existing, "duplicate discarded");
                return InsertOutcome::Duplicate { existing };
            }
        }
        self.elements.push(Element {
            path: path.to_owned(),
            checksum: new_checksum,
        });
        debug!(target: "v6fs::pathstore", path, stored = self.elements.len(), "stored");
        InsertOutcome::Stored(path.to_owned())
    }

    fn find_same(
        &mut self,
        fs: &mut Filesystem,
        path: &str,
        new_checksum: &mut Option<Checksum>,
    ) -> Option<String> {
        if let Some(e) = self.elements.iter().find(|e| e.path == path) {
            self.stats.compares += 1;
            return Some(e.path.clone());
        }

        for index in 0..self.elements.len() {
            self.stats.compares += 1;

            let ours = match *new_checksum {
                Some(sum) => sum,
                None => match checksum_path(fs, path) {
                    Ok(sum) => *new_checksum.insert(sum),
                    Err(err) => {
                        warn!(target: "v6fs::pathstore", path, error = %err, "cannot checksum");
                        return None;
                    }
                },
            };

            let element = &mut self.elements[index];
            let theirs = match element.checksum {
                Some(sum) => sum,
                None => match checksum_path(fs, &element.path) {
                    Ok(sum) => *element.checksum.insert(sum),
                    Err(err) => {
                        warn!(
                            target: "v6fs::pathstore",
                            path = %element.path,
                            error = %err,
                            "cannot checksum stored path"
                        );
                        continue;
                    }
                },
            };

            if ours != theirs {
                self.stats.checksum_diffs += 1;
                continue;
            }

            let candidate = element.path.clone();
            match same_content(fs, path, &candidate) {
                Ok(true) => {
                    self.stats.compare_success += 1;
                    return Some(candidate);
                }
                Ok(false) => self.stats.compare_fail += 1,
                Err(err) => {
                    warn!(
                        target: "v6fs::pathstore",
                        path,
                        candidate = %candidate,
                        error = %err,
                        "cannot compare"
                    );
                }
            }
        }
        None
    }
}

/// Read both files byte by byte through descriptors until they differ or
/// both end together.
fn same_content(fs: &mut Filesystem, a: &str, b: &str) -> Result<bool> {
    let fa = fs.open_file(a)?;
    let fb = match fs.open_file(b) {
        Ok(fd) => fd,
        Err(err) => {
            close_quietly(fs, fa);
            return Err(err);
        }
    };
    let result = lockstep_equal(fs, fa, fb);
    close_quietly(fs, fa);
    close_quietly(fs, fb);
    result
}

fn lockstep_equal(fs: &mut Filesystem, fa: Fd, fb: Fd) -> Result<bool> {
    loop {
        let x = fs.getchar(fa)?;
        let y = fs.getchar(fb)?;
        if x != y {
            return Ok(false);
        }
        if x.is_none() {
            return Ok(true);
        }
    }
}

fn close_quietly(fs: &mut Filesystem, fd: Fd) {
    if let Err(err) = fs.close(fd) {
        warn!(target: "v6fs::pathstore", %fd, error = %err, "close failed");
    }
}

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use std::env;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use v6fs_harness::ImageBuilder;
use v6fs_types::{INODES_PER_SECTOR, InodeNumber};

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("mkimage") => mkimage(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn mkimage(args: &[String]) -> Result<()> {
    let mut positional = Vec::new();
    let mut inode_sectors: Option<u16> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--inode-sectors" => {
                let value = iter.next().context("--inode-sectors requires a value")?;
                inode_sectors = Some(
                    value
                        .parse()
                        .with_context(|| format!("invalid --inode-sectors: {value}"))?,
                );
            }
            other if other.starts_with("--") => bail!("unknown option: {other}"),
            _ => positional.push(arg.as_str()),
        }
    }
    let [host_dir, out] = positional[..] else {
        bail!("usage: v6fs-harness mkimage <host-dir> <out-image> [--inode-sectors N]");
    };
    let host_dir = Path::new(host_dir);

    let inode_sectors = match inode_sectors {
        Some(n) => n,
        None => {
            let needed = count_nodes(host_dir)? + 1;
            u16::try_from(needed.div_ceil(INODES_PER_SECTOR).max(1))
                .context("host tree has too many entries for a V6 inode list")?
        }
    };

    let mut builder = ImageBuilder::new(inode_sectors);
    builder.set_time(v6_time(Ok(SystemTime::now())));
    add_tree(&mut builder, host_dir, InodeNumber::ROOT)?;
    let (image, summary) = builder.build_with_summary()?;
    fs::write(out, &image).with_context(|| format!("failed to write {out}"))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn sorted_entries(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);
    Ok(entries)
}

fn count_nodes(dir: &Path) -> Result<usize> {
    let mut total = 0;
    for entry in sorted_entries(dir)? {
        let kind = entry.file_type()?;
        if kind.is_dir() {
            total += 1 + count_nodes(&entry.path())?;
        } else if kind.is_file() {
            total += 1;
        }
    }
    Ok(total)
}

fn add_tree(builder: &mut ImageBuilder, dir: &Path, parent: InodeNumber) -> Result<()> {
    for entry in sorted_entries(dir)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let kind = entry.file_type()?;
        let ino = if kind.is_dir() {
            let ino = builder.mkdir(parent, &name)?;
            add_tree(builder, &path, ino)?;
            ino
        } else if kind.is_file() {
            let data =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            builder
                .add_file(parent, &name, &data)
                .with_context(|| format!("failed to add {}", path.display()))?
        } else {
            warn!(path = %path.display(), "skipping non-regular entry");
            continue;
        };
        let meta = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        copy_attributes(builder, ino, &meta)?;
    }
    Ok(())
}

/// Seconds since the epoch, clamped to the 32-bit V6 time field.
fn v6_time(time: std::io::Result<SystemTime>) -> u32 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

/// Carry host ownership and timestamps. V6 keeps only the low byte of ids.
fn copy_attributes(
    builder: &mut ImageBuilder,
    ino: InodeNumber,
    meta: &fs::Metadata,
) -> Result<()> {
    builder.set_owner(ino, meta.uid().to_le_bytes()[0], meta.gid().to_le_bytes()[0])?;
    builder.set_times(ino, v6_time(meta.accessed()), v6_time(meta.modified()))
}

fn print_usage() {
    eprintln!("usage: v6fs-harness <command>");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  mkimage <host-dir> <out-image> [--inode-sectors N]");
    eprintln!("      build a V6 image from a host directory tree");
}

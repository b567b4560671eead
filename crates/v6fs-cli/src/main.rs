#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::BTreeSet;
use std::env;
use std::io::{self, Write};
use std::path::Path;
use v6fs::{
    CacheStats, Filesystem, FileopsStats, InodeKind, InodeNumber, OpenOptions, PathStore,
    PathStoreStats, V6Error,
};

#[derive(Debug, Serialize)]
struct InspectOutput {
    isize: u16,
    fsize: u16,
    nfree: u16,
    ninode: u16,
    fmod: u8,
    ronly: u8,
    time: u32,
    inode_count: u32,
    data_start_sector: u32,
    device_len: u64,
    cache_sectors: usize,
}

#[derive(Debug, Serialize)]
struct LsEntry {
    inode: u16,
    name: String,
    kind: Option<InodeKind>,
    mode: Option<String>,
    size: Option<u32>,
}

#[derive(Debug, Serialize)]
struct StatsOutput {
    cache: CacheStats,
    fileops: FileopsStats,
    pathstore: PathStoreStats,
}

/// Flags accepted by every command.
#[derive(Debug, Default)]
struct Flags {
    cache_kb: Option<usize>,
    json: bool,
    keep_duplicates: bool,
    stats: bool,
}

impl Flags {
    fn open_options(&self) -> OpenOptions {
        let mut options = OpenOptions::default();
        if let Some(kb) = self.cache_kb {
            options.cache_kb = kb;
        }
        options
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        let code = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<V6Error>())
            .map_or(1, V6Error::to_errno);
        std::process::exit(code);
    }
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<(Vec<String>, Flags)> {
    let mut positional = Vec::new();
    let mut flags = Flags::default();
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--cache-kb" => {
                let value = raw.next().context("--cache-kb requires a value")?;
                flags.cache_kb = Some(
                    value
                        .parse()
                        .with_context(|| format!("invalid --cache-kb: {value}"))?,
                );
            }
            "--json" => flags.json = true,
            "--keep-duplicates" => flags.keep_duplicates = true,
            "--stats" => flags.stats = true,
            "--help" | "-h" => positional.insert(0, "help".to_owned()),
            other if other.starts_with("--") => bail!("unknown option: {other}"),
            _ => positional.push(arg),
        }
    }
    Ok((positional, flags))
}

fn run() -> Result<()> {
    let (args, flags) = parse_args(env::args().skip(1))?;
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "inspect" => {
            let Some(image) = args.get(1) else {
                bail!("inspect requires <image-path>");
            };
            inspect(Path::new(image), &flags)
        }
        "ls" => {
            let (Some(image), Some(path)) = (args.get(1), args.get(2)) else {
                bail!("ls requires <image-path> <dir-path>");
            };
            ls(Path::new(image), path, &flags)
        }
        "cat" => {
            let (Some(image), Some(path)) = (args.get(1), args.get(2)) else {
                bail!("cat requires <image-path> <file-path>");
            };
            cat(Path::new(image), path, &flags)
        }
        "dedup" => {
            let Some(image) = args.get(1) else {
                bail!("dedup requires <image-path>");
            };
            dedup(Path::new(image), &flags)
        }
        "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("v6fs\n");
    println!("USAGE:");
    println!("  v6fs inspect <image-path> [--json]");
    println!("  v6fs ls <image-path> <dir-path> [--json]");
    println!("  v6fs cat <image-path> <file-path>");
    println!("  v6fs dedup <image-path> [--keep-duplicates] [--stats]");
    println!();
    println!("OPTIONS:");
    println!("  --cache-kb <N>   sector cache budget in KiB (default 1024)");
}

fn open(image: &Path, flags: &Flags) -> Result<Filesystem> {
    Filesystem::open_with_options(image, &flags.open_options())
        .with_context(|| format!("failed to open V6 image: {}", image.display()))
}

fn inspect(image: &Path, flags: &Flags) -> Result<()> {
    let fs = open(image, flags)?;
    let sb = fs.superblock();
    let output = InspectOutput {
        isize: sb.isize,
        fsize: sb.fsize,
        nfree: sb.nfree,
        ninode: sb.ninode,
        fmod: sb.fmod,
        ronly: sb.ronly,
        time: sb.time,
        inode_count: fs.inode_count(),
        data_start_sector: sb.data_start_sector(),
        device_len: fs.device_len(),
        cache_sectors: fs.cache_capacity(),
    };

    if flags.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("V6 Inspector");
        println!("inode_sectors: {}", output.isize);
        println!("fs_sectors: {}", output.fsize);
        println!("inode_count: {}", output.inode_count);
        println!("data_start_sector: {}", output.data_start_sector);
        println!("device_len: {}", output.device_len);
        println!("modified: {}", output.fmod != 0);
        println!("read_only: {}", output.ronly != 0);
        println!("time: {}", output.time);
        println!("cache_sectors: {}", output.cache_sectors);
    }
    Ok(())
}

fn mode_string(kind: InodeKind, perms: u16) -> String {
    let type_char = match kind {
        InodeKind::Regular => '-',
        InodeKind::Directory => 'd',
        InodeKind::CharDevice => 'c',
        InodeKind::BlockDevice => 'b',
    };
    let mut out = String::with_capacity(10);
    out.push(type_char);
    for shift in [6_u16, 3, 0] {
        let bits = (perms >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn ls(image: &Path, path: &str, flags: &Flags) -> Result<()> {
    let mut fs = open(image, flags)?;
    let dir = fs
        .resolve_path(path)
        .with_context(|| format!("cannot resolve {path}"))?;
    let entries = fs
        .read_dir(dir)
        .with_context(|| format!("cannot list {path}"))?;

    let mut rows = Vec::with_capacity(entries.len());
    for entry in &entries {
        // A dangling or freed inode is listed without attributes.
        let inode = fs.read_inode(entry.inode_number()).ok();
        rows.push(LsEntry {
            inode: entry.inode,
            name: entry.name_lossy(),
            kind: inode.as_ref().map(v6fs::Inode::kind),
            mode: inode
                .as_ref()
                .map(|i| mode_string(i.kind(), i.permission_bits())),
            size: inode.as_ref().map(v6fs::Inode::size),
        });
    }

    if flags.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("serialize output")?
        );
    } else {
        for row in &rows {
            println!(
                "{:>5} {:<10} {:>8} {}",
                row.inode,
                row.mode.as_deref().unwrap_or("?"),
                row.size.map_or_else(|| "?".to_owned(), |s| s.to_string()),
                row.name
            );
        }
    }
    Ok(())
}

fn cat(image: &Path, path: &str, flags: &Flags) -> Result<()> {
    let mut fs = open(image, flags)?;
    let fd = fs.open_file(path)?;
    let mut stdout = io::stdout().lock();
    let mut buf = [0_u8; 4096];
    loop {
        let n = fs
            .read(fd, &mut buf)
            .with_context(|| format!("read failed: {path}"))?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n])?;
    }
    stdout.flush()?;
    fs.close(fd)?;
    Ok(())
}

/// Every regular file below `dir`, depth first, in directory order.
fn collect_files(
    fs: &mut Filesystem,
    dir: InodeNumber,
    prefix: &str,
    visited: &mut BTreeSet<u32>,
    out: &mut Vec<String>,
) -> Result<()> {
    if !visited.insert(dir.0) {
        return Ok(());
    }
    for entry in fs.read_dir(dir)? {
        // Such a name could not be spelled back as a pathname.
        let Ok(name) = std::str::from_utf8(entry.name_bytes()) else {
            eprintln!(
                "warning: skipping {prefix}/{}: name is not UTF-8",
                entry.name_lossy()
            );
            continue;
        };
        if name == "." || name == ".." {
            continue;
        }
        let path = format!("{prefix}/{name}");
        match fs.read_inode(entry.inode_number()) {
            Ok(inode) if inode.is_dir() => {
                collect_files(fs, entry.inode_number(), &path, visited, out)?;
            }
            Ok(_) => {
                if fs.is_regular_file(&path) {
                    out.push(path);
                }
            }
            Err(err) => eprintln!("warning: skipping {path}: {err}"),
        }
    }
    Ok(())
}

fn dedup(image: &Path, flags: &Flags) -> Result<()> {
    let mut fs = open(image, flags)?;
    let mut files = Vec::new();
    collect_files(&mut fs, InodeNumber::ROOT, "", &mut BTreeSet::new(), &mut files)
        .context("directory walk failed")?;

    let mut store = PathStore::new();
    for path in &files {
        store.insert(&mut fs, path, !flags.keep_duplicates);
    }
    for path in store.paths() {
        println!("{path}");
    }

    if flags.stats {
        let stats = StatsOutput {
            cache: fs.cache_stats(),
            fileops: fs.fileops_stats(),
            pathstore: store.stats(),
        };
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&stats).context("serialize stats")?
        );
    }
    Ok(())
}

//! Reads and parses `/proc/<pid>/maps`, the line format the kernel
//! exposes as `begin-end perms offset dev:dev inode path`.
//!
//! Used two ways: to find the main thread's stack bounds at startup (the
//! `[stack]` entry), and -- in the subprocess snapshot variant -- by the
//! forked child to enumerate the ranges it should scan for references
//! into the retired set.

use std::fs;
use std::path::Path;

use quiesce_alloc::PageRange;

#[derive(Debug, thiserror::Error)]
pub enum ProcMapError {
    #[error("failed to read process memory map: {0}")]
    Read(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct MapEntry {
    pub low: usize,
    pub high: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub shared: bool,
    pub path: Option<String>,
}

/// Path fragments this library never wants scanned: its own runtime
/// dependencies' loaded images. Checked as a substring of the mapped
/// path.
const EXCLUDED_PATH_FRAGMENTS: &[&str] = &["libc.so", "libc-", "ld-linux", "ld-musl", "[vdso]", "[vvar]", "[vsyscall]"];

pub fn read_self_maps() -> Result<Vec<MapEntry>, ProcMapError> {
    read_maps(Path::new("/proc/self/maps"))
}

pub fn read_maps(path: &Path) -> Result<Vec<MapEntry>, ProcMapError> {
    let contents = fs::read_to_string(path)?;
    Ok(contents.lines().filter_map(parse_line).collect())
}

fn parse_line(line: &str) -> Option<MapEntry> {
    let mut fields = line.splitn(6, ' ').filter(|s| !s.is_empty());
    let range = fields.next()?;
    let perms = fields.next()?;
    let (low_s, high_s) = range.split_once('-')?;
    let low = usize::from_str_radix(low_s, 16).ok()?;
    let high = usize::from_str_radix(high_s, 16).ok()?;

    let mut perm_chars = perms.chars();
    let readable = perm_chars.next() == Some('r');
    let writable = perm_chars.next() == Some('w');
    let executable = perm_chars.next() == Some('x');
    let shared = perm_chars.next() == Some('s');

    // offset, dev, inode -- skipped, only needed to reach the path field.
    let _offset = fields.next();
    let _dev = fields.next();
    let _inode = fields.next();
    let path = fields
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Some(MapEntry {
        low,
        high,
        readable,
        writable,
        executable,
        shared,
        path,
    })
}

/// Locate the `[stack]`-labeled entry, the bounds for the thread that
/// mapped this process's main stack.
pub fn stack_range(entries: &[MapEntry]) -> Option<(usize, usize)> {
    entries
        .iter()
        .find(|e| e.path.as_deref() == Some("[stack]"))
        .map(|e| (e.low, e.high))
}

fn is_excluded_path(path: &Option<String>) -> bool {
    match path {
        None => false,
        Some(p) => EXCLUDED_PATH_FRAGMENTS.iter().any(|frag| p.contains(frag)),
    }
}

/// Entries worth scanning: writable, private (non-shared), non-executable,
/// and not a path this library knows it should never treat as
/// application data (the C library, the dynamic linker, special kernel
/// mappings, or this process's own stack entries -- those are scanned
/// directly from the interrupted thread's rsp, not via the map).
pub fn writable_private_ranges(entries: &[MapEntry]) -> Vec<(usize, usize)> {
    entries
        .iter()
        .filter(|e| e.writable && !e.shared && !e.executable)
        .filter(|e| e.path.as_deref() != Some("[stack]"))
        .filter(|e| !is_excluded_path(&e.path))
        .map(|e| (e.low, e.high))
        .collect()
}

/// Subtract every range this library's own page allocator owns from
/// `ranges`, carving "Swiss cheese" holes so the subprocess scanner never
/// walks the reclaimer's own bookkeeping structures as if they were
/// application data.
pub fn subtract_owned(ranges: &[(usize, usize)], owned: &[PageRange]) -> Vec<(usize, usize)> {
    let mut result = Vec::new();
    for &(mut low, high) in ranges {
        let mut cuts: Vec<&PageRange> = owned.iter().filter(|o| o.low < high && o.high > low).collect();
        cuts.sort_by_key(|o| o.low);
        for cut in cuts {
            if cut.low > low {
                result.push((low, cut.low.min(high)));
            }
            low = low.max(cut.high);
            if low >= high {
                break;
            }
        }
        if low < high {
            result.push((low, high));
        }
    }
    result
}

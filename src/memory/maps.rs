//! Memory regions parsed from `/proc/<pid>/maps`.
//!
//! ```text
//! address           perms offset  dev   inode   pathname
//! 00400000-00452000 r-xp 00000000 08:02 173521  /usr/bin/ls
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};

use crate::process::{LinuxTarget, Pid};
use crate::{MemOpResult, MemOpResultExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryPermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub shared: bool,
}

impl MemoryPermissions {
    pub fn parse(s: &str) -> Self {
        let bytes = s.as_bytes();
        MemoryPermissions {
            read: bytes.first() == Some(&b'r'),
            write: bytes.get(1) == Some(&b'w'),
            execute: bytes.get(2) == Some(&b'x'),
            shared: bytes.get(3) == Some(&b's'),
        }
    }
}

impl std::fmt::Display for MemoryPermissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
            if self.shared { 's' } else { 'p' }
        )
    }
}

/// One mapping of the target. Recomputed on every attach cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: usize,
    pub end: usize,
    pub perms: MemoryPermissions,
    /// Offset into the backing file
    pub offset: usize,
    /// Backing path or pseudo name (`[heap]`), empty for anonymous memory
    pub label: String,
}

impl MemoryRegion {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn is_readable(&self) -> bool {
        self.perms.read
    }

    pub fn contains(&self, address: usize) -> bool {
        (self.start..self.end).contains(&address)
    }

    /// File name part of the label, `client.so` for `/opt/game/bin/client.so`.
    pub fn file_name(&self) -> &str {
        self.label.rsplit('/').next().unwrap_or(&self.label)
    }
}

/// Parses a single maps line. Returns `None` for lines that do not look like a mapping.
pub fn parse_map_line(line: &str) -> Option<MemoryRegion> {
    let mut parts = line.split_whitespace();

    let (start_str, end_str) = parts.next()?.split_once('-')?;
    let start = usize::from_str_radix(start_str, 16).ok()?;
    let end = usize::from_str_radix(end_str, 16).ok()?;
    if end < start {
        return None;
    }

    let perms = MemoryPermissions::parse(parts.next()?);
    let offset = usize::from_str_radix(parts.next()?, 16).ok()?;

    // device, inode
    parts.next()?;
    parts.next()?;

    // Paths may contain spaces, and deleted files carry a " (deleted)" suffix.
    let label = parts.collect::<Vec<_>>().join(" ");

    Some(MemoryRegion {
        start,
        end,
        perms,
        offset,
        label,
    })
}

/// Parses maps content, skipping malformed lines.
pub fn parse_maps_content(content: &str) -> Vec<MemoryRegion> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_map_line)
        .collect()
}

/// Lazily yields the regions of a maps file, one line at a time.
pub struct MapsIter<R> {
    lines: std::io::Lines<R>,
}

impl<R: BufRead> Iterator for MapsIter<R> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    log::debug!("stopped reading maps: {err}");
                    return None;
                }
            };

            if let Some(region) = parse_map_line(&line) {
                return Some(region);
            }
        }
    }
}

/// Opens `/proc/<pid>/maps` for a single pass.
pub fn enumerate(pid: Pid) -> MemOpResult<MapsIter<BufReader<File>>> {
    let path = format!("/proc/{pid}/maps");
    let file = File::open(&path)
        .map_err(crate::MemOpError::from)
        .with_context(|| format!("failed to open {path}"))?;

    Ok(MapsIter {
        lines: BufReader::new(file).lines(),
    })
}

/// Lists the mappings of a process.
pub trait RegionSource {
    /// Every region of `pid` in the order the OS reports them.
    fn regions(&self, pid: Pid) -> MemOpResult<Vec<MemoryRegion>>;

    /// Regions whose label contains `label`. Empty, not an error, when nothing matches.
    fn find_by_label(&self, pid: Pid, label: &str) -> MemOpResult<Vec<MemoryRegion>> {
        Ok(filter_by_label(self.regions(pid)?, label))
    }
}

pub fn filter_by_label(
    regions: impl IntoIterator<Item = MemoryRegion>,
    label: &str,
) -> Vec<MemoryRegion> {
    regions
        .into_iter()
        .filter(|region| region.label.contains(label))
        .collect()
}

impl RegionSource for LinuxTarget {
    fn regions(&self, pid: Pid) -> MemOpResult<Vec<MemoryRegion>> {
        Ok(enumerate(pid)?.collect())
    }

    fn find_by_label(&self, pid: Pid, label: &str) -> MemOpResult<Vec<MemoryRegion>> {
        Ok(filter_by_label(enumerate(pid)?, label))
    }
}

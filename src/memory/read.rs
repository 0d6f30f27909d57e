use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use crate::process::Pid;
use crate::{MemOpError, MemOpResult};

pub(crate) fn mem_path(pid: Pid) -> String {
    format!("/proc/{pid}/mem")
}

/// Reads `size` bytes at `addr` from `/proc/<pid>/mem` in one positioned read.
pub fn read_bytes(pid: Pid, addr: usize, size: usize) -> MemOpResult<Vec<u8>> {
    let read_failed = |source: io::Error| MemOpError::ReadFailed {
        address: addr,
        len: size,
        source,
    };

    let file = File::open(mem_path(pid)).map_err(read_failed)?;
    let mut buffer = vec![0u8; size];

    let bytes_read = loop {
        match file.read_at(&mut buffer, addr as u64) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            result => break result.map_err(read_failed)?,
        }
    };

    if bytes_read != size {
        return Err(read_failed(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read: {bytes_read:#x} of {size:#x} bytes"),
        )));
    }

    Ok(buffer)
}

/// Reads the half-open range `[start, end)`.
pub fn read_range(pid: Pid, start: usize, end: usize) -> MemOpResult<Vec<u8>> {
    let size = end.checked_sub(start).ok_or_else(|| MemOpError::ReadFailed {
        address: start,
        len: 0,
        source: io::Error::new(io::ErrorKind::InvalidInput, "range end precedes start"),
    })?;

    read_bytes(pid, start, size)
}

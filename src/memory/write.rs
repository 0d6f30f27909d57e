use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;

use super::read::mem_path;
use crate::process::Pid;
use crate::{MemOpError, MemOpResult};

/// Writes `bytes` at `addr` through `/proc/<pid>/mem` with a single positioned write.
///
/// Read-only text pages are writable this way while the target is ptrace-stopped.
pub fn write_bytes(pid: Pid, addr: usize, bytes: &[u8]) -> MemOpResult<()> {
    let write_failed = |source: io::Error| MemOpError::WriteFailed {
        address: addr,
        len: bytes.len(),
        source,
    };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(mem_path(pid))
        .map_err(write_failed)?;

    let bytes_written = loop {
        match file.write_at(bytes, addr as u64) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            result => break result.map_err(write_failed)?,
        }
    };

    // Verify all bytes were written
    if bytes_written != bytes.len() {
        return Err(write_failed(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {bytes_written:#x} of {:#x} bytes", bytes.len()),
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::read::read_bytes;

    #[test]
    fn test_write_then_read_back() {
        let pid = std::process::id() as Pid;
        let target = vec![0u8; 32];
        let addr = target.as_ptr() as usize + 8;

        write_bytes(pid, addr, &[0x90, 0x90, 0xC3]).unwrap();
        assert_eq!(read_bytes(pid, addr, 3).unwrap(), vec![0x90, 0x90, 0xC3]);
        assert_eq!(read_bytes(pid, addr - 1, 1).unwrap(), vec![0x00]);

        drop(target);
    }

    #[test]
    fn test_write_unmapped_fails() {
        let err = write_bytes(std::process::id() as Pid, 0, &[0x90]).unwrap_err();
        assert!(matches!(err, MemOpError::WriteFailed { len: 1, .. }));
    }
}

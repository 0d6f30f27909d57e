pub mod maps;
pub mod read;
pub mod write;

pub use maps::{MemoryPermissions, MemoryRegion, RegionSource};

use crate::MemOpResult;
use crate::process::{LinuxTarget, Pid};

pub type Byte = Option<u8>;

/// Bulk reads and single writes against a remote address space.
pub trait MemoryIo {
    /// Reads `end - start` bytes beginning at `start`. Short reads are errors.
    fn read(&self, pid: Pid, start: usize, end: usize) -> MemOpResult<Vec<u8>>;

    /// Writes `bytes` at `address` with a single OS-level write. Short writes are errors.
    ///
    /// Nothing is read back; a failed write may have been partially applied.
    fn write(&self, pid: Pid, address: usize, bytes: &[u8]) -> MemOpResult<()>;
}

impl MemoryIo for LinuxTarget {
    fn read(&self, pid: Pid, start: usize, end: usize) -> MemOpResult<Vec<u8>> {
        read::read_range(pid, start, end)
    }

    fn write(&self, pid: Pid, address: usize, bytes: &[u8]) -> MemOpResult<()> {
        write::write_bytes(pid, address, bytes)
    }
}

pub mod control;
pub mod handle;
pub mod locate;
pub mod pattern;

pub use control::{AttachBracket, ProcessController};
pub use handle::{AttachState, ProcessHandle, SafeHandle, SafeHandleGuard};
pub use locate::{ProcessLocator, ProcessTable};

use parking_lot::Mutex;
use std::collections::HashMap;

pub type Pid = libc::pid_t;

/// A macro for acquiring a [`SafeHandle`] with timeout support.
///
/// Expands to a `MemOpResult<$ret>`: the block's result, or
/// `MemOpError::TimeoutReached` when the lock could not be taken in time.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use sigpatch::process::{ProcessHandle, SafeHandle};
///
/// let handle = SafeHandle::new(ProcessHandle::new(1234));
/// let pid = sigpatch::with_handle!(&handle, Some(Duration::from_secs(1)), |guard| -> i32, {
///     Ok(guard.pid())
/// });
/// ```
#[macro_export]
macro_rules! with_handle {
    ($handle:expr, $timeout:expr, |$guard:ident| -> $ret:ty, $block:expr) => {{
        let safe_handle: &$crate::process::SafeHandle = $handle;
        let result: $crate::MemOpResult<$ret> = match safe_handle.acquire_with_timeout($timeout) {
            Some($guard) => $block,
            None => Err($crate::MemOpError::TimeoutReached(($timeout, None))),
        };
        result
    }};
}

/// The live Linux host: `sysinfo` process table, ptrace and `/proc/<pid>/{maps,mem}`.
pub struct LinuxTarget {
    pub(crate) processes: ProcessTable,
    /// Thread ids stopped by the current bracket, per process.
    pub(crate) attached: Mutex<HashMap<Pid, Vec<Pid>>>,
}

impl LinuxTarget {
    pub fn new() -> Self {
        LinuxTarget {
            processes: ProcessTable::new(),
            attached: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LinuxTarget {
    fn default() -> Self {
        Self::new()
    }
}

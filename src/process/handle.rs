use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;

use super::Pid;

/// Life-state of a target process as seen by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Unattached,
    Attached,
    Detached,
}

/// Identifies a located target process and tracks whether it is currently under our control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: Pid,
    state: AttachState,
    brackets: u32,
}

impl ProcessHandle {
    pub fn new(pid: Pid) -> Self {
        ProcessHandle {
            pid,
            state: AttachState::Unattached,
            brackets: 0,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    /// Number of attach brackets opened so far.
    pub fn brackets(&self) -> u32 {
        self.brackets
    }

    pub(crate) fn mark_attached(&mut self) {
        self.state = AttachState::Attached;
        self.brackets += 1;
    }

    pub(crate) fn mark_detached(&mut self) {
        self.state = AttachState::Detached;
    }
}

/// Thread-safe wrapper around a [`ProcessHandle`] with timeout-based locking.
///
/// Holding the guard is what makes an attach bracket exclusive: no two
/// brackets can overlap for the same process even when the handle is shared
/// across threads.
pub struct SafeHandle {
    inner: Arc<Mutex<ProcessHandle>>,
}

impl Clone for SafeHandle {
    fn clone(&self) -> Self {
        SafeHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// RAII guard that provides exclusive access to the underlying handle.
pub struct SafeHandleGuard<'a> {
    guard: MutexGuard<'a, ProcessHandle>,
}

impl SafeHandle {
    pub fn new(handle: ProcessHandle) -> Self {
        SafeHandle {
            inner: Arc::new(Mutex::new(handle)),
        }
    }

    /// Attempts to acquire exclusive access to the handle with an optional timeout.
    ///
    /// # Arguments
    /// * `timeout` - Maximum time to wait for the lock. If None, blocks indefinitely.
    ///
    /// # Returns
    /// * `Some(SafeHandleGuard)` if the lock was acquired
    /// * `None` if the timeout expired before acquiring the lock
    pub fn acquire_with_timeout(&self, timeout: Option<Duration>) -> Option<SafeHandleGuard<'_>> {
        match timeout {
            Some(duration) => self.inner.try_lock_for(duration),
            None => Some(self.inner.lock()),
        }
        .map(|guard| SafeHandleGuard { guard })
    }

    /// Snapshot of the handle, blocking until no bracket holds it.
    pub fn snapshot(&self) -> ProcessHandle {
        self.inner.lock().clone()
    }
}

impl std::ops::Deref for SafeHandleGuard<'_> {
    type Target = ProcessHandle;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl std::ops::DerefMut for SafeHandleGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

use std::io;
use std::ptr;

use super::handle::SafeHandleGuard;
use super::{LinuxTarget, Pid};
use crate::{MemOpError, MemOpResult};

/// Suspends and resumes a target process for safe memory access.
pub trait ProcessController {
    /// Stops every thread of `pid` until [`ProcessController::detach`] is called.
    fn attach(&self, pid: Pid) -> MemOpResult<()>;

    /// Resumes `pid`. Callers log and swallow failures.
    fn detach(&self, pid: Pid) -> MemOpResult<()>;
}

/// One attach-to-detach window. Detaches on drop, on every exit path.
pub struct AttachBracket<'a, C: ProcessController + ?Sized> {
    controller: &'a C,
    handle: SafeHandleGuard<'a>,
}

impl<'a, C: ProcessController + ?Sized> AttachBracket<'a, C> {
    /// Attaches to the process behind `handle`, holding its lock for the bracket's lifetime.
    pub fn open(controller: &'a C, mut handle: SafeHandleGuard<'a>) -> MemOpResult<Self> {
        controller.attach(handle.pid())?;
        handle.mark_attached();
        log::trace!("attached to PID {}", handle.pid());

        Ok(AttachBracket { controller, handle })
    }

    pub fn pid(&self) -> Pid {
        self.handle.pid()
    }
}

impl<C: ProcessController + ?Sized> Drop for AttachBracket<'_, C> {
    fn drop(&mut self) {
        let pid = self.handle.pid();
        if let Err(err) = self.controller.detach(pid) {
            // The locator rediscovers a vanished process on the next pass.
            log::warn!("Detaching from PID {pid} failed: {}", err.root_cause_string());
        }

        self.handle.mark_detached();
        log::trace!("detached from PID {pid}");
    }
}

fn list_threads(pid: Pid) -> io::Result<Vec<Pid>> {
    let mut tids = std::fs::read_dir(format!("/proc/{pid}/task"))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<Pid>().ok())
        .collect::<Vec<_>>();

    tids.sort_unstable();
    Ok(tids)
}

fn ptrace_request(request: libc::c_uint, tid: Pid, signal: libc::c_int) -> io::Result<()> {
    let result = unsafe {
        libc::ptrace(
            request,
            tid,
            ptr::null_mut::<libc::c_void>(),
            signal as usize as *mut libc::c_void,
        )
    };

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// What a `waitpid` status means for a thread we just sent `PTRACE_ATTACH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopEvent {
    /// The attach `SIGSTOP` arrived
    Attached,
    /// Some other signal was dequeued first and must be handed back
    Signal(libc::c_int),
    Gone,
    Other,
}

fn classify_stop(status: libc::c_int) -> StopEvent {
    if libc::WIFSTOPPED(status) {
        match libc::WSTOPSIG(status) {
            libc::SIGSTOP => StopEvent::Attached,
            signal => StopEvent::Signal(signal),
        }
    } else if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
        StopEvent::Gone
    } else {
        StopEvent::Other
    }
}

fn wait_for_stop(tid: Pid) -> io::Result<()> {
    let mut status: libc::c_int = 0;

    loop {
        let result = unsafe { libc::waitpid(tid, &mut status, libc::__WALL) };
        if result == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        match classify_stop(status) {
            StopEvent::Attached => return Ok(()),
            StopEvent::Signal(signal) => {
                // Deliver it and keep waiting; our SIGSTOP is still queued behind it.
                log::trace!("thread {tid} stopped by signal {signal} before SIGSTOP");
                ptrace_request(libc::PTRACE_CONT, tid, signal)?;
            }
            StopEvent::Gone => return Err(io::Error::from_raw_os_error(libc::ESRCH)),
            StopEvent::Other => {}
        }
    }
}

fn attach_thread(tid: Pid) -> io::Result<()> {
    ptrace_request(libc::PTRACE_ATTACH, tid, 0)?;
    wait_for_stop(tid)
}

fn detach_threads(tids: &[Pid]) -> io::Result<()> {
    let mut first_error = None;

    for &tid in tids {
        if let Err(err) = ptrace_request(libc::PTRACE_DETACH, tid, 0) {
            log::trace!("PTRACE_DETACH {tid}: {err}");
            first_error.get_or_insert(err);
        }
    }

    first_error.map_or(Ok(()), Err)
}

/// Releases threads attached before a failure; the failure itself is what gets reported.
fn rollback(pid: Pid, attached: &[Pid]) {
    if let Err(err) = detach_threads(attached) {
        log::warn!("Releasing PID {pid} after a failed attach failed: {err}");
    }
}

/// Attaches every thread of `pid`, re-listing until no new threads appear.
fn attach_all(pid: Pid) -> io::Result<Vec<Pid>> {
    attach_thread(pid)?;
    let mut attached = vec![pid];

    loop {
        let pending = match list_threads(pid) {
            Ok(tids) => tids
                .into_iter()
                .filter(|tid| !attached.contains(tid))
                .collect::<Vec<_>>(),
            Err(err) => {
                rollback(pid, &attached);
                return Err(err);
            }
        };

        if pending.is_empty() {
            return Ok(attached);
        }

        for tid in pending {
            match attach_thread(tid) {
                Ok(()) => attached.push(tid),
                // Thread exited between listing and attaching.
                Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {}
                Err(err) => {
                    rollback(pid, &attached);
                    return Err(err);
                }
            }
        }
    }
}

impl ProcessController for LinuxTarget {
    fn attach(&self, pid: Pid) -> MemOpResult<()> {
        let tids = attach_all(pid).map_err(|source| MemOpError::AttachFailed { pid, source })?;
        log::trace!("stopped {} thread(s) of PID {pid}", tids.len());

        self.attached.lock().insert(pid, tids);
        Ok(())
    }

    fn detach(&self, pid: Pid) -> MemOpResult<()> {
        let tids = self.attached.lock().remove(&pid).unwrap_or_else(|| vec![pid]);
        detach_threads(&tids)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Linux wait status encodings: stopped = (sig << 8) | 0x7f, exited = code << 8, killed = sig.
    fn stopped_by(signal: libc::c_int) -> libc::c_int {
        (signal << 8) | 0x7f
    }

    #[test]
    fn test_only_sigstop_completes_attach() {
        assert_eq!(classify_stop(stopped_by(libc::SIGSTOP)), StopEvent::Attached);
        assert_eq!(
            classify_stop(stopped_by(libc::SIGUSR1)),
            StopEvent::Signal(libc::SIGUSR1)
        );
        assert_eq!(
            classify_stop(stopped_by(libc::SIGCHLD)),
            StopEvent::Signal(libc::SIGCHLD)
        );
    }

    #[test]
    fn test_exit_and_kill_mean_gone() {
        assert_eq!(classify_stop(3 << 8), StopEvent::Gone);
        assert_eq!(classify_stop(libc::SIGKILL), StopEvent::Gone);
    }

    #[test]
    fn test_rollback_of_untraced_thread_does_not_panic() {
        // Not traced by us, so PTRACE_DETACH fails; the failure is only logged.
        rollback(1, &[1]);
        assert!(detach_threads(&[1]).is_err());
    }
}

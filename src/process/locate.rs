use parking_lot::Mutex;
use sysinfo::System;

use super::{LinuxTarget, Pid};

/// Linux truncates a task's comm name to this many bytes.
const TASK_COMM_LEN: usize = 15;

/// Resolves a process id from a process name.
pub trait ProcessLocator {
    /// Returns the pid of a live process named `process_name`, if any.
    ///
    /// When several processes match, any one of them may be returned.
    fn find(&self, process_name: &str) -> Option<Pid>;
}

/// Whether a process table entry named `candidate` satisfies a lookup for `query`.
///
/// Accepts the kernel-truncated comm form of long executable names.
pub fn name_matches(candidate: &str, query: &str) -> bool {
    if candidate == query {
        return true;
    }

    query.len() > TASK_COMM_LEN
        && candidate.len() == TASK_COMM_LEN
        && query.as_bytes().starts_with(candidate.as_bytes())
}

fn is_thread_group_leader(pid: Pid) -> bool {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
        return true;
    };

    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|tgid| tgid.trim().parse::<Pid>().ok())
        .is_none_or(|tgid| tgid == pid)
}

/// Process table backed by `sysinfo`, refreshed on every lookup.
pub struct ProcessTable {
    system: Mutex<System>,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLocator for ProcessTable {
    fn find(&self, process_name: &str) -> Option<Pid> {
        let mut system = self.system.lock();
        system.refresh_processes();

        let own_pid = std::process::id();
        let pid = system
            .processes()
            .values()
            .filter(|process| process.pid().as_u32() != own_pid)
            .filter(|process| name_matches(process.name(), process_name))
            .map(|process| process.pid().as_u32() as Pid)
            // Threads show up as processes sharing the leader's name.
            .find(|&pid| is_thread_group_leader(pid));

        log::trace!("lookup \"{process_name}\" -> {pid:?}");
        pid
    }
}

impl ProcessLocator for LinuxTarget {
    fn find(&self, process_name: &str) -> Option<Pid> {
        self.processes.find(process_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_matches_exact() {
        assert!(name_matches("tf_linux64", "tf_linux64"));
        assert!(!name_matches("tf_linux6", "tf_linux64"));
        assert!(!name_matches("tf_linux64_x", "tf_linux64"));
    }

    #[test]
    fn test_name_matches_truncated_comm() {
        assert!(name_matches("a_very_long_pro", "a_very_long_process_name"));
        assert!(!name_matches("a_very_long_prx", "a_very_long_process_name"));
        assert!(!name_matches("a_very", "a_very_long_process_name"));
    }

    #[test]
    fn test_missing_process_is_none() {
        let table = ProcessTable::new();
        assert_eq!(table.find("sigpatch-no-such-process-4f1c"), None);
    }
}

//! Wait for a process, wait for its module, patch every configured signature once.

pub mod wait;

pub use wait::{Backoff, CancelToken, Deadline};

use std::time::Duration;

use crate::memory::{MemoryIo, MemoryRegion, RegionSource};
use crate::process::pattern::{self, Pattern};
use crate::process::{
    AttachBracket, Pid, ProcessController, ProcessHandle, ProcessLocator, SafeHandle,
    SafeHandleGuard,
};
use crate::{MemOpError, MemOpResult, memop_err, with_handle};

/// Everything the engine needs from the host OS.
pub trait TargetOs: ProcessLocator + ProcessController + RegionSource + MemoryIo {}

impl<T> TargetOs for T where T: ProcessLocator + ProcessController + RegionSource + MemoryIo + ?Sized {}

/// A signature to find and the bytes to write at its first match.
///
/// The replacement may be longer or shorter than the pattern; it is written
/// starting at the match address regardless of what follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSpec {
    pub name: Option<String>,
    pub pattern: Pattern,
    pub replacement: Vec<u8>,
}

impl PatchSpec {
    pub fn new(pattern: Pattern, replacement: Vec<u8>) -> MemOpResult<Self> {
        if replacement.is_empty() {
            return Err(MemOpError::InvalidPattern(
                "replacement is empty".to_string(),
            ));
        }

        Ok(PatchSpec {
            name: None,
            pattern,
            replacement,
        })
    }

    /// Builds a spec from IDA-style pattern text and hex replacement text.
    pub fn parse(pattern: &str, replacement: &str) -> MemOpResult<Self> {
        PatchSpec::new(
            Pattern::parse(pattern)?,
            pattern::parse_hex_bytes(replacement)?,
        )
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name used in log lines.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("[{}]", self.pattern),
        }
    }
}

/// What happened to one spec during the last bracket.
///
/// `address` without `applied` means the pattern matched but the write failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    pub applied: bool,
    pub address: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Searching,
    Attaching,
    ScanningModule,
    Patching,
    Applied,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct PatchReport {
    pub pid: Pid,
    /// `Applied` or `TimedOut`
    pub state: EngineState,
    /// One entry per spec, in configuration order
    pub outcomes: Vec<PatchOutcome>,
    /// Attach brackets opened
    pub brackets: u32,
    pub elapsed: Duration,
}

impl PatchReport {
    pub fn is_applied(&self) -> bool {
        self.state == EngineState::Applied
    }

    pub fn applied_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.applied).count()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub process_name: String,
    /// Substring matched against the maps label of each region
    pub module_label: String,
    /// Budget for process discovery, and again for patching once the process is found
    pub budget: Duration,
    /// Interval between process table lookups
    pub poll_interval: Duration,
    /// Delay between attach brackets
    pub backoff: Backoff,
    /// How long a bracket waits for another bracket on the same process
    pub lock_timeout: Duration,
}

impl EngineConfig {
    pub const DEFAULT_BUDGET: Duration = Duration::from_secs(300);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

    pub fn new(process_name: impl Into<String>, module_label: impl Into<String>) -> Self {
        EngineConfig {
            process_name: process_name.into(),
            module_label: module_label.into(),
            budget: Self::DEFAULT_BUDGET,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            backoff: Backoff::Fixed(Self::DEFAULT_POLL_INTERVAL),
            lock_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Sets the lookup interval and a fixed backoff of the same length.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.backoff = Backoff::Fixed(interval);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

pub struct PatchEngine<T: TargetOs> {
    target: T,
    specs: Vec<PatchSpec>,
    config: EngineConfig,
    cancel: CancelToken,
}

impl<T: TargetOs> PatchEngine<T> {
    pub fn new(target: T, specs: Vec<PatchSpec>, config: EngineConfig) -> MemOpResult<Self> {
        if specs.is_empty() {
            return Err(memop_err!("no patch specs configured"));
        }

        Ok(PatchEngine {
            target,
            specs,
            config,
            cancel: CancelToken::new(),
        })
    }

    /// Token that aborts [`PatchEngine::run`] at its next wait.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn specs(&self) -> &[PatchSpec] {
        &self.specs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs until every reachable spec is applied once or the budget runs out.
    ///
    /// Discovery and patching each get the full budget; the patch clock starts
    /// when the process is found. Returns `DiscoveryTimeout` if the process never
    /// showed up and `Cancelled` if the token fired. Running out of budget after
    /// the process was found is reported as a `TimedOut` report, not an error.
    pub fn run(&self) -> MemOpResult<PatchReport> {
        let discovery = Deadline::start(self.config.budget);

        log::info!("Waiting for process \"{}\"...", self.config.process_name);
        let mut pid = self.wait_for_process(&discovery)?;
        log::info!("Found {} at PID {pid}", self.config.process_name);
        log::info!("Waiting for module \"{}\"...", self.config.module_label);

        let deadline = Deadline::start(self.config.budget);
        let mut handle = SafeHandle::new(ProcessHandle::new(pid));
        let mut last_outcomes = vec![PatchOutcome::default(); self.specs.len()];
        let mut carried = 0;
        let mut brackets = 0;
        let mut attempt = 0;

        while !deadline.expired() {
            self.check_cancelled()?;
            self.transition(EngineState::Attaching);

            let result = with_handle!(&handle, Some(self.config.lock_timeout), |guard| -> Vec<PatchOutcome>, {
                self.patch_bracket(guard)
            });
            brackets = carried + handle.snapshot().brackets();

            match result {
                Ok(outcomes) if outcomes.iter().any(|o| o.applied) => {
                    self.transition(EngineState::Applied);
                    let report = PatchReport {
                        pid,
                        state: EngineState::Applied,
                        outcomes,
                        brackets,
                        elapsed: discovery.elapsed(),
                    };
                    log::info!(
                        "Applied {} of {} patch(es) to PID {pid}",
                        report.applied_count(),
                        self.specs.len()
                    );
                    return Ok(report);
                }
                Ok(outcomes) => {
                    log::debug!("no signature applied in pass {attempt}");
                    last_outcomes = outcomes;
                }
                Err(MemOpError::AttachFailed { source, .. }) => {
                    log::debug!("attach to PID {pid} failed: {source}");
                    if let Some(current) = self.relocate(pid) {
                        // Same name, new process: the old pid will never attach again.
                        carried = brackets;
                        pid = current;
                        handle = SafeHandle::new(ProcessHandle::new(pid));
                    }
                }
                Err(err) if err.is_recoverable() => {
                    log::debug!("pass {attempt}: {}", err.root_cause_string())
                }
                Err(err) => return Err(err),
            }

            self.pause(self.config.backoff.delay(attempt), &deadline)?;
            attempt = attempt.saturating_add(1);
        }

        self.transition(EngineState::TimedOut);
        log::warn!(
            "Gave up on PID {pid} after {} seconds and {brackets} attach attempt(s)",
            deadline.budget().as_secs()
        );

        for (spec, outcome) in self.specs.iter().zip(&last_outcomes) {
            if let Some(address) = outcome.address {
                log::warn!("{} matched at {address:#x} but could not be written", spec.label());
            }
        }

        Ok(PatchReport {
            pid,
            state: EngineState::TimedOut,
            outcomes: last_outcomes,
            brackets,
            elapsed: discovery.elapsed(),
        })
    }

    fn wait_for_process(&self, deadline: &Deadline) -> MemOpResult<Pid> {
        self.transition(EngineState::Searching);

        loop {
            self.check_cancelled()?;

            if let Some(pid) = self.target.find(&self.config.process_name) {
                return Ok(pid);
            }

            if deadline.expired() {
                return Err(MemOpError::DiscoveryTimeout {
                    process: self.config.process_name.clone(),
                    budget: deadline.budget(),
                });
            }

            self.pause(self.config.poll_interval, deadline)?;
        }
    }

    /// Looks the process up again after a failed attach. Returns a replacement pid if it changed.
    fn relocate(&self, pid: Pid) -> Option<Pid> {
        match self.target.find(&self.config.process_name) {
            Some(current) if current != pid => {
                log::info!(
                    "{} restarted, now at PID {current}",
                    self.config.process_name
                );
                Some(current)
            }
            Some(_) => None,
            None => {
                log::info!("{} is not running", self.config.process_name);
                None
            }
        }
    }

    /// One attach-to-detach window. The bracket detaches on every return path.
    fn patch_bracket(&self, guard: SafeHandleGuard<'_>) -> MemOpResult<Vec<PatchOutcome>> {
        let bracket = AttachBracket::open(&self.target, guard)?;
        let pid = bracket.pid();

        self.transition(EngineState::ScanningModule);
        let regions = self.target.find_by_label(pid, &self.config.module_label)?;
        if regions.is_empty() {
            return Err(MemOpError::ModuleNotMapped {
                pid,
                label: self.config.module_label.clone(),
            });
        }
        log::trace!(
            "{} region(s) labeled \"{}\"",
            regions.len(),
            self.config.module_label
        );

        self.transition(EngineState::Patching);
        self.patch_regions(pid, &regions)
    }

    fn patch_regions(&self, pid: Pid, regions: &[MemoryRegion]) -> MemOpResult<Vec<PatchOutcome>> {
        let mut outcomes = vec![PatchOutcome::default(); self.specs.len()];
        let mut attempted = vec![false; self.specs.len()];

        for region in regions {
            if attempted.iter().all(|&a| a) {
                break;
            }

            if !region.is_readable() || region.size() == 0 {
                log::trace!(
                    "skipping {:#x}-{:#x} {}",
                    region.start,
                    region.end,
                    region.perms
                );
                continue;
            }

            let buffer = match self.target.read(pid, region.start, region.end) {
                Ok(buffer) => buffer,
                // Keep what already landed; otherwise give up on this bracket.
                Err(err) if outcomes.iter().any(|o| o.applied) => {
                    log::warn!("{}", err.root_cause_string());
                    break;
                }
                Err(err) => return Err(err),
            };

            // Later specs match against this snapshot, not against our own writes.
            for (index, spec) in self.specs.iter().enumerate() {
                if attempted[index] {
                    continue;
                }

                let Some(offset) = pattern::find_first(&buffer, spec.pattern.as_slice()) else {
                    continue;
                };

                attempted[index] = true;
                let address = region.start + offset;
                outcomes[index].address = Some(address);

                if offset + spec.replacement.len() > buffer.len() {
                    log::debug!(
                        "replacement for {} runs {:#x} byte(s) past {:#x}",
                        spec.label(),
                        offset + spec.replacement.len() - buffer.len(),
                        region.end
                    );
                }

                match self.target.write(pid, address, &spec.replacement) {
                    Ok(()) => {
                        outcomes[index].applied = true;
                        log::info!(
                            "Found pattern {} (size={}) at {address:#x}; replaced with {} bytes",
                            spec.label(),
                            spec.pattern.len(),
                            spec.replacement.len()
                        );
                    }
                    Err(err) => log::warn!(
                        "Patching {} failed: {}",
                        spec.label(),
                        err.root_cause_string()
                    ),
                }
            }
        }

        Ok(outcomes)
    }

    fn pause(&self, delay: Duration, deadline: &Deadline) -> MemOpResult<()> {
        if self.cancel.sleep(delay.min(deadline.remaining())) {
            Ok(())
        } else {
            Err(MemOpError::Cancelled)
        }
    }

    fn check_cancelled(&self) -> MemOpResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MemOpError::Cancelled);
        }
        Ok(())
    }

    fn transition(&self, state: EngineState) {
        log::debug!("-> {state:?}");
    }
}

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Delay policy between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `initial * factor^attempt`, capped at `max`
    Exponential {
        initial: Duration,
        max: Duration,
        factor: u32,
    },
}

impl Backoff {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => {
                let scale = factor.max(1).checked_pow(attempt).unwrap_or(u32::MAX);
                initial.checked_mul(scale).unwrap_or(max).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_millis(1000))
    }
}

/// Wall-clock budget shared by every phase of a run.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn start(budget: Duration) -> Self {
        Deadline {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// Clonable cancellation flag. Cancelling wakes every pending [`CancelToken::sleep`].
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wakeup) = &*self.inner;
        *flag.lock() = true;
        wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Blocks for `duration` or until cancelled. Returns false when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, wakeup) = &*self.inner;
        let until = Instant::now() + duration;

        let mut cancelled = flag.lock();
        while !*cancelled {
            if wakeup.wait_until(&mut cancelled, until).timed_out() {
                break;
            }
        }

        !*cancelled
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed(Duration::from_millis(250));
        assert_eq!(backoff.delay(0), Duration::from_millis(250));
        assert_eq!(backoff.delay(10), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(64), Duration::from_secs(1));
    }

    #[test]
    fn test_deadline_expires() {
        let deadline = Deadline::start(Duration::ZERO);
        assert!(deadline.expired());
        assert!(!Deadline::start(Duration::from_secs(60)).expired());
    }

    #[test]
    fn test_cancel_wakes_sleeper() {
        let token = CancelToken::new();
        let sleeper = token.clone();

        let started = Instant::now();
        let thread = std::thread::spawn(move || sleeper.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();

        assert!(!thread.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!token.sleep(Duration::from_secs(30)));
    }

    #[test]
    fn test_sleep_completes_without_cancel() {
        assert!(CancelToken::new().sleep(Duration::from_millis(5)));
    }
}

use std::{fmt, num::ParseIntError, time::Duration};

use crate::process::Pid;

/// Represents errors that can occur while locating, attaching to or patching a target
#[derive(Debug)]
pub enum MemOpError {
    /// A lock or wait did not complete in time
    TimeoutReached((Option<Duration>, Option<anyhow::Error>)),
    /// The target process never appeared within the overall budget
    DiscoveryTimeout { process: String, budget: Duration },
    /// ptrace attach was refused (privilege, process gone, already traced)
    AttachFailed { pid: Pid, source: std::io::Error },
    /// No region of the target carries the module label yet
    ModuleNotMapped { pid: Pid, label: String },
    /// Remote read returned short or errored
    ReadFailed {
        address: usize,
        len: usize,
        source: std::io::Error,
    },
    /// Remote write returned short or errored
    WriteFailed {
        address: usize,
        len: usize,
        source: std::io::Error,
    },
    /// Pattern or replacement text could not be parsed
    InvalidPattern(String),
    /// The caller cancelled the run
    Cancelled,
    /// Generic error that wraps an anyhow::Error
    Other(anyhow::Error),
}

impl MemOpError {
    /// Returns true if this is a `TimeoutReached` or `DiscoveryTimeout` error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            MemOpError::TimeoutReached(_) | MemOpError::DiscoveryTimeout { .. }
        )
    }

    /// Returns true if the patch loop should absorb this error and try again later.
    ///
    /// Only budget exhaustion, cancellation and configuration problems end a run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MemOpError::TimeoutReached(_)
                | MemOpError::AttachFailed { .. }
                | MemOpError::ModuleNotMapped { .. }
                | MemOpError::ReadFailed { .. }
                | MemOpError::WriteFailed { .. }
                | MemOpError::Other(_)
        )
    }

    /// Converts this error to its underlying root cause string
    pub fn root_cause_string(&self) -> String {
        match self {
            MemOpError::TimeoutReached((timeout, err)) => match (timeout, err) {
                (Some(t), Some(e)) => {
                    format!("Operation of context \"{e}\" failed to complete within timeout \"{:#?}\".", t)
                }
                (Some(t), None) => {
                    format!("Operation failed to complete within timeout \"{:#?}\".", t)
                }
                (None, Some(e)) => {
                    format!("Operation of context \"{e}\" failed to complete within its timeout.")
                }
                (None, None) => "Operation failed to complete within timeout.".to_string(),
            },
            MemOpError::DiscoveryTimeout { process, budget } => {
                format!("Could not find process \"{process}\" within {} seconds", budget.as_secs())
            }
            MemOpError::AttachFailed { pid, source } => {
                format!("ptrace attach to PID {pid} failed: {source}")
            }
            MemOpError::ModuleNotMapped { pid, label } => {
                format!("No mapping labeled \"{label}\" in PID {pid}")
            }
            MemOpError::ReadFailed { address, len, source } => {
                format!("Reading {len:#x} bytes at {address:#x} failed: {source}")
            }
            MemOpError::WriteFailed { address, len, source } => {
                format!("Writing {len:#x} bytes at {address:#x} failed: {source}")
            }
            MemOpError::InvalidPattern(msg) => format!("Invalid pattern: {msg}"),
            MemOpError::Cancelled => "Cancelled".to_string(),
            MemOpError::Other(err) => format!("{:#}", err),
        }
    }
}

impl fmt::Display for MemOpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemOpError: \"{}\"", &self.root_cause_string())
    }
}

impl std::error::Error for MemOpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemOpError::AttachFailed { source, .. }
            | MemOpError::ReadFailed { source, .. }
            | MemOpError::WriteFailed { source, .. } => Some(source),
            MemOpError::Other(err) => err.source(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for MemOpError {
    fn from(err: anyhow::Error) -> Self {
        MemOpError::Other(err)
    }
}

impl From<std::io::Error> for MemOpError {
    fn from(err: std::io::Error) -> Self {
        MemOpError::Other(anyhow::Error::new(err))
    }
}

impl From<ParseIntError> for MemOpError {
    fn from(err: ParseIntError) -> Self {
        MemOpError::InvalidPattern(err.to_string())
    }
}

pub type MemOpResult<T> = Result<T, MemOpError>;

/// Extension trait to add anyhow-like methods to MemOpResult
pub trait MemOpResultExt<T> {
    /// Add context to an error
    fn context<C>(self, context: C) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static;

    /// Add context to an error with a lazy closure
    fn with_context<C, F>(self, f: F) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T> MemOpResultExt<T> for MemOpResult<T> {
    fn context<C>(self, context: C) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        self.map_err(|err| match err {
            MemOpError::Other(inner) => MemOpError::Other(inner.context(context)),
            // Typed variants keep their identity so callers can still classify them.
            typed => typed,
        })
    }

    fn with_context<C, F>(self, f: F) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|err| match err {
            MemOpError::Other(inner) => MemOpError::Other(inner.context(f())),
            typed => typed,
        })
    }
}

impl<T> MemOpResultExt<T> for Option<T> {
    fn context<C>(self, context: C) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        self.ok_or_else(|| MemOpError::Other(anyhow::anyhow!("{}", context)))
    }

    fn with_context<C, F>(self, f: F) -> MemOpResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| MemOpError::Other(anyhow::anyhow!("{}", f())))
    }
}

// Allow macro-based error creation, similar to anyhow::anyhow!
#[macro_export]
macro_rules! memop_err {
    ($msg:literal $(,)?) => {
        $crate::MemOpError::Other(anyhow::anyhow!($msg))
    };
    ($err:expr $(,)?) => {
        $crate::MemOpError::Other(anyhow::anyhow!($err))
    };
    ($fmt:literal, $($arg:tt)*) => {
        $crate::MemOpError::Other(anyhow::anyhow!($fmt, $($arg)*))
    };
}

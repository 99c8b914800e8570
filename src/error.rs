//! Error taxonomy (spec.md §7).
//!
//! Kinds, not names: every IPC primitive in `sys/` surfaces through one of
//! these variants so callers never have to match on raw errno values.

use std::fmt;

use thiserror::Error;

/// Errors produced by the bulkhead/circuit-breaker kernel.
#[derive(Debug, Error)]
pub enum Error {
    /// Bulkhead ticket wait expired.
    #[error("timed out acquiring a ticket for resource {name}")]
    Timeout { name: String },

    /// Circuit breaker is OPEN; fast-failed without attempting the call.
    #[error("circuit open for resource {name}")]
    CircuitOpen { name: String },

    /// No ticket available on a non-waiting path (timeout == Some(0)).
    #[error("resource {name} is busy, no ticket available")]
    ResourceBusy { name: String },

    /// Kernel-level IPC failure that was not a swallowed race (EIDRM/EINVAL on
    /// a concurrent destroy).
    #[error("syscall {call} failed for resource {name}: {source}")]
    Syscall {
        name: String,
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Invariant violation: corrupted or wedged shared state. Indicates
    /// operator action (destroy and recreate the resource).
    #[error("internal error for resource {name}: {message}")]
    Internal { name: String, message: String },

    /// The caller-supplied block raised. Recorded into the breaker and the
    /// ticket was released before this propagates.
    #[error("adapter error: {source}")]
    Adapter {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    pub fn syscall(name: impl Into<String>, call: &'static str, source: std::io::Error) -> Self {
        Error::Syscall {
            name: name.into(),
            call,
            source,
        }
    }

    pub fn internal(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Internal {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn adapter<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Adapter {
            source: Box::new(source),
        }
    }

    /// True for the recoverable-race errnos a destroy/unregister path should
    /// swallow (EIDRM, EINVAL) rather than surface to the caller.
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            Error::Syscall { source, .. }
                if matches!(
                    source.raw_os_error(),
                    Some(libc::EIDRM) | Some(libc::EINVAL)
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wraps the two outcomes an internal acquisition can produce before the
/// public edge converts rejection into an `Error` (Design Note "exceptions as
/// control flow", spec.md §9).
pub enum AcquireOutcome<T> {
    Ran(T),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    CircuitOpen,
    Timeout,
    Busy,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::CircuitOpen => write!(f, "circuit_open"),
            RejectReason::Timeout => write!(f, "timeout"),
            RejectReason::Busy => write!(f, "busy"),
        }
    }
}

impl RejectReason {
    pub fn into_error(self, name: impl Into<String>) -> Error {
        let name = name.into();
        match self {
            RejectReason::CircuitOpen => Error::CircuitOpen { name },
            RejectReason::Timeout => Error::Timeout { name },
            RejectReason::Busy => Error::ResourceBusy { name },
        }
    }
}

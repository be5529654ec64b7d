//! Error types for the locking core
//!
//! Every lock, unlock and shared-index call returns [`Result`]. The tri-state
//! outcome callers care about maps onto it directly:
//!
//! - `Ok(_)`: the request was granted
//! - `Err(Error::Busy)`: contention; always safe to retry from the current level
//! - any other `Err`: a hard failure of the enclosing operation
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for locking operations
pub type Result<T> = std::result::Result<T, Error>;

/// The step that was running when an OS call failed
///
/// Carried by [`Error::Io`] so callers can tell a failed read-lock downgrade
/// from a failed shared-index open without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoOp {
    /// Acquiring a byte-range lock
    Lock,
    /// Releasing a byte-range lock
    Unlock,
    /// Re-acquiring a read lock while downgrading
    RdLock,
    /// Probing the reserved byte
    CheckReservedLock,
    /// Opening the database file
    Open,
    /// Closing a descriptor
    Close,
    /// Reading file metadata
    Fstat,
    /// Opening the shared-index file
    ShmOpen,
    /// Resizing the shared-index file
    ShmSize,
    /// Mapping a shared-index region
    ShmMap,
    /// Acquiring or releasing a shared-index lock byte
    ShmLock,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoOp::Lock => "lock",
            IoOp::Unlock => "unlock",
            IoOp::RdLock => "read-lock",
            IoOp::CheckReservedLock => "check-reserved-lock",
            IoOp::Open => "open",
            IoOp::Close => "close",
            IoOp::Fstat => "fstat",
            IoOp::ShmOpen => "shm-open",
            IoOp::ShmSize => "shm-size",
            IoOp::ShmMap => "shm-map",
            IoOp::ShmLock => "shm-lock",
        };
        f.write_str(name)
    }
}

/// Error types for the locking core
#[derive(Debug, Error)]
pub enum Error {
    /// Lock contention; the database is locked by another connection
    #[error("database is locked")]
    Busy,

    /// An OS call failed for a reason other than contention
    #[error("I/O error during {op}: {source}")]
    Io {
        /// Step that failed
        op: IoOp,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// A de-escalation released part of its locks and then failed
    ///
    /// On-disk consistency expectations can no longer be trusted for this
    /// handle; the enclosing transaction must be abandoned.
    #[error("unlock failed: {source}")]
    UnlockFailed {
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The shared index has never been initialized and this connection is
    /// read-only, so it cannot initialize it
    #[error("shared index cannot be initialized from a read-only connection")]
    ReadOnlyCantInit,

    /// A write was required on a read-only file
    #[error("attempt to write a read-only file: {0}")]
    ReadOnly(String),

    /// Caller broke the locking contract (debug builds assert instead)
    #[error("protocol violation: {0}")]
    Misuse(String),

    /// Operation not supported by the selected lock back-end
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap an OS error with the step it came from
    pub fn io(op: IoOp, source: io::Error) -> Self {
        Error::Io { op, source }
    }

    /// Whether this is lock contention
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy)
    }

    /// Whether the caller may retry the same request unchanged
    ///
    /// Only contention is retryable; I/O failures are never retried
    /// automatically.
    pub fn is_retryable(&self) -> bool {
        self.is_busy()
    }

    /// The failing step, for I/O errors
    pub fn io_op(&self) -> Option<IoOp> {
        match self {
            Error::Io { op, .. } => Some(*op),
            Error::UnlockFailed { .. } => Some(IoOp::Unlock),
            _ => None,
        }
    }
}

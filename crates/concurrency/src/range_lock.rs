//! Range-lock primitive adapter
//!
//! A thin capability over the OS advisory byte-range lock call. Everything
//! above this module talks to [`RangeLock`] and never to `fcntl` directly, so
//! tests can swap in [`SimulatedRangeLock`](crate::testing::SimulatedRangeLock)
//! to model several processes inside one test binary.
//!
//! POSIX advisory locks are owned by the *process*, not the descriptor:
//! - a second lock call on an overlapping range from the same process
//!   replaces the first instead of conflicting with it
//! - closing *any* descriptor on the file drops every lock the process holds
//!   on it
//!
//! The registry and the lock state machine are built around those two facts.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use strata_core::{PENDING_BYTE, RESERVED_BYTE, SHARED_FIRST, SHARED_SIZE};
use tracing::trace;

// ============================================================================
// Ranges
// ============================================================================

/// A byte range within a file
///
/// `len == 0` means "from `start` to end of file", matching `fcntl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// First byte
    pub start: u64,
    /// Number of bytes, or 0 for "to end of file"
    pub len: u64,
}

impl ByteRange {
    /// Create a range
    pub const fn new(start: u64, len: u64) -> Self {
        ByteRange { start, len }
    }

    /// The whole file
    pub const WHOLE_FILE: ByteRange = ByteRange::new(0, 0);
    /// The pending byte
    pub const PENDING: ByteRange = ByteRange::new(PENDING_BYTE, 1);
    /// The reserved byte
    pub const RESERVED: ByteRange = ByteRange::new(RESERVED_BYTE, 1);
    /// The pending and reserved bytes together
    pub const PENDING_AND_RESERVED: ByteRange = ByteRange::new(PENDING_BYTE, 2);
    /// The shared range
    pub const SHARED: ByteRange = ByteRange::new(SHARED_FIRST, SHARED_SIZE);

    /// One past the last byte, or `None` for an open-ended range
    pub fn end(&self) -> Option<u64> {
        if self.len == 0 {
            None
        } else {
            Some(self.start + self.len)
        }
    }

    /// Whether `byte` falls inside the range
    pub fn contains(&self, byte: u64) -> bool {
        byte >= self.start && self.end().map_or(true, |end| byte < end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end() {
            Some(end) => write!(f, "[{:#x}, {:#x})", self.start, end),
            None => write!(f, "[{:#x}, EOF)", self.start),
        }
    }
}

/// Mode of a range lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Shared (`F_RDLCK`)
    Read,
    /// Exclusive (`F_WRLCK`)
    Write,
}

impl LockKind {
    /// Whether a lock of this kind held by another process blocks `other`
    pub fn conflicts_with(&self, other: LockKind) -> bool {
        matches!(self, LockKind::Write) || matches!(other, LockKind::Write)
    }
}

// ============================================================================
// Trait
// ============================================================================

/// Advisory byte-range locking on an open file
///
/// Implementations must treat locks as per-process, not per-descriptor.
pub trait RangeLock: Send + Sync + fmt::Debug {
    /// Try to take a lock without blocking
    ///
    /// Returns `Ok(true)` when granted, `Ok(false)` when another process
    /// holds a conflicting lock, and `Err` for any other failure.
    fn try_lock(&self, file: &File, range: ByteRange, kind: LockKind) -> io::Result<bool>;

    /// Release whatever this process holds over `range`
    fn unlock(&self, file: &File, range: ByteRange) -> io::Result<()>;

    /// Report the kind of a lock another process holds that would block a
    /// `kind` request over `range`, without taking anything
    fn probe(&self, file: &File, range: ByteRange, kind: LockKind) -> io::Result<Option<LockKind>>;

    /// Physically close a descriptor
    ///
    /// Under POSIX this drops every lock the process holds on the file,
    /// whichever descriptor they were taken through.
    fn release_descriptor(&self, file: File) -> io::Result<()> {
        drop(file);
        Ok(())
    }
}

// ============================================================================
// POSIX fcntl implementation
// ============================================================================

/// [`RangeLock`] backed by `fcntl(F_SETLK)` / `fcntl(F_GETLK)`
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixRangeLock;

impl PosixRangeLock {
    /// Create the fcntl adapter
    pub fn new() -> Self {
        PosixRangeLock
    }
}

#[allow(clippy::cast_possible_wrap)]
fn flock_for(l_type: libc::c_int, range: ByteRange) -> libc::flock {
    // SAFETY: `flock` is a plain C struct; all-zero is a valid value and
    // leaves platform-specific padding fields cleared.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = range.start as libc::off_t;
    fl.l_len = range.len as libc::off_t;
    fl
}

fn l_type_of(kind: LockKind) -> libc::c_int {
    match kind {
        LockKind::Read => libc::F_RDLCK as libc::c_int,
        LockKind::Write => libc::F_WRLCK as libc::c_int,
    }
}

impl RangeLock for PosixRangeLock {
    fn try_lock(&self, file: &File, range: ByteRange, kind: LockKind) -> io::Result<bool> {
        let fl = flock_for(l_type_of(kind), range);
        let rc = fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&fl));
        trace!(target: "strata::lock", %range, ?kind, ok = rc.is_ok(), "fcntl F_SETLK");
        match rc {
            Ok(_) => Ok(true),
            Err(Errno::EACCES | Errno::EAGAIN) => Ok(false),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn unlock(&self, file: &File, range: ByteRange) -> io::Result<()> {
        let fl = flock_for(libc::F_UNLCK as libc::c_int, range);
        trace!(target: "strata::lock", %range, "fcntl F_UNLCK");
        fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&fl))
            .map(|_| ())
            .map_err(io::Error::from)
    }

    fn probe(&self, file: &File, range: ByteRange, kind: LockKind) -> io::Result<Option<LockKind>> {
        let mut fl = flock_for(l_type_of(kind), range);
        fcntl(file.as_raw_fd(), FcntlArg::F_GETLK(&mut fl)).map_err(io::Error::from)?;
        let held = fl.l_type as libc::c_int;
        if held == libc::F_UNLCK as libc::c_int {
            Ok(None)
        } else if held == libc::F_WRLCK as libc::c_int {
            Ok(Some(LockKind::Write))
        } else {
            Ok(Some(LockKind::Read))
        }
    }
}

// ============================================================================
// Bounded retry
// ============================================================================

/// Delays between retries, in milliseconds; the last entry repeats
const BACKOFF_MS: [u64; 12] = [1, 2, 5, 10, 15, 20, 25, 25, 25, 50, 50, 100];

/// Delay before retry number `attempt` (zero-based)
pub(crate) fn backoff_delay(attempt: usize) -> Duration {
    Duration::from_millis(BACKOFF_MS[attempt.min(BACKOFF_MS.len() - 1)])
}

/// Retries contended [`RangeLock::try_lock`] calls with backoff
///
/// Only contention (`Ok(false)`) is retried. Errors and the other trait
/// methods pass straight through.
#[derive(Debug)]
pub struct RetryingRangeLock {
    inner: Arc<dyn RangeLock>,
    timeout: Duration,
}

impl RetryingRangeLock {
    /// Wrap `inner`, retrying for up to `timeout` in total
    pub fn new(inner: Arc<dyn RangeLock>, timeout: Duration) -> Self {
        RetryingRangeLock { inner, timeout }
    }

    /// Total retry budget
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl RangeLock for RetryingRangeLock {
    fn try_lock(&self, file: &File, range: ByteRange, kind: LockKind) -> io::Result<bool> {
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            if self.inner.try_lock(file, range, kind)? {
                return Ok(true);
            }
            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                trace!(target: "strata::lock", %range, attempts = attempt + 1, "retry budget exhausted");
                return Ok(false);
            }
            let delay = backoff_delay(attempt).min(self.timeout - elapsed);
            std::thread::sleep(delay);
            attempt += 1;
        }
    }

    fn unlock(&self, file: &File, range: ByteRange) -> io::Result<()> {
        self.inner.unlock(file, range)
    }

    fn probe(&self, file: &File, range: ByteRange, kind: LockKind) -> io::Result<Option<LockKind>> {
        self.inner.probe(file, range, kind)
    }

    fn release_descriptor(&self, file: File) -> io::Result<()> {
        self.inner.release_descriptor(file)
    }
}

//! Lock back-ends
//!
//! Every database handle locks through one [`FileLock`]. Which one is decided
//! once at open time by [`select_style`](crate::selector::select_style):
//!
//! | Style | Type | Behaviour |
//! |---|---|---|
//! | `posix` | [`PosixLock`](crate::posix::PosixLock) | full five-level byte-range protocol |
//! | `flock` | [`FlockLock`] | one whole-file exclusive lock for any level ≥ Shared |
//! | `none` | [`NoLock`] | tracks the level, never touches the OS |
//!
//! `flock` serializes all access, readers included. It exists for
//! filesystems where byte-range locks are missing or unreliable.

use std::fmt;
use std::fs::File;
use std::io;
use std::sync::Arc;

use strata_core::{Error, IoOp, LockLevel, LockStyle, Result};
use tracing::{debug, warn};

use crate::registry::InodeRecord;

/// Lock operations shared by every back-end
pub trait FileLock: Send + Sync + fmt::Debug {
    /// Which back-end this is
    fn style(&self) -> LockStyle;

    /// Level this handle holds
    fn level(&self) -> LockLevel;

    /// Raise the handle to at least `target`
    ///
    /// Returns `Err(Error::Busy)` on contention, leaving the level where it
    /// was (or at `Pending` after a failed `Exclusive`).
    fn set_lock(&mut self, target: LockLevel) -> Result<()>;

    /// Lower the handle to `target`, which must be `Shared` or `Unlocked`
    fn lower_lock(&mut self, target: LockLevel) -> Result<()>;

    /// Whether any connection, in this process or another, holds a
    /// reserved or stronger lock
    fn check_reserved(&self) -> Result<bool>;

    /// Release every lock and give up the descriptor. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// Underlying descriptor, until closed
    fn file(&self) -> Option<&File>;

    /// Shared per-identity record, for back-ends that keep one
    fn inode(&self) -> Option<&Arc<InodeRecord>> {
        None
    }

    /// Whether the handle runs in exclusive-process mode
    fn process_exclusive(&self) -> bool {
        false
    }
}

// =============================================================================
// Request checks
// =============================================================================

pub(crate) fn misuse(msg: String) -> Error {
    if cfg!(debug_assertions) {
        panic!("lock protocol violation: {}", msg);
    }
    Error::Misuse(msg)
}

/// Validate a raise from `current` to `target`; call only when
/// `target > current`
pub(crate) fn check_raise(current: LockLevel, target: LockLevel) -> Result<()> {
    if !target.is_requestable() {
        return Err(misuse(format!("{} cannot be requested directly", target)));
    }
    if current == LockLevel::Unlocked && target != LockLevel::Shared {
        return Err(misuse(format!("{} requested without holding SHARED", target)));
    }
    if target == LockLevel::Reserved && current != LockLevel::Shared {
        return Err(misuse(format!("RESERVED requested from {}", current)));
    }
    Ok(())
}

pub(crate) fn check_lower(target: LockLevel) -> Result<()> {
    if target.is_lowerable_target() {
        Ok(())
    } else {
        Err(misuse(format!("cannot lower to {}", target)))
    }
}

fn closed() -> Error {
    Error::Misuse("lock handle used after close".into())
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

// =============================================================================
// flock
// =============================================================================

/// Whole-file exclusive locking
///
/// Readers exclude each other too, so there is no Reserved/Pending nuance:
/// any level at or above Shared holds the single lock.
#[derive(Debug)]
pub struct FlockLock {
    file: Option<File>,
    level: LockLevel,
}

impl FlockLock {
    /// Wrap an open descriptor
    pub fn new(file: File) -> Self {
        FlockLock {
            file: Some(file),
            level: LockLevel::Unlocked,
        }
    }

    fn handle(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(closed)
    }
}

impl FileLock for FlockLock {
    fn style(&self) -> LockStyle {
        LockStyle::Flock
    }

    fn level(&self) -> LockLevel {
        self.level
    }

    fn set_lock(&mut self, target: LockLevel) -> Result<()> {
        if self.level >= target {
            return Ok(());
        }
        check_raise(self.level, target)?;
        if self.level == LockLevel::Unlocked {
            let file = self.handle()?;
            match fs2::FileExt::try_lock_exclusive(file) {
                Ok(()) => {}
                Err(e) if is_contended(&e) => return Err(Error::Busy),
                Err(e) => return Err(Error::io(IoOp::Lock, e)),
            }
        }
        debug!(target: "strata::lock", style = "flock", from = %self.level, to = %target, "lock raised");
        self.level = target;
        Ok(())
    }

    fn lower_lock(&mut self, target: LockLevel) -> Result<()> {
        check_lower(target)?;
        if self.level <= target {
            return Ok(());
        }
        if target == LockLevel::Unlocked {
            let file = self.handle()?;
            fs2::FileExt::unlock(file).map_err(|source| Error::UnlockFailed { source })?;
        }
        debug!(target: "strata::lock", style = "flock", from = %self.level, to = %target, "lock lowered");
        self.level = target;
        Ok(())
    }

    fn check_reserved(&self) -> Result<bool> {
        if self.level > LockLevel::Shared {
            return Ok(true);
        }
        // Holding the lock at Shared already excludes everyone else.
        if self.level == LockLevel::Shared {
            return Ok(false);
        }
        let file = self.handle()?;
        match fs2::FileExt::try_lock_exclusive(file) {
            Ok(()) => {
                fs2::FileExt::unlock(file).map_err(|e| Error::io(IoOp::CheckReservedLock, e))?;
                Ok(false)
            }
            Err(e) if is_contended(&e) => Ok(true),
            Err(e) => Err(Error::io(IoOp::CheckReservedLock, e)),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let result = self.lower_lock(LockLevel::Unlocked);
        if let Err(e) = &result {
            warn!(target: "strata::lock", style = "flock", error = %e, "unlock during close failed");
        }
        self.file = None;
        self.level = LockLevel::Unlocked;
        result
    }

    fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }
}

// =============================================================================
// No locking
// =============================================================================

/// Level bookkeeping only; the caller guarantees exclusion
#[derive(Debug)]
pub struct NoLock {
    file: Option<File>,
    level: LockLevel,
}

impl NoLock {
    /// Wrap an open descriptor
    pub fn new(file: File) -> Self {
        NoLock {
            file: Some(file),
            level: LockLevel::Unlocked,
        }
    }
}

impl FileLock for NoLock {
    fn style(&self) -> LockStyle {
        LockStyle::NoLock
    }

    fn level(&self) -> LockLevel {
        self.level
    }

    fn set_lock(&mut self, target: LockLevel) -> Result<()> {
        if self.level >= target {
            return Ok(());
        }
        if self.file.is_none() {
            return Err(closed());
        }
        check_raise(self.level, target)?;
        self.level = target;
        Ok(())
    }

    fn lower_lock(&mut self, target: LockLevel) -> Result<()> {
        check_lower(target)?;
        if self.level > target {
            self.level = target;
        }
        Ok(())
    }

    fn check_reserved(&self) -> Result<bool> {
        Ok(false)
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        self.level = LockLevel::Unlocked;
        Ok(())
    }

    fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }
}

//! Connection lock state machine over POSIX byte-range locks
//!
//! Each handle holds one of five levels. The OS only sees the process's
//! strongest lock on each byte, so the handles of one process coordinate
//! through the shared [`InodeRecord`] and only the transitions that change
//! the process-wide picture reach `fcntl`.
//!
//! ## Escalation
//!
//! ```text
//! Shared     read  PENDING (transient), read SHARED range, drop PENDING
//! Reserved   write RESERVED
//! Exclusive  write PENDING (unless already Pending), write SHARED range
//! ```
//!
//! The transient pending read lock keeps a new reader from slipping in
//! while a writer holds PENDING and waits for readers to drain.
//!
//! A failed `Exclusive` leaves the handle at `Pending`, which blocks new
//! readers so a retry can eventually win.
//!
//! ## De-escalation
//!
//! Lowering to Shared swaps the write lock on the shared range for a read
//! lock, then drops PENDING and RESERVED together. Lowering to Unlocked
//! drops everything once no other handle in the process is at Shared.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_core::{Error, FileIdentity, IoOp, LockLevel, LockStyle, Result, SHARED_FIRST, SHARED_SIZE};
use tracing::{debug, trace, warn};

use crate::backend::{check_lower, check_raise, FileLock};
use crate::range_lock::{ByteRange, LockKind};
use crate::registry::{InodeRecord, InodeState, OpenMode, Registry, UnusedDescriptor};

/// Per-handle options for [`PosixLock::attach`]
#[derive(Debug, Clone, Copy)]
pub struct PosixOptions {
    /// Mode the descriptor was opened with
    pub mode: OpenMode,
    /// Take one write lock for the whole process instead of the protocol
    /// (ignored for read-only handles)
    pub process_exclusive: bool,
    /// Downgrade to Shared in two steps for filesystems that need it
    pub split_downgrade: bool,
}

impl Default for PosixOptions {
    fn default() -> Self {
        PosixOptions {
            mode: OpenMode::ReadWrite,
            process_exclusive: false,
            split_downgrade: false,
        }
    }
}

/// Five-level byte-range lock on one database handle
pub struct PosixLock {
    path: PathBuf,
    file: Option<File>,
    level: LockLevel,
    registry: Arc<Registry>,
    inode: Arc<InodeRecord>,
    slot: Option<Box<UnusedDescriptor>>,
    process_exclusive: bool,
    split_downgrade: bool,
}

impl PosixLock {
    /// Attach `file` to the record for its identity
    ///
    /// `slot` is a parked slot being reused; a fresh one is allocated
    /// otherwise so that closing never has to allocate.
    pub fn attach(
        registry: Arc<Registry>,
        path: &Path,
        file: File,
        slot: Option<Box<UnusedDescriptor>>,
        opts: PosixOptions,
    ) -> Result<Self> {
        let identity = FileIdentity::of_file(&file, path).map_err(|e| Error::io(IoOp::Fstat, e))?;
        let inode = registry.acquire(identity);
        let slot = match slot {
            Some(mut slot) => {
                slot.file = None;
                slot.mode = opts.mode;
                slot
            }
            None => Box::new(UnusedDescriptor::new(opts.mode)),
        };
        Ok(PosixLock {
            path: path.to_path_buf(),
            file: Some(file),
            level: LockLevel::Unlocked,
            registry,
            inode,
            slot: Some(slot),
            process_exclusive: opts.process_exclusive && opts.mode == OpenMode::ReadWrite,
            split_downgrade: opts.split_downgrade,
        })
    }

    /// Record shared with every handle on the same file
    pub fn record(&self) -> &Arc<InodeRecord> {
        &self.inode
    }

    /// Registry the handle is attached to
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // -------------------------------------------------------------------------
    // OS calls
    // -------------------------------------------------------------------------

    fn closed_io() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "descriptor already closed")
    }

    fn os_lock(&self, st: &mut InodeState, range: ByteRange, kind: LockKind) -> io::Result<bool> {
        let file = self.file.as_ref().ok_or_else(Self::closed_io)?;
        if self.process_exclusive {
            if !st.process_lock {
                if !self.registry.locker().try_lock(file, ByteRange::SHARED, LockKind::Write)? {
                    return Ok(false);
                }
                st.process_lock = true;
                st.n_lock += 1;
                debug!(target: "strata::lock", path = %self.path.display(), "process-exclusive lock taken");
            }
            return Ok(true);
        }
        self.registry.locker().try_lock(file, range, kind)
    }

    fn os_unlock(&self, range: ByteRange) -> io::Result<()> {
        let file = self.file.as_ref().ok_or_else(Self::closed_io)?;
        // The process lock is held until the last descriptor closes.
        if self.process_exclusive {
            return Ok(());
        }
        self.registry.locker().unlock(file, range)
    }

    fn os_relock_read(&self, st: &mut InodeState, range: ByteRange) -> Result<()> {
        match self.os_lock(st, range, LockKind::Read) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::io(
                IoOp::RdLock,
                io::Error::new(io::ErrorKind::WouldBlock, "read lock refused during downgrade"),
            )),
            Err(e) => Err(Error::io(IoOp::RdLock, e)),
        }
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn acquire_shared(&self, st: &mut InodeState) -> Result<()> {
        debug_assert_eq!(st.n_shared, 0);
        debug_assert_eq!(st.level, LockLevel::Unlocked);
        let shared = self.os_lock(st, ByteRange::SHARED, LockKind::Read);
        let released = self.os_unlock(ByteRange::PENDING);
        match (shared, released) {
            (Ok(true), Ok(())) => {
                st.n_lock += 1;
                st.n_shared = 1;
                Ok(())
            }
            (Ok(false), Ok(())) => Err(Error::Busy),
            (Err(e), _) => Err(Error::io(IoOp::Lock, e)),
            (Ok(granted), Err(e)) => {
                warn!(target: "strata::lock", path = %self.path.display(), error = %e, "pending byte release failed");
                if granted {
                    if let Err(undo) = self.os_unlock(ByteRange::SHARED) {
                        warn!(target: "strata::lock", path = %self.path.display(), error = %undo, "shared range release failed");
                    }
                }
                Err(Error::io(IoOp::Unlock, e))
            }
        }
    }

    fn downgrade_to_shared(&self, st: &mut InodeState) -> Result<()> {
        if !self.split_downgrade {
            return self.os_relock_read(st, ByteRange::SHARED);
        }
        // Never leave the whole shared range uncovered.
        let div = SHARED_SIZE - 1;
        let lower = ByteRange::new(SHARED_FIRST, div);
        let upper = ByteRange::new(SHARED_FIRST + div, SHARED_SIZE - div);
        self.os_unlock(lower)
            .map_err(|source| Error::UnlockFailed { source })?;
        self.os_relock_read(st, lower)?;
        self.os_unlock(upper)
            .map_err(|source| Error::UnlockFailed { source })
    }
}

impl FileLock for PosixLock {
    fn style(&self) -> LockStyle {
        LockStyle::Posix
    }

    fn level(&self) -> LockLevel {
        self.level
    }

    fn set_lock(&mut self, target: LockLevel) -> Result<()> {
        if self.level >= target {
            return Ok(());
        }
        if self.file.is_none() {
            return Err(Error::Misuse("lock handle used after close".into()));
        }
        check_raise(self.level, target)?;

        let inode = Arc::clone(&self.inode);
        let mut st = inode.state.lock();

        // Another handle in this process is mid-transition or holds a
        // conflicting level.
        if self.level != st.level && (st.level >= LockLevel::Pending || target > LockLevel::Shared) {
            trace!(target: "strata::lock", path = %self.path.display(), want = %target, inode = %st.level, "busy in process");
            return Err(Error::Busy);
        }

        if target == LockLevel::Shared && matches!(st.level, LockLevel::Shared | LockLevel::Reserved) {
            debug_assert_eq!(self.level, LockLevel::Unlocked);
            debug_assert!(st.n_shared > 0);
            self.level = LockLevel::Shared;
            st.n_shared += 1;
            st.n_lock += 1;
            debug!(target: "strata::lock", path = %self.path.display(), to = %target, n_shared = st.n_shared, "lock raised (shared in process)");
            return Ok(());
        }

        if target == LockLevel::Shared || (target == LockLevel::Exclusive && self.level < LockLevel::Pending) {
            let kind = if target == LockLevel::Shared {
                LockKind::Read
            } else {
                LockKind::Write
            };
            let granted = self
                .os_lock(&mut st, ByteRange::PENDING, kind)
                .map_err(|e| Error::io(IoOp::Lock, e))?;
            if !granted {
                return Err(Error::Busy);
            }
        }

        let outcome = if target == LockLevel::Shared {
            self.acquire_shared(&mut st)
        } else if target == LockLevel::Exclusive && st.n_shared > 1 {
            // Other handles in this process still read.
            Err(Error::Busy)
        } else {
            debug_assert_ne!(self.level, LockLevel::Unlocked);
            let range = if target == LockLevel::Reserved {
                ByteRange::RESERVED
            } else {
                ByteRange::SHARED
            };
            match self.os_lock(&mut st, range, LockKind::Write) {
                Ok(true) => Ok(()),
                Ok(false) => Err(Error::Busy),
                Err(e) => Err(Error::io(IoOp::Lock, e)),
            }
        };

        match outcome {
            Ok(()) => {
                debug!(target: "strata::lock", path = %self.path.display(), from = %self.level, to = %target, "lock raised");
                self.level = target;
                st.level = target;
                Ok(())
            }
            Err(e) => {
                if target == LockLevel::Exclusive {
                    self.level = LockLevel::Pending;
                    st.level = LockLevel::Pending;
                    trace!(target: "strata::lock", path = %self.path.display(), "left at PENDING");
                }
                Err(e)
            }
        }
    }

    fn lower_lock(&mut self, target: LockLevel) -> Result<()> {
        check_lower(target)?;
        if self.level <= target {
            return Ok(());
        }
        if self.file.is_none() {
            return Err(Error::Misuse("lock handle used after close".into()));
        }

        let inode = Arc::clone(&self.inode);
        let mut st = inode.state.lock();
        debug_assert!(st.n_shared > 0);

        if self.level > LockLevel::Shared {
            debug_assert_eq!(st.level, self.level);
            if target == LockLevel::Shared {
                if let Err(e) = self.downgrade_to_shared(&mut st) {
                    warn!(target: "strata::lock", path = %self.path.display(), error = %e, "downgrade to SHARED failed");
                    return Err(e);
                }
            }
            if let Err(source) = self.os_unlock(ByteRange::PENDING_AND_RESERVED) {
                warn!(target: "strata::lock", path = %self.path.display(), error = %source, "pending/reserved release failed");
                return Err(Error::UnlockFailed { source });
            }
            st.level = LockLevel::Shared;
        }

        let mut result = Ok(());
        if target == LockLevel::Unlocked {
            st.n_shared = st.n_shared.saturating_sub(1);
            if st.n_shared == 0 {
                if let Err(source) = self.os_unlock(ByteRange::WHOLE_FILE) {
                    warn!(target: "strata::lock", path = %self.path.display(), error = %source, "whole-file release failed");
                    result = Err(Error::UnlockFailed { source });
                }
                st.level = LockLevel::Unlocked;
            }
            st.n_lock = st.n_lock.saturating_sub(1);
            if st.n_lock == 0 {
                self.registry.close_parked(&mut st);
            }
        }

        debug!(target: "strata::lock", path = %self.path.display(), from = %self.level, to = %target, "lock lowered");
        self.level = target;
        result
    }

    fn check_reserved(&self) -> Result<bool> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| Error::Misuse("lock handle used after close".into()))?;
        let st = self.inode.state.lock();
        if st.level > LockLevel::Shared {
            return Ok(true);
        }
        if st.process_lock {
            return Ok(false);
        }
        let held = self
            .registry
            .locker()
            .probe(file, ByteRange::RESERVED, LockKind::Write)
            .map_err(|e| Error::io(IoOp::CheckReservedLock, e))?;
        Ok(held.is_some())
    }

    fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let unlocked = self.lower_lock(LockLevel::Unlocked);
        if let Err(e) = &unlocked {
            warn!(target: "strata::lock", path = %self.path.display(), error = %e, "unlock during close failed");
        }
        if let Some(file) = self.file.take() {
            let slot = self
                .slot
                .take()
                .unwrap_or_else(|| Box::new(UnusedDescriptor::new(OpenMode::ReadWrite)));
            self.registry.close_handle(&self.inode, file, slot);
        }
        self.level = LockLevel::Unlocked;
        unlocked
    }

    fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    fn inode(&self) -> Option<&Arc<InodeRecord>> {
        Some(&self.inode)
    }

    fn process_exclusive(&self) -> bool {
        self.process_exclusive
    }
}

impl Drop for PosixLock {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(target: "strata::lock", path = %self.path.display(), error = %e, "close on drop failed");
        }
    }
}

impl fmt::Debug for PosixLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PosixLock")
            .field("path", &self.path)
            .field("level", &self.level)
            .field("open", &self.file.is_some())
            .field("process_exclusive", &self.process_exclusive)
            .finish()
    }
}

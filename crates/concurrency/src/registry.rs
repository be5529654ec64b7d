//! File identity registry and deferred-close manager
//!
//! POSIX locks belong to the process, so every handle this process has open
//! on the same file must agree on one effective lock state. The registry maps
//! each [`FileIdentity`] to a single shared [`InodeRecord`] that carries that
//! state.
//!
//! Closing any descriptor on a file drops all of the process's locks on it.
//! A handle closed while a sibling still holds a lock therefore cannot close
//! its descriptor; it is parked on the record and closed once the last lock
//! on the file is released, or once the record itself goes away.
//!
//! ## Mutex order
//!
//! ```text
//! registry table  ->  one inode record  ->  its shared-index node
//! ```
//!
//! Never hold two inode record mutexes at once.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use strata_core::{FileIdentity, LockConfig, LockLevel, Result};
use tracing::{debug, warn};

use crate::range_lock::{PosixRangeLock, RangeLock, RetryingRangeLock};
use crate::shm::ShmNode;

// =============================================================================
// Global Registry
// =============================================================================

/// Process-wide default registry using real fcntl locks
static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::new(Arc::new(PosixRangeLock))));

// =============================================================================
// Records
// =============================================================================

/// Access mode a descriptor was opened with
///
/// A parked descriptor is only reused by an open asking for the same mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// Opened read-only
    ReadOnly,
    /// Opened read-write
    ReadWrite,
}

/// A parked descriptor slot
///
/// Allocated when a handle opens, so parking it at close time never needs to
/// allocate.
#[derive(Debug)]
pub struct UnusedDescriptor {
    pub(crate) file: Option<File>,
    pub(crate) mode: OpenMode,
}

impl UnusedDescriptor {
    /// Empty slot for a descriptor opened with `mode`
    pub fn new(mode: OpenMode) -> Self {
        UnusedDescriptor { file: None, mode }
    }
}

/// Mutable state of an inode record
#[derive(Debug, Default)]
pub struct InodeState {
    /// Handles attached to the record
    pub(crate) n_ref: u32,
    /// Handles at Shared or above
    pub(crate) n_shared: u32,
    /// Outstanding lock holders; parked descriptors wait for zero
    pub(crate) n_lock: u32,
    /// Strongest level any attached handle holds
    pub(crate) level: LockLevel,
    /// Exclusive-process mode already holds its single OS lock
    pub(crate) process_lock: bool,
    /// Descriptors waiting to be closed
    pub(crate) unused: Vec<Box<UnusedDescriptor>>,
    /// Shared-index node, once some handle maps the index
    pub(crate) shm: Option<Arc<ShmNode>>,
}

/// Point-in-time copy of the counters in an [`InodeRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeSnapshot {
    /// Attached handles
    pub n_ref: u32,
    /// Handles at Shared or above
    pub n_shared: u32,
    /// Outstanding lock holders
    pub n_lock: u32,
    /// Effective level
    pub level: LockLevel,
    /// Parked descriptors
    pub parked: usize,
    /// Whether exclusive-process mode holds its lock
    pub process_lock: bool,
}

/// Per-identity shared lock state
pub struct InodeRecord {
    identity: FileIdentity,
    pub(crate) state: Mutex<InodeState>,
}

impl InodeRecord {
    fn new(identity: FileIdentity) -> Self {
        InodeRecord {
            identity,
            state: Mutex::new(InodeState::default()),
        }
    }

    /// Identity this record tracks
    pub fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> InodeSnapshot {
        let st = self.state.lock();
        InodeSnapshot {
            n_ref: st.n_ref,
            n_shared: st.n_shared,
            n_lock: st.n_lock,
            level: st.level,
            parked: st.unused.len(),
            process_lock: st.process_lock,
        }
    }
}

impl fmt::Debug for InodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeRecord")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Identity → record table for one lock domain
///
/// Most callers use [`Registry::global`]. Tests build private registries over
/// simulated range locks to model several processes.
pub struct Registry {
    locker: Arc<dyn RangeLock>,
    inodes: Mutex<HashMap<FileIdentity, Arc<InodeRecord>>>,
    closed_descriptors: AtomicU64,
}

impl Registry {
    /// Create a registry issuing OS calls through `locker`
    pub fn new(locker: Arc<dyn RangeLock>) -> Self {
        Registry {
            locker,
            inodes: Mutex::new(HashMap::new()),
            closed_descriptors: AtomicU64::new(0),
        }
    }

    /// Create a registry, wrapping `locker` in a retry loop when the
    /// configuration sets a busy timeout
    pub fn with_config(locker: Arc<dyn RangeLock>, config: &LockConfig) -> Result<Self> {
        config.validate()?;
        let locker: Arc<dyn RangeLock> = match config.busy_timeout() {
            Some(timeout) => Arc::new(RetryingRangeLock::new(locker, timeout)),
            None => locker,
        };
        Ok(Self::new(locker))
    }

    /// The process-wide registry
    pub fn global() -> Arc<Registry> {
        Arc::clone(&GLOBAL)
    }

    /// Range-lock primitive this registry uses
    pub fn locker(&self) -> &dyn RangeLock {
        self.locker.as_ref()
    }

    pub(crate) fn table(&self) -> MutexGuard<'_, HashMap<FileIdentity, Arc<InodeRecord>>> {
        self.inodes.lock()
    }

    /// Find or create the record for `identity` and attach to it
    pub fn acquire(&self, identity: FileIdentity) -> Arc<InodeRecord> {
        let mut table = self.inodes.lock();
        let record = table
            .entry(identity)
            .or_insert_with_key(|id| {
                debug!(target: "strata::registry", identity = %id, "inode record created");
                Arc::new(InodeRecord::new(id.clone()))
            })
            .clone();
        record.state.lock().n_ref += 1;
        record
    }

    /// Detach from `record`; at zero references its parked descriptors are
    /// closed and the record is removed
    pub fn release(&self, record: &Arc<InodeRecord>) {
        let mut table = self.inodes.lock();
        self.release_locked(&mut table, record);
    }

    fn release_locked(
        &self,
        table: &mut HashMap<FileIdentity, Arc<InodeRecord>>,
        record: &Arc<InodeRecord>,
    ) {
        let mut st = record.state.lock();
        debug_assert!(st.n_ref > 0, "inode record released too often");
        st.n_ref = st.n_ref.saturating_sub(1);
        if st.n_ref > 0 {
            return;
        }
        debug_assert!(st.shm.is_none(), "inode record dropped with shm attached");
        self.close_parked(&mut st);
        drop(st);
        if table
            .get(record.identity())
            .is_some_and(|r| Arc::ptr_eq(r, record))
        {
            table.remove(record.identity());
            debug!(target: "strata::registry", identity = %record.identity(), "inode record removed");
        }
    }

    /// Give up a handle's descriptor and detach from its record
    ///
    /// The descriptor is parked in `slot` while any handle on the file still
    /// holds a lock, and closed otherwise.
    pub(crate) fn close_handle(
        &self,
        record: &Arc<InodeRecord>,
        file: File,
        mut slot: Box<UnusedDescriptor>,
    ) {
        let mut table = self.inodes.lock();
        let to_close = {
            let mut st = record.state.lock();
            if st.n_lock > 0 {
                slot.file = Some(file);
                st.unused.push(slot);
                debug!(target: "strata::registry", identity = %record.identity(), parked = st.unused.len(), "descriptor close deferred");
                None
            } else {
                Some(file)
            }
        };
        if let Some(file) = to_close {
            self.close_descriptor(file);
        }
        self.release_locked(&mut table, record);
    }

    /// Close every parked descriptor on a record
    ///
    /// Called with the record's mutex held, once nothing in the process
    /// holds a lock on the file any more.
    pub(crate) fn close_parked(&self, st: &mut InodeState) {
        for mut slot in st.unused.drain(..) {
            if let Some(file) = slot.file.take() {
                self.close_descriptor(file);
            }
        }
    }

    fn close_descriptor(&self, file: File) {
        if let Err(e) = self.locker.release_descriptor(file) {
            warn!(target: "strata::registry", error = %e, "close failed");
        }
        self.closed_descriptors.fetch_add(1, Ordering::SeqCst);
    }

    /// Take a parked descriptor for `identity` opened with `mode`, if any
    pub fn take_reusable(&self, identity: &FileIdentity, mode: OpenMode) -> Option<Box<UnusedDescriptor>> {
        let table = self.inodes.lock();
        let record = table.get(identity)?;
        let mut st = record.state.lock();
        let pos = st
            .unused
            .iter()
            .position(|slot| slot.mode == mode && slot.file.is_some())?;
        let slot = st.unused.swap_remove(pos);
        debug!(target: "strata::registry", identity = %identity, "reusing parked descriptor");
        Some(slot)
    }

    /// Record for `identity`, if some handle is attached
    pub fn record(&self, identity: &FileIdentity) -> Option<Arc<InodeRecord>> {
        self.inodes.lock().get(identity).cloned()
    }

    /// Number of live records
    pub fn open_records(&self) -> usize {
        self.inodes.lock().len()
    }

    /// Descriptors this registry has physically closed
    pub fn closed_descriptors(&self) -> u64 {
        self.closed_descriptors.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("locker", &self.locker)
            .field("records", &self.open_records())
            .finish()
    }
}

//! In-memory model of OS advisory locks
//!
//! Real POSIX locks never conflict within one process, which makes
//! cross-process behaviour impossible to exercise from a single test binary.
//! [`SimulatedHost`] keeps a lock table shared by any number of simulated
//! processes; each [`SimulatedRangeLock`] handed out by
//! [`SimulatedHost::process`] acts as one process.
//!
//! The model follows fcntl semantics closely enough for the lock protocol:
//! - locks are owned per process and keyed by file identity
//! - a process re-locking bytes it already holds replaces the old mode
//! - `len == 0` unlocks to end of file
//! - [`RangeLock::release_descriptor`] drops every lock the process holds on
//!   that file
//!
//! Each simulated process also counts its calls so tests can assert how many
//! OS operations a sequence issued.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_core::FileIdentity;

use crate::range_lock::{ByteRange, LockKind, RangeLock};

/// Simulated process id
pub type SimPid = u32;

type ByteTable = BTreeMap<u64, HashMap<SimPid, LockKind>>;

#[derive(Debug, Default)]
struct HostState {
    files: HashMap<FileIdentity, ByteTable>,
    next_pid: SimPid,
}

/// Shared lock table for a set of simulated processes
#[derive(Debug, Clone, Default)]
pub struct SimulatedHost {
    state: Arc<Mutex<HostState>>,
}

impl SimulatedHost {
    /// Create an empty host
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new simulated process
    pub fn process(&self) -> SimulatedRangeLock {
        let pid = {
            let mut state = self.state.lock();
            state.next_pid += 1;
            state.next_pid
        };
        SimulatedRangeLock {
            host: self.clone(),
            pid,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Every (process, kind) holding `byte` of the file behind `file`
    pub fn holders(&self, file: &File, byte: u64) -> Vec<(SimPid, LockKind)> {
        let Ok(identity) = identity_of(file) else {
            return Vec::new();
        };
        let state = self.state.lock();
        let mut out: Vec<(SimPid, LockKind)> = state
            .files
            .get(&identity)
            .and_then(|bytes| bytes.get(&byte))
            .map(|owners| owners.iter().map(|(p, k)| (*p, *k)).collect())
            .unwrap_or_default();
        out.sort_by_key(|(pid, _)| *pid);
        out
    }

    /// Number of locked bytes `pid` holds on the file behind `file`
    pub fn bytes_held(&self, file: &File, pid: SimPid) -> usize {
        let Ok(identity) = identity_of(file) else {
            return 0;
        };
        let state = self.state.lock();
        state.files.get(&identity).map_or(0, |bytes| {
            bytes.values().filter(|o| o.contains_key(&pid)).count()
        })
    }
}

/// Call counts of one simulated process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    /// `try_lock` calls
    pub lock_calls: u64,
    /// `unlock` calls
    pub unlock_calls: u64,
    /// `probe` calls
    pub probe_calls: u64,
    /// `release_descriptor` calls
    pub released_descriptors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    lock_calls: AtomicU64,
    unlock_calls: AtomicU64,
    probe_calls: AtomicU64,
    released: AtomicU64,
    fail_unlocks: AtomicBool,
}

/// One simulated process's view of the host lock table
///
/// Clones share the process id and counters.
#[derive(Debug, Clone)]
pub struct SimulatedRangeLock {
    host: SimulatedHost,
    pid: SimPid,
    counters: Arc<Counters>,
}

fn identity_of(file: &File) -> io::Result<FileIdentity> {
    FileIdentity::of_file(file, Path::new(""))
}

fn unsupported_whole_file() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "simulated locks cover explicit ranges only",
    )
}

impl SimulatedRangeLock {
    /// This process's id
    pub fn pid(&self) -> SimPid {
        self.pid
    }

    /// Snapshot of the call counters
    pub fn stats(&self) -> LockStats {
        LockStats {
            lock_calls: self.counters.lock_calls.load(Ordering::SeqCst),
            unlock_calls: self.counters.unlock_calls.load(Ordering::SeqCst),
            probe_calls: self.counters.probe_calls.load(Ordering::SeqCst),
            released_descriptors: self.counters.released.load(Ordering::SeqCst),
        }
    }

    /// Make every subsequent `unlock` fail with an I/O error
    pub fn set_unlock_failure(&self, fail: bool) {
        self.counters.fail_unlocks.store(fail, Ordering::SeqCst);
    }

    /// The host this process runs on
    pub fn host(&self) -> &SimulatedHost {
        &self.host
    }

    fn drop_all(&self, identity: &FileIdentity) {
        let mut state = self.host.state.lock();
        if let Some(bytes) = state.files.get_mut(identity) {
            bytes.retain(|_, owners| {
                owners.remove(&self.pid);
                !owners.is_empty()
            });
        }
    }
}

impl RangeLock for SimulatedRangeLock {
    fn try_lock(&self, file: &File, range: ByteRange, kind: LockKind) -> io::Result<bool> {
        self.counters.lock_calls.fetch_add(1, Ordering::SeqCst);
        let end = range.end().ok_or_else(unsupported_whole_file)?;
        let identity = identity_of(file)?;
        let mut state = self.host.state.lock();
        let bytes = state.files.entry(identity).or_default();

        let blocked = bytes.range(range.start..end).any(|(_, owners)| {
            owners
                .iter()
                .any(|(pid, held)| *pid != self.pid && held.conflicts_with(kind))
        });
        if blocked {
            return Ok(false);
        }
        for byte in range.start..end {
            bytes.entry(byte).or_default().insert(self.pid, kind);
        }
        Ok(true)
    }

    fn unlock(&self, file: &File, range: ByteRange) -> io::Result<()> {
        self.counters.unlock_calls.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_unlocks.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected unlock failure"));
        }
        let identity = identity_of(file)?;
        let mut state = self.host.state.lock();
        if let Some(bytes) = state.files.get_mut(&identity) {
            bytes.retain(|byte, owners| {
                if range.contains(*byte) {
                    owners.remove(&self.pid);
                }
                !owners.is_empty()
            });
        }
        Ok(())
    }

    fn probe(&self, file: &File, range: ByteRange, kind: LockKind) -> io::Result<Option<LockKind>> {
        self.counters.probe_calls.fetch_add(1, Ordering::SeqCst);
        let identity = identity_of(file)?;
        let state = self.host.state.lock();
        let Some(bytes) = state.files.get(&identity) else {
            return Ok(None);
        };
        let found = bytes
            .iter()
            .filter(|(byte, _)| range.contains(**byte))
            .flat_map(|(_, owners)| owners.iter())
            .find(|(pid, held)| **pid != self.pid && held.conflicts_with(kind))
            .map(|(_, held)| *held);
        Ok(found)
    }

    fn release_descriptor(&self, file: File) -> io::Result<()> {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        let identity = identity_of(&file)?;
        self.drop_all(&identity);
        drop(file);
        Ok(())
    }
}

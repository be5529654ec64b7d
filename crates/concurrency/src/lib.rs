//! File locking and shared-index coordination for Strata
//!
//! This crate arbitrates access to a database file and its `-shm` index
//! between threads of one process and between processes, using only OS
//! advisory locks:
//! - RangeLock: the byte-range lock primitive (fcntl, or simulated in tests)
//! - Registry: one shared lock record per file identity, with deferred close
//! - PosixLock: the five-level connection lock state machine
//! - FlockLock / NoLock: fallback back-ends, chosen by the selector
//! - ShmNode / ShmConnection: shared-index regions and slot locks
//! - DbFile: the handle that ties these together
//!
//! Unix only.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod file;
pub mod posix;
pub mod range_lock;
pub mod registry;
pub mod selector;
pub mod shm;
pub mod testing;

pub use backend::{FileLock, FlockLock, NoLock};
pub use file::{DbFile, OpenFlags};
pub use posix::{PosixLock, PosixOptions};
pub use range_lock::{ByteRange, LockKind, PosixRangeLock, RangeLock, RetryingRangeLock};
pub use registry::{InodeRecord, InodeSnapshot, OpenMode, Registry, UnusedDescriptor};
pub use selector::{
    select_style, use_split_downgrade, FixedProbe, FsCapabilities, FsKind, FsProbe, StatfsProbe,
};
pub use shm::{shm_path, ConnMasks, ShmConnection, ShmLockMode, ShmNode, ShmRegion, DEFAULT_REGION_SIZE};

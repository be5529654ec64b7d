//! strata-lock - file locking and shared-index coordination
//!
//! Arbitrates access to a database file and its `-shm` index between the
//! threads of one process and between processes, using OS advisory locks.
//!
//! # Quick Start
//!
//! ```ignore
//! use strata_lock::{LockLevel, OpenFlags};
//!
//! let mut db = strata_lock::open("app.db", OpenFlags::read_write())?;
//! db.set_lock(LockLevel::Shared)?;
//! db.set_lock(LockLevel::Reserved)?;
//! db.set_lock(LockLevel::Exclusive)?;
//! // ... write ...
//! db.lower_lock(LockLevel::Unlocked)?;
//! ```
//!
//! # Architecture
//!
//! - `strata-core`: lock levels, byte layout, file identity, errors, config
//! - `strata-concurrency`: the registry, the lock back-ends, the shared
//!   index, and [`DbFile`] which ties them together

use std::path::Path;

pub use strata_concurrency::*;
pub use strata_core::*;

/// Open `path` against the process-wide registry
///
/// Reads `strata-lock.toml` from the database's directory if present and
/// falls back to defaults otherwise. A nonzero `busy_timeout_ms` makes the
/// handle retry refused byte-range locks for that long before returning
/// [`Error::Busy`].
pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<DbFile> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let config = LockConfig::from_file_or_default(&dir.join(CONFIG_FILE_NAME))?;
    DbFile::open(Registry::global(), path, flags, &config)
}

//! Database file handle
//!
//! [`DbFile`] is what the pager and WAL layers hold. It owns the descriptor
//! through a [`FileLock`] back-end chosen at open time, and lazily attaches
//! to the shared index on the first [`DbFile::shm_map`].
//!
//! ```text
//! open:   reuse parked descriptor or open(2)
//!         probe filesystem -> select style -> attach back-end
//! close:  detach shared index -> back-end close -> unlink if requested
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_core::{Error, FileIdentity, IoOp, LockConfig, LockLevel, LockStyle, Result};
use tracing::{debug, trace, warn};

use crate::backend::{FileLock, FlockLock, NoLock};
use crate::posix::{PosixLock, PosixOptions};
use crate::range_lock::backoff_delay;
use crate::registry::{InodeRecord, OpenMode, Registry};
use crate::selector::{select_style, use_split_downgrade, FsProbe, StatfsProbe};
use crate::shm::node::ShmOpenOptions;
use crate::shm::{ShmConnection, ShmLockMode, ShmNode, ShmRegion};

/// How to open a database file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open without write access
    pub read_only: bool,
    /// Create the file if missing (ignored when read-only)
    pub create: bool,
    /// Unlink the file when the handle closes
    pub delete_on_close: bool,
    /// This process is the only user of the file; take one lock for the
    /// whole process and keep the shared index in memory
    pub exclusive_process: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags {
            read_only: false,
            create: true,
            delete_on_close: false,
            exclusive_process: false,
        }
    }
}

impl OpenFlags {
    /// Read-write, creating the file if needed
    pub fn read_write() -> Self {
        Self::default()
    }

    /// Read-only; the file must exist
    pub fn read_only() -> Self {
        OpenFlags {
            read_only: true,
            create: false,
            ..Self::default()
        }
    }

    /// Set [`OpenFlags::exclusive_process`]
    pub fn with_exclusive_process(mut self, on: bool) -> Self {
        self.exclusive_process = on;
        self
    }

    /// Set [`OpenFlags::delete_on_close`]
    pub fn with_delete_on_close(mut self, on: bool) -> Self {
        self.delete_on_close = on;
        self
    }

    fn mode(&self) -> OpenMode {
        if self.read_only {
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWrite
        }
    }
}

/// An open database file and its locks
pub struct DbFile {
    path: PathBuf,
    flags: OpenFlags,
    registry: Arc<Registry>,
    lock: Box<dyn FileLock>,
    shm: Option<ShmConnection>,
    readonly_shm: bool,
    busy_timeout: Option<Duration>,
    closed: bool,
}

fn open_descriptor(path: &Path, flags: OpenFlags) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    if !flags.read_only {
        opts.write(true).create(flags.create);
    }
    opts.open(path).map_err(|e| Error::io(IoOp::Open, e))
}

impl DbFile {
    /// Open `path`, probing its filesystem to pick a lock back-end
    pub fn open(
        registry: Arc<Registry>,
        path: impl AsRef<Path>,
        flags: OpenFlags,
        config: &LockConfig,
    ) -> Result<Self> {
        Self::open_with_probe(registry, path, flags, config, &StatfsProbe)
    }

    /// Open `path` using `probe` to learn the filesystem's capabilities
    pub fn open_with_probe(
        registry: Arc<Registry>,
        path: impl AsRef<Path>,
        flags: OpenFlags,
        config: &LockConfig,
        probe: &dyn FsProbe,
    ) -> Result<Self> {
        let path = path.as_ref();
        let choice = config.lock_style()?;
        let policy = config.downgrade_policy()?;
        let mode = flags.mode();

        let reusable = match FileIdentity::of_path(path) {
            Ok(Some(identity)) => registry.take_reusable(&identity, mode),
            _ => None,
        };
        let (file, slot) = match reusable {
            Some(mut slot) => match slot.file.take() {
                Some(file) => (file, Some(slot)),
                None => (open_descriptor(path, flags)?, Some(slot)),
            },
            None => (open_descriptor(path, flags)?, None),
        };

        let caps = probe
            .probe(&file, path)
            .map_err(|e| Error::io(IoOp::Fstat, e))?;
        let style = select_style(choice, caps);
        let lock: Box<dyn FileLock> = match style {
            LockStyle::Posix => Box::new(PosixLock::attach(
                Arc::clone(&registry),
                path,
                file,
                slot,
                PosixOptions {
                    mode,
                    process_exclusive: flags.exclusive_process,
                    split_downgrade: use_split_downgrade(policy, caps),
                },
            )?),
            LockStyle::Flock => Box::new(FlockLock::new(file)),
            LockStyle::NoLock => Box::new(NoLock::new(file)),
        };

        debug!(target: "strata::lock", path = %path.display(), style = style.as_str(), read_only = flags.read_only, "database file opened");
        Ok(DbFile {
            path: path.to_path_buf(),
            flags,
            registry,
            lock,
            shm: None,
            readonly_shm: config.readonly_shm,
            busy_timeout: config.busy_timeout(),
            closed: false,
        })
    }

    /// Path the file was opened with
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flags the file was opened with
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Selected back-end
    pub fn style(&self) -> LockStyle {
        self.lock.style()
    }

    /// Registry the handle is attached to
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Descriptor for reads and writes, until closed
    pub fn file(&self) -> Option<&File> {
        self.lock.file()
    }

    /// How long [`DbFile::set_lock`] keeps retrying a Busy refusal
    pub fn busy_timeout(&self) -> Option<Duration> {
        self.busy_timeout
    }

    /// Per-identity record, for the byte-range back-end
    pub fn record(&self) -> Option<&Arc<InodeRecord>> {
        self.lock.inode()
    }

    // -------------------------------------------------------------------------
    // Database file locks
    // -------------------------------------------------------------------------

    /// Current lock level
    pub fn lock_level(&self) -> LockLevel {
        self.lock.level()
    }

    /// Raise the lock to at least `level`
    ///
    /// With a busy timeout set, a Busy refusal is retried with backoff until
    /// the budget runs out. No mutex is held while sleeping. A handle that
    /// gives up keeps the level the last attempt left it at, which is
    /// Pending for a failed Exclusive.
    pub fn set_lock(&mut self, level: LockLevel) -> Result<()> {
        let Some(timeout) = self.busy_timeout else {
            return self.lock.set_lock(level);
        };
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            match self.lock.set_lock(level) {
                Err(e) if e.is_busy() => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        trace!(target: "strata::lock", path = %self.path.display(), %level, attempts = attempt + 1, "busy timeout expired");
                        return Err(e);
                    }
                    std::thread::sleep(backoff_delay(attempt).min(timeout - elapsed));
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Lower the lock to `level` (`Shared` or `Unlocked`)
    pub fn lower_lock(&mut self, level: LockLevel) -> Result<()> {
        self.lock.lower_lock(level)
    }

    /// Whether any connection holds a reserved or stronger lock
    pub fn check_reserved(&self) -> Result<bool> {
        self.lock.check_reserved()
    }

    // -------------------------------------------------------------------------
    // Shared index
    // -------------------------------------------------------------------------

    fn attach_shm(&self) -> Result<ShmConnection> {
        if self.lock.style() != LockStyle::Posix {
            return Err(Error::Unsupported("shared index requires byte-range locking"));
        }
        let (Some(record), Some(file)) = (self.lock.inode(), self.lock.file()) else {
            return Err(Error::Misuse("database file already closed".into()));
        };
        let mode = file
            .metadata()
            .map_err(|e| Error::io(IoOp::Fstat, e))?
            .permissions()
            .mode()
            & 0o777;
        ShmNode::attach(
            &self.registry,
            record,
            &self.path,
            ShmOpenOptions {
                read_only: self.readonly_shm,
                heap: self.lock.process_exclusive(),
                mode,
            },
        )
    }

    fn shm_conn(&self) -> Result<&ShmConnection> {
        self.shm
            .as_ref()
            .ok_or_else(|| Error::Misuse("shared index not mapped".into()))
    }

    /// Map region `index` of the shared index, opening it on first use
    ///
    /// Returns `Ok(None)` if the region does not exist yet and `extend` is
    /// false.
    pub fn shm_map(&mut self, index: u32, region_size: usize, extend: bool) -> Result<Option<ShmRegion>> {
        if self.shm.is_none() {
            self.shm = Some(self.attach_shm()?);
        }
        self.shm_conn()?.map(index, region_size, extend)
    }

    /// Take `n` shared-index slots starting at `offset`
    pub fn shm_lock(&self, offset: u32, n: u32, mode: ShmLockMode) -> Result<()> {
        self.shm_conn()?.lock(self.registry.locker(), offset, n, mode)
    }

    /// Release `n` shared-index slots starting at `offset`
    pub fn shm_unlock(&self, offset: u32, n: u32, mode: ShmLockMode) -> Result<()> {
        self.shm_conn()?.unlock(self.registry.locker(), offset, n, mode)
    }

    /// Memory barrier for shared-index readers and writers
    pub fn shm_barrier(&self) {
        ShmConnection::barrier(&self.registry);
    }

    /// This handle's shared-index attachment, if mapped
    pub fn shm_connection(&self) -> Option<&ShmConnection> {
        self.shm.as_ref()
    }

    /// Detach from the shared index; the last detach in the process unmaps
    /// it and, with `delete`, unlinks the file
    ///
    /// The handle is detached even if releasing its slot locks fails, so a
    /// failed unmap is not retried and [`DbFile::close`] still succeeds.
    pub fn shm_unmap(&mut self, delete: bool) -> Result<()> {
        let Some(conn) = self.shm.take() else {
            return Ok(());
        };
        let Some(record) = self.lock.inode() else {
            return Err(Error::Misuse("database file already closed".into()));
        };
        ShmNode::detach(&self.registry, record, conn, delete)
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Release all locks and the descriptor. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let unmapped = self.shm_unmap(false);
        if let Err(e) = &unmapped {
            warn!(target: "strata::shm", path = %self.path.display(), error = %e, "shared index detach on close failed");
        }
        let closed = self.lock.close();

        if self.flags.delete_on_close {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(target: "strata::lock", path = %self.path.display(), error = %e, "delete on close failed"),
            }
        }
        debug!(target: "strata::lock", path = %self.path.display(), "database file closed");
        unmapped.and(closed)
    }
}

impl Drop for DbFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(target: "strata::lock", path = %self.path.display(), error = %e, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for DbFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbFile")
            .field("path", &self.path)
            .field("style", &self.lock.style())
            .field("level", &self.lock.level())
            .field("shm", &self.shm.is_some())
            .finish()
    }
}

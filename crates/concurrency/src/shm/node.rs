//! Shared-index region manager
//!
//! One [`ShmNode`] exists per database identity per registry. It owns the
//! `-shm` descriptor and the mapped regions, and is shared by every
//! connection in the process that has the index open.
//!
//! ## First open
//!
//! The first process to open the index resets it. The deadman byte
//! ([`SHM_DMS`]) tells whether anyone else is using the file:
//!
//! ```text
//! probe DMS for a write lock
//!   nobody holds it      -> take write lock, truncate to 3 bytes
//!                           (read-only: ReadOnlyCantInit)
//!   write lock elsewhere -> Busy, someone is initializing
//!   read lock elsewhere  -> in use, keep the contents
//! take read lock on DMS and hold it until the node closes
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_core::{Error, IoOp, Result, SHM_DMS};
use tracing::{debug, info, warn};

use super::lock::{ConnMasks, ShmConnection};
use super::region::{Mapping, ShmRegion};
use crate::range_lock::{ByteRange, LockKind, RangeLock};
use crate::registry::{InodeRecord, Registry};

/// Size the index is truncated to on first open
const SENTINEL_SIZE: u64 = 3;
/// Growth writes one byte into each page of this size
const GROWTH_PAGE: u64 = 4096;

const DMS: ByteRange = ByteRange::new(SHM_DMS, 1);

/// Path of the shared-index file for a database
pub fn shm_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push("-shm");
    PathBuf::from(name)
}

/// How a connection wants the index opened
#[derive(Debug, Clone, Copy)]
pub(crate) struct ShmOpenOptions {
    /// Open the file read-only regardless of permissions
    pub(crate) read_only: bool,
    /// Keep the index in process memory; no file at all
    pub(crate) heap: bool,
    /// Permission bits for a newly created file
    pub(crate) mode: u32,
}

pub(crate) struct NodeInner {
    /// Connections attached to the node
    pub(crate) n_ref: u32,
    /// Backing descriptor, `None` in heap mode or after close
    pub(crate) file: Option<File>,
    region_size: usize,
    regions: Vec<Arc<Mapping>>,
    /// Per-connection slot masks
    pub(crate) conns: Vec<ConnMasks>,
    next_id: u64,
}

/// Process-wide state of one database's shared index
pub struct ShmNode {
    path: PathBuf,
    read_only: bool,
    heap: bool,
    pub(crate) inner: Mutex<NodeInner>,
}

impl ShmNode {
    /// Attach a new connection to the record's node, opening it first if
    /// no connection in the process has the index open
    pub(crate) fn attach(
        registry: &Registry,
        record: &Arc<InodeRecord>,
        db_path: &Path,
        opts: ShmOpenOptions,
    ) -> Result<ShmConnection> {
        let _table = registry.table();
        let mut st = record.state.lock();
        let node = match &st.shm {
            Some(node) => Arc::clone(node),
            None => {
                let node = Arc::new(Self::open(registry.locker(), db_path, opts)?);
                st.shm = Some(Arc::clone(&node));
                node
            }
        };

        let id = {
            let mut inner = node.inner.lock();
            inner.n_ref += 1;
            let id = inner.next_id;
            inner.next_id += 1;
            inner.conns.push(ConnMasks::new(id));
            id
        };
        debug!(target: "strata::shm", path = %node.path.display(), conn = id, "connection attached");
        Ok(ShmConnection::new(node, id))
    }

    fn open(locker: &dyn RangeLock, db_path: &Path, opts: ShmOpenOptions) -> Result<Self> {
        let path = shm_path(db_path);
        if opts.heap {
            debug!(target: "strata::shm", path = %path.display(), "heap-mode shared index");
            return Ok(Self::with_file(path, None, false, true));
        }

        let (file, read_only) = open_file(&path, opts)?;
        if let Err(e) = init_deadman(locker, &file, read_only, &path) {
            // Drop whatever the probe sequence took before failing.
            if let Err(close_err) = locker.release_descriptor(file) {
                warn!(target: "strata::shm", error = %close_err, "close after failed open");
            }
            return Err(e);
        }
        Ok(Self::with_file(path, Some(file), read_only, false))
    }

    fn with_file(path: PathBuf, file: Option<File>, read_only: bool, heap: bool) -> Self {
        ShmNode {
            path,
            read_only,
            heap,
            inner: Mutex::new(NodeInner {
                n_ref: 0,
                file,
                region_size: 0,
                regions: Vec::new(),
                conns: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Path of the `-shm` file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the index was opened read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the index lives in process memory
    pub fn is_heap(&self) -> bool {
        self.heap
    }

    /// Connections in this process attached to the node
    pub fn connections(&self) -> u32 {
        self.inner.lock().n_ref
    }

    /// Number of mapped regions
    pub fn mapped_regions(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// Map region `index`, optionally growing the file to hold it
    ///
    /// Returns `Ok(None)` when the region lies beyond the end of the file and
    /// `extend` is false. `region_size` must be a power of two and the same
    /// on every call for the life of the node.
    pub fn map(&self, index: u32, region_size: usize, extend: bool) -> Result<Option<ShmRegion>> {
        if !region_size.is_power_of_two() {
            return Err(Error::Misuse(format!(
                "shared-index region size {} is not a power of two",
                region_size
            )));
        }
        let mut inner = self.inner.lock();
        if inner.region_size == 0 {
            inner.region_size = region_size;
        } else if inner.region_size != region_size {
            return Err(Error::Misuse(format!(
                "shared-index region size changed from {} to {}",
                inner.region_size, region_size
            )));
        }

        let idx = index as usize;
        if let Some(map) = inner.regions.get(idx) {
            return Ok(Some(ShmRegion::new(index, Arc::clone(map))));
        }

        let needed = (idx as u64 + 1)
            .checked_mul(region_size as u64)
            .ok_or_else(|| Error::Misuse(format!("region {} out of range", index)))?;

        let NodeInner { file, regions, .. } = &mut *inner;
        match file.as_ref() {
            // Heap memory always grows on demand.
            None if self.heap => {
                while regions.len() <= idx {
                    let map = Mapping::anonymous(region_size).map_err(|e| Error::io(IoOp::ShmMap, e))?;
                    regions.push(Arc::new(map));
                }
            }
            None => return Err(Error::Misuse("shared index used after close".into())),
            Some(file) => {
                let size = file.metadata().map_err(|e| Error::io(IoOp::ShmSize, e))?.len();
                if size < needed {
                    if !extend {
                        return Ok(None);
                    }
                    if self.read_only {
                        return Err(Error::ReadOnly(format!(
                            "cannot grow read-only shared index {}",
                            self.path.display()
                        )));
                    }
                    grow(file, size, needed).map_err(|e| Error::io(IoOp::ShmSize, e))?;
                    debug!(target: "strata::shm", path = %self.path.display(), from = size, to = needed, "shared index grown");
                }
                while regions.len() <= idx {
                    let offset = regions.len() as u64 * region_size as u64;
                    let map = if self.read_only {
                        Mapping::file_read_only(file, offset, region_size)
                    } else {
                        Mapping::file_writable(file, offset, region_size)
                    }
                    .map_err(|e| Error::io(IoOp::ShmMap, e))?;
                    regions.push(Arc::new(map));
                }
            }
        }
        Ok(Some(ShmRegion::new(index, Arc::clone(&regions[idx]))))
    }

    /// Detach `conn`; the last detach unmaps everything, closes the file,
    /// and unlinks it when `delete` is set
    ///
    /// The connection is detached even when releasing its slot locks fails;
    /// that error is returned after the node bookkeeping is done. Closing the
    /// descriptor drops any slot lock the failed unlock left behind.
    ///
    /// The last detach retires every region handed out by [`ShmNode::map`].
    /// Outstanding handles keep the memory mapped but refuse reads and
    /// writes, since another process may truncate the file once the deadman
    /// lock is gone.
    pub(crate) fn detach(
        registry: &Registry,
        record: &Arc<InodeRecord>,
        conn: ShmConnection,
        delete: bool,
    ) -> Result<()> {
        let released = conn.release_all(registry.locker());

        let _table = registry.table();
        let mut st = record.state.lock();
        let id = conn.id();
        let node = conn.into_node();
        let mut inner = node.inner.lock();
        inner.conns.retain(|c| c.id != id);
        inner.n_ref = inner.n_ref.saturating_sub(1);
        if inner.n_ref > 0 {
            return released;
        }

        for map in inner.regions.drain(..) {
            map.retire();
        }
        inner.region_size = 0;
        let file = inner.file.take();
        drop(inner);
        st.shm = None;

        if let Some(file) = file {
            if delete && !node.read_only {
                match std::fs::remove_file(&node.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(target: "strata::shm", path = %node.path.display(), error = %e, "unlink failed"),
                }
            }
            let closed = registry
                .locker()
                .release_descriptor(file)
                .map_err(|e| Error::io(IoOp::Close, e));
            if released.is_ok() {
                closed?;
            } else if let Err(e) = closed {
                warn!(target: "strata::shm", path = %node.path.display(), error = %e, "close after failed release");
            }
        }
        debug!(target: "strata::shm", path = %node.path.display(), delete, "shared index closed");
        released
    }
}

impl std::fmt::Debug for ShmNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmNode")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("heap", &self.heap)
            .finish_non_exhaustive()
    }
}

fn open_file(path: &Path, opts: ShmOpenOptions) -> Result<(File, bool)> {
    if opts.read_only {
        let file = File::open(path).map_err(|e| Error::io(IoOp::ShmOpen, e))?;
        return Ok((file, true));
    }
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(opts.mode)
        .open(path)
    {
        Ok(file) => Ok((file, false)),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            let file = File::open(path).map_err(|e| Error::io(IoOp::ShmOpen, e))?;
            debug!(target: "strata::shm", path = %path.display(), "shared index opened read-only");
            Ok((file, true))
        }
        Err(e) => Err(Error::io(IoOp::ShmOpen, e)),
    }
}

fn init_deadman(locker: &dyn RangeLock, file: &File, read_only: bool, path: &Path) -> Result<()> {
    let held = locker
        .probe(file, DMS, LockKind::Write)
        .map_err(|e| Error::io(IoOp::Lock, e))?;
    match held {
        None => {
            if read_only {
                return Err(Error::ReadOnlyCantInit);
            }
            if !locker
                .try_lock(file, DMS, LockKind::Write)
                .map_err(|e| Error::io(IoOp::ShmLock, e))?
            {
                return Err(Error::Busy);
            }
            file.set_len(SENTINEL_SIZE)
                .map_err(|e| Error::io(IoOp::ShmOpen, e))?;
            info!(target: "strata::shm", path = %path.display(), "shared index initialized");
        }
        Some(LockKind::Write) => return Err(Error::Busy),
        Some(LockKind::Read) => {}
    }
    if !locker
        .try_lock(file, DMS, LockKind::Read)
        .map_err(|e| Error::io(IoOp::ShmLock, e))?
    {
        return Err(Error::Busy);
    }
    Ok(())
}

/// Extend `file` from `size` to at least `needed` bytes by writing a zero
/// byte at the end of every page, so the blocks are really allocated
fn grow(file: &File, size: u64, needed: u64) -> io::Result<()> {
    let first = size / GROWTH_PAGE;
    let last = (needed + GROWTH_PAGE - 1) / GROWTH_PAGE;
    for page in first..last {
        file.write_all_at(&[0], page * GROWTH_PAGE + GROWTH_PAGE - 1)?;
    }
    Ok(())
}

//! Mapped shared-index regions

use std::fs::File;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapMut, MmapOptions};
use strata_core::{Error, Result};

/// Keeps the mapping alive; never dereferenced after construction
#[allow(dead_code)]
enum Backing {
    Writable(MmapMut),
    ReadOnly(Mmap),
}

/// One mapped region and the raw pointer into it
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
    /// Cleared when the owning node closes
    live: AtomicBool,
    _backing: Backing,
}

// SAFETY: `ptr` points into the mapping owned by `_backing`, which lives as
// long as this value. The memory is shared with other processes anyway; all
// access goes through raw-pointer copies or atomics, never through `&mut`.
unsafe impl Send for Mapping {}
// SAFETY: see `Send`.
unsafe impl Sync for Mapping {}

fn null_mapping() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "mmap returned a null pointer")
}

impl Mapping {
    /// Shared writable mapping of `len` bytes of `file` at `offset`
    pub(crate) fn file_writable(file: &File, offset: u64, len: usize) -> io::Result<Self> {
        // SAFETY: the shared-index file is only ever extended while mapped.
        // It is truncated solely during first initialization, which holds the
        // deadman write lock and therefore runs before any process maps it.
        let mut map = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(file)? };
        let ptr = NonNull::new(map.as_mut_ptr()).ok_or_else(null_mapping)?;
        Ok(Mapping {
            ptr,
            len,
            writable: true,
            live: AtomicBool::new(true),
            _backing: Backing::Writable(map),
        })
    }

    /// Shared read-only mapping
    pub(crate) fn file_read_only(file: &File, offset: u64, len: usize) -> io::Result<Self> {
        // SAFETY: as for `file_writable`; the mapping is never written.
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map(file)? };
        let ptr = NonNull::new(map.as_ptr() as *mut u8).ok_or_else(null_mapping)?;
        Ok(Mapping {
            ptr,
            len,
            writable: false,
            live: AtomicBool::new(true),
            _backing: Backing::ReadOnly(map),
        })
    }

    /// Zeroed private memory, for heap-mode nodes
    pub(crate) fn anonymous(len: usize) -> io::Result<Self> {
        let mut map = MmapOptions::new().len(len).map_anon()?;
        let ptr = NonNull::new(map.as_mut_ptr()).ok_or_else(null_mapping)?;
        Ok(Mapping {
            ptr,
            len,
            writable: true,
            live: AtomicBool::new(true),
            _backing: Backing::Writable(map),
        })
    }

    /// Mark the mapping closed; region handles refuse access from now on
    pub(crate) fn retire(&self) {
        self.live.store(false, Ordering::Release);
    }
}

/// Handle to one mapped region of the shared index
///
/// Contents are shared with every connection and process using the index;
/// coordinate access with the slot locks.
///
/// A handle keeps the memory mapped, but once the last connection in the
/// process detaches the region is retired: [`ShmRegion::read`] and
/// [`ShmRegion::write`] return [`Error::Misuse`] and
/// [`ShmRegion::atomic_u32`] returns `None`. Pointers taken earlier through
/// [`ShmRegion::as_ptr`] are not tracked.
#[derive(Clone)]
pub struct ShmRegion {
    index: u32,
    map: Arc<Mapping>,
}

impl ShmRegion {
    pub(crate) fn new(index: u32, map: Arc<Mapping>) -> Self {
        ShmRegion { index, map }
    }

    /// Region number
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Region size in bytes
    pub fn len(&self) -> usize {
        self.map.len
    }

    /// Always false for a mapped region
    pub fn is_empty(&self) -> bool {
        self.map.len == 0
    }

    /// Whether writes are permitted
    pub fn is_writable(&self) -> bool {
        self.map.writable
    }

    /// Start of the region
    pub fn as_ptr(&self) -> *const u8 {
        self.map.ptr.as_ptr()
    }

    /// Start of the region, if it is writable
    pub fn as_mut_ptr(&self) -> Option<*mut u8> {
        self.map.writable.then(|| self.map.ptr.as_ptr())
    }

    /// Whether the owning node is still open
    pub fn is_live(&self) -> bool {
        self.map.live.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same mapping
    pub fn same_mapping(&self, other: &ShmRegion) -> bool {
        Arc::ptr_eq(&self.map, &other.map)
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        if !self.is_live() {
            return Err(Error::Misuse(format!(
                "shared-index region {} used after the index closed",
                self.index
            )));
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.map.len => Ok(()),
            _ => Err(Error::Misuse(format!(
                "access [{}, +{}) outside region of {} bytes",
                offset, len, self.map.len
            ))),
        }
    }

    /// Copy bytes out of the region
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        // SAFETY: bounds checked above; the mapping outlives `self`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy bytes into the region
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let ptr = self
            .as_mut_ptr()
            .ok_or_else(|| Error::ReadOnly("shared-index region is mapped read-only".into()))?;
        self.check_bounds(offset, data.len())?;
        // SAFETY: bounds checked above; the mapping is writable and outlives
        // `self`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len());
        }
        Ok(())
    }

    /// A 32-bit atomic at `offset`, or `None` if misaligned or out of range
    pub fn atomic_u32(&self, offset: usize) -> Option<&AtomicU32> {
        self.check_bounds(offset, 4).ok()?;
        // SAFETY: in bounds per the check above.
        let ptr = unsafe { self.as_ptr().add(offset) };
        if ptr as usize % std::mem::align_of::<AtomicU32>() != 0 {
            return None;
        }
        // SAFETY: aligned, in bounds, and valid for the lifetime of `self`.
        // AtomicU32 has the same layout as u32 and tolerates concurrent
        // access from other processes.
        Some(unsafe { &*(ptr as *const AtomicU32) })
    }
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("index", &self.index)
            .field("len", &self.map.len)
            .field("writable", &self.map.writable)
            .finish()
    }
}

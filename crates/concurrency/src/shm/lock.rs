//! Shared-index lock coordinator
//!
//! The index has [`SHM_NLOCK`] logical lock slots, slot `i` being byte
//! `SHM_BASE + i` of the `-shm` file. Connections in one process share one
//! set of OS locks, so before touching the OS each request is checked
//! against the slots held by sibling connections on the same node:
//!
//! - a shared request fails if a sibling holds the slot exclusively; the OS
//!   read lock is only taken if no sibling shares the slot already
//! - an exclusive request fails if any sibling holds the slot at all
//! - a release only reaches the OS once no sibling holds the slot
//!
//! All of this runs under the node mutex.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use strata_core::{shm_slot_mask, Error, IoOp, Result, SHM_BASE, SHM_NLOCK};
use tracing::{trace, warn};

use super::node::ShmNode;
use super::region::ShmRegion;
use crate::range_lock::{ByteRange, LockKind, RangeLock};
use crate::registry::Registry;

/// Mode of a slot lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmLockMode {
    /// Any number of holders; one slot per request
    Shared,
    /// Single holder
    Exclusive,
}

/// Slots held by one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnMasks {
    pub(crate) id: u64,
    /// Slots held shared
    pub shared: u16,
    /// Slots held exclusively
    pub exclusive: u16,
}

impl ConnMasks {
    pub(crate) fn new(id: u64) -> Self {
        ConnMasks {
            id,
            ..Default::default()
        }
    }
}

/// Exclusive masks pairwise disjoint, and disjoint from every other
/// connection's shared mask
fn masks_consistent(conns: &[ConnMasks]) -> bool {
    conns.iter().enumerate().all(|(i, a)| {
        conns
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .all(|(_, b)| a.exclusive & (b.exclusive | b.shared) == 0)
    })
}

fn slot_range(offset: u32, n: u32) -> ByteRange {
    ByteRange::new(SHM_BASE + u64::from(offset), u64::from(n))
}

/// One connection's attachment to a shared index
///
/// Created by [`DbFile::shm_map`](crate::DbFile::shm_map) and released by
/// [`DbFile::shm_unmap`](crate::DbFile::shm_unmap).
#[derive(Debug)]
pub struct ShmConnection {
    node: Arc<ShmNode>,
    id: u64,
}

impl ShmConnection {
    pub(crate) fn new(node: Arc<ShmNode>, id: u64) -> Self {
        ShmConnection { node, id }
    }

    pub(crate) fn into_node(self) -> Arc<ShmNode> {
        self.node
    }

    /// Connection id, unique within its node
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Node this connection is attached to
    pub fn node(&self) -> &Arc<ShmNode> {
        &self.node
    }

    /// Map a region through the node
    pub fn map(&self, index: u32, region_size: usize, extend: bool) -> Result<Option<ShmRegion>> {
        self.node.map(index, region_size, extend)
    }

    /// Slots this connection currently holds
    pub fn masks(&self) -> ConnMasks {
        let inner = self.node.inner.lock();
        inner
            .conns
            .iter()
            .find(|c| c.id == self.id)
            .copied()
            .unwrap_or_else(|| ConnMasks::new(self.id))
    }

    fn checked_mask(offset: u32, n: u32, mode: ShmLockMode) -> Result<u16> {
        debug_assert!(
            mode == ShmLockMode::Exclusive || n == 1,
            "shared slot locks cover exactly one slot"
        );
        if mode == ShmLockMode::Shared && n != 1 {
            return Err(Error::Misuse(format!(
                "shared slot lock over {} slots",
                n
            )));
        }
        shm_slot_mask(offset, n).ok_or_else(|| {
            Error::Misuse(format!(
                "slot range {}+{} outside 0..{}",
                offset, n, SHM_NLOCK
            ))
        })
    }

    /// Take `n` slots starting at `offset`
    pub fn lock(&self, locker: &dyn RangeLock, offset: u32, n: u32, mode: ShmLockMode) -> Result<()> {
        let mask = Self::checked_mask(offset, n, mode)?;
        let mut inner = self.node.inner.lock();
        let me = inner
            .conns
            .iter()
            .position(|c| c.id == self.id)
            .ok_or_else(|| Error::Misuse("shared-index connection already detached".into()))?;

        let mut sibling_shared = 0u16;
        for (i, other) in inner.conns.iter().enumerate() {
            if i == me {
                continue;
            }
            let blocking = match mode {
                ShmLockMode::Shared => other.exclusive,
                ShmLockMode::Exclusive => other.exclusive | other.shared,
            };
            if blocking & mask != 0 {
                trace!(target: "strata::shm", conn = self.id, offset, n, ?mode, "slot busy in process");
                return Err(Error::Busy);
            }
            sibling_shared |= other.shared;
        }

        let need_os = match mode {
            ShmLockMode::Shared => sibling_shared & mask == 0,
            ShmLockMode::Exclusive => true,
        };
        if need_os {
            if let Some(file) = inner.file.as_ref() {
                let kind = match mode {
                    ShmLockMode::Shared => LockKind::Read,
                    ShmLockMode::Exclusive => LockKind::Write,
                };
                let granted = locker
                    .try_lock(file, slot_range(offset, n), kind)
                    .map_err(|e| Error::io(IoOp::ShmLock, e))?;
                if !granted {
                    return Err(Error::Busy);
                }
            }
        }

        let conn = &mut inner.conns[me];
        match mode {
            ShmLockMode::Shared => conn.shared |= mask,
            ShmLockMode::Exclusive => conn.exclusive |= mask,
        }
        debug_assert!(masks_consistent(&inner.conns));
        trace!(target: "strata::shm", conn = self.id, offset, n, ?mode, os = need_os, "slot locked");
        Ok(())
    }

    /// Release `n` slots starting at `offset`
    pub fn unlock(&self, locker: &dyn RangeLock, offset: u32, n: u32, mode: ShmLockMode) -> Result<()> {
        let mask = Self::checked_mask(offset, n, mode)?;
        self.release_mask(locker, offset, n, mask)
    }

    fn release_mask(&self, locker: &dyn RangeLock, offset: u32, n: u32, mask: u16) -> Result<()> {
        let mut inner = self.node.inner.lock();
        let me = inner
            .conns
            .iter()
            .position(|c| c.id == self.id)
            .ok_or_else(|| Error::Misuse("shared-index connection already detached".into()))?;

        let held_elsewhere = inner
            .conns
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != me)
            .fold(0u16, |acc, (_, c)| acc | c.shared | c.exclusive);

        let need_os = held_elsewhere & mask == 0;
        if need_os {
            if let Some(file) = inner.file.as_ref() {
                locker
                    .unlock(file, slot_range(offset, n))
                    .map_err(|e| Error::io(IoOp::ShmLock, e))?;
            }
        }

        let conn = &mut inner.conns[me];
        conn.shared &= !mask;
        conn.exclusive &= !mask;
        trace!(target: "strata::shm", conn = self.id, offset, n, os = need_os, "slot released");
        Ok(())
    }

    /// Release every slot this connection still holds
    ///
    /// Every slot is attempted; the first failure is returned.
    pub(crate) fn release_all(&self, locker: &dyn RangeLock) -> Result<()> {
        let held = self.masks();
        let all = held.shared | held.exclusive;
        if all == 0 {
            return Ok(());
        }
        let mut first_err = None;
        for slot in 0..SHM_NLOCK {
            if all & (1 << slot) != 0 {
                if let Err(e) = self.release_mask(locker, slot, 1, 1 << slot) {
                    warn!(target: "strata::shm", conn = self.id, slot, error = %e, "slot release failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Full memory barrier across threads sharing the index
    pub fn barrier(registry: &Registry) {
        fence(Ordering::SeqCst);
        drop(registry.table());
    }
}

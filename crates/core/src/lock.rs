//! Lock levels and the on-disk lock-byte layout
//!
//! The byte offsets below must be identical in every process that opens the
//! same database, otherwise the advisory locks stop excluding each other.
//!
//! ## Database file
//!
//! ```text
//! PENDING_BYTE   0x4000_0000   1 byte    write = exclusive intent, read = shared probe
//! RESERVED_BYTE  0x4000_0001   1 byte    write only
//! SHARED_FIRST   0x4000_0002   510 bytes read = shared, write = exclusive
//! ```
//!
//! ## Shared-index (`-shm`) file
//!
//! ```text
//! SHM_BASE       120           SHM_NLOCK bytes, one per logical slot
//! SHM_DMS        128           deadman byte, right after the last slot
//! ```

use std::fmt;

/// Byte offset of the pending lock byte.
pub const PENDING_BYTE: u64 = 0x4000_0000;
/// Byte offset of the reserved lock byte.
pub const RESERVED_BYTE: u64 = PENDING_BYTE + 1;
/// Byte offset of the first shared lock byte.
pub const SHARED_FIRST: u64 = PENDING_BYTE + 2;
/// Number of bytes in the shared lock range.
pub const SHARED_SIZE: u64 = 510;

/// Number of logical lock slots in the shared index.
pub const SHM_NLOCK: u32 = 8;
/// Byte offset of the first shared-index lock slot.
pub const SHM_BASE: u64 = (22 + SHM_NLOCK as u64) * 4;
/// Byte offset of the shared-index deadman byte.
pub const SHM_DMS: u64 = SHM_BASE + SHM_NLOCK as u64;

/// Lock level of a database connection
///
/// Ordered so that escalation compares with `<`:
/// `Unlocked < Shared < Reserved < Pending < Exclusive`.
///
/// `Pending` is never requested by a caller. It is the intermediate state on
/// the way to `Exclusive` that stops new readers while existing ones drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockLevel {
    /// No lock held
    #[default]
    Unlocked = 0,
    /// Reading is allowed; any number of connections may hold it
    Shared = 1,
    /// Intends to write; coexists with readers but not with another writer
    Reserved = 2,
    /// Waiting for readers to drain before going exclusive
    Pending = 3,
    /// Writing; no other lock may be held
    Exclusive = 4,
}

impl LockLevel {
    /// All levels in ascending order
    pub const ALL: [LockLevel; 5] = [
        LockLevel::Unlocked,
        LockLevel::Shared,
        LockLevel::Reserved,
        LockLevel::Pending,
        LockLevel::Exclusive,
    ];

    /// Short upper-case name, as used in log output
    pub fn as_str(&self) -> &'static str {
        match self {
            LockLevel::Unlocked => "NONE",
            LockLevel::Shared => "SHARED",
            LockLevel::Reserved => "RESERVED",
            LockLevel::Pending => "PENDING",
            LockLevel::Exclusive => "EXCLUSIVE",
        }
    }

    /// Whether a caller may pass this level to `set_lock`
    pub fn is_requestable(&self) -> bool {
        !matches!(self, LockLevel::Pending | LockLevel::Unlocked)
    }

    /// Whether a caller may pass this level to `lower_lock`
    pub fn is_lowerable_target(&self) -> bool {
        matches!(self, LockLevel::Unlocked | LockLevel::Shared)
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the slot bitmask for `n` slots starting at `offset`
///
/// Returns `None` if the range falls outside `0..SHM_NLOCK` or is empty.
pub fn shm_slot_mask(offset: u32, n: u32) -> Option<u16> {
    if n == 0 || offset >= SHM_NLOCK || n > SHM_NLOCK - offset {
        return None;
    }
    let width = (1u32 << n) - 1;
    Some((width << offset) as u16)
}

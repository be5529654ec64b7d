//! Shared-index (`-shm`) support
//!
//! - [`node`]: the per-database region manager, one per identity
//! - [`lock`]: per-connection slot locks coordinated across siblings
//! - [`region`]: handles to mapped regions

pub mod lock;
pub mod node;
pub mod region;

pub use lock::{ConnMasks, ShmConnection, ShmLockMode};
pub use node::{shm_path, ShmNode};
pub use region::ShmRegion;

/// Region size used by the write-ahead log index
pub const DEFAULT_REGION_SIZE: usize = 32 * 1024;

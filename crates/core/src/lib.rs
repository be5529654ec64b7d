//! Core types for Strata file locking
//!
//! This crate defines the foundational types used throughout the locking core:
//! - LockLevel: the five connection lock levels
//! - Lock-byte layout constants for the database and shared-index files
//! - FileIdentity: device+inode (or canonical path) identity of a file
//! - Error: Error type hierarchy with the Busy / I/O split
//! - LockConfig: `strata-lock.toml` configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod identity;
pub mod lock;

pub use config::{DowngradePolicy, LockConfig, LockStyle, LockStyleChoice, CONFIG_FILE_NAME};
pub use error::{Error, IoOp, Result};
pub use identity::FileIdentity;
pub use lock::{
    shm_slot_mask, LockLevel, PENDING_BYTE, RESERVED_BYTE, SHARED_FIRST, SHARED_SIZE, SHM_BASE,
    SHM_DMS, SHM_NLOCK,
};

//! Shared test utilities for the integration scenarios.
//!
//! Import via `mod common;` from a suite's main.rs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

pub use strata_lock::testing::{LockStats, SimulatedHost, SimulatedRangeLock};
pub use strata_lock::{
    DbFile, Error, FixedProbe, FsCapabilities, FsKind, LockConfig, LockLevel, OpenFlags, Registry,
    ShmLockMode, DEFAULT_REGION_SIZE,
};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route library logs through the test harness's captured output.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Scratch directory
// ============================================================================

/// Temporary directory holding one database file.
pub struct Scratch {
    pub dir: TempDir,
    pub db: PathBuf,
}

impl Scratch {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db = dir.path().join("main.db");
        std::fs::write(&db, b"").expect("Failed to create database file");
        Scratch { dir, db }
    }

    pub fn path(&self) -> &Path {
        &self.db
    }

    /// Write `strata-lock.toml` next to the database.
    pub fn write_config(&self, toml: &str) {
        std::fs::write(self.dir.path().join(strata_lock::CONFIG_FILE_NAME), toml)
            .expect("Failed to write config");
    }

    /// A raw descriptor on the database file, for inspecting the lock table.
    pub fn raw(&self) -> std::fs::File {
        std::fs::File::open(&self.db).expect("Failed to open database file")
    }
}

// ============================================================================
// Simulated processes
// ============================================================================

/// One simulated process: its own registry over a shared host lock table.
pub struct Proc {
    pub locker: SimulatedRangeLock,
    pub registry: Arc<Registry>,
}

impl Proc {
    pub fn new(host: &SimulatedHost) -> Self {
        Self::with_config(host, &LockConfig::default())
    }

    pub fn with_config(host: &SimulatedHost, config: &LockConfig) -> Self {
        let locker = host.process();
        let registry = Arc::new(
            Registry::with_config(Arc::new(locker.clone()), config)
                .expect("Failed to build registry"),
        );
        Proc { locker, registry }
    }

    pub fn open(&self, path: &Path) -> DbFile {
        self.open_with(path, OpenFlags::read_write(), FsCapabilities::default())
    }

    pub fn open_with(&self, path: &Path, flags: OpenFlags, caps: FsCapabilities) -> DbFile {
        DbFile::open_with_probe(
            Arc::clone(&self.registry),
            path,
            flags,
            &LockConfig::default(),
            &FixedProbe(caps),
        )
        .expect("Failed to open database file")
    }

    /// Open read-write with `config` applied to the handle.
    pub fn open_configured(&self, path: &Path, config: &LockConfig) -> DbFile {
        DbFile::open_with_probe(
            Arc::clone(&self.registry),
            path,
            OpenFlags::read_write(),
            config,
            &FixedProbe(FsCapabilities::default()),
        )
        .expect("Failed to open database file")
    }

    pub fn pid(&self) -> u32 {
        self.locker.pid()
    }

    pub fn stats(&self) -> LockStats {
        self.locker.stats()
    }
}

/// Raise `db` through each level up to `target`.
pub fn climb(db: &mut DbFile, target: LockLevel) -> strata_lock::Result<()> {
    for level in [LockLevel::Shared, LockLevel::Reserved, LockLevel::Exclusive] {
        if level > target {
            break;
        }
        db.set_lock(level)?;
    }
    Ok(())
}

//! Locking configuration via `strata-lock.toml`
//!
//! Settings are read once when a database file is opened and stay fixed for
//! the lifetime of that handle.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Config file name conventionally placed next to the database.
pub const CONFIG_FILE_NAME: &str = "strata-lock.toml";

/// Which lock back-end a handle uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockStyle {
    /// Full five-level byte-range protocol over fcntl locks
    Posix,
    /// One whole-file exclusive `flock` per connection
    Flock,
    /// No locking at all; the caller guarantees exclusion
    NoLock,
}

impl LockStyle {
    /// Name used in configuration and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStyle::Posix => "posix",
            LockStyle::Flock => "flock",
            LockStyle::NoLock => "none",
        }
    }
}

/// Lock style requested by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStyleChoice {
    /// Pick from the filesystem type at open time
    Auto,
    /// Always use this style
    Fixed(LockStyle),
}

/// Whether to use the split-range downgrade when lowering to SHARED
///
/// Some network filesystems propagate a stale read lock if the whole shared
/// range is unlocked and relocked in one step. The split sequence keeps part
/// of the range covered at every instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DowngradePolicy {
    /// Enable on filesystems known to need it
    Auto,
    /// Always enable
    On,
    /// Never enable
    Off,
}

/// Locking configuration loaded from `strata-lock.toml`.
///
/// # Example
///
/// ```toml
/// lock_style = "auto"
/// busy_timeout_ms = 0
/// nfs_downgrade = "auto"
/// readonly_shm = false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockConfig {
    /// Lock back-end: `"auto"`, `"posix"`, `"flock"` or `"none"`.
    #[serde(default = "default_auto")]
    pub lock_style: String,
    /// Total time to keep retrying a contended byte-range lock, in ms.
    /// Zero returns Busy immediately.
    #[serde(default)]
    pub busy_timeout_ms: u64,
    /// Split-range downgrade: `"auto"`, `"on"` or `"off"`.
    #[serde(default = "default_auto")]
    pub nfs_downgrade: String,
    /// Open the shared-index file read-only.
    #[serde(default)]
    pub readonly_shm: bool,
}

fn default_auto() -> String {
    "auto".to_string()
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_style: default_auto(),
            busy_timeout_ms: 0,
            nfs_downgrade: default_auto(),
            readonly_shm: false,
        }
    }
}

impl LockConfig {
    /// Parse the lock style string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a known style.
    pub fn lock_style(&self) -> Result<LockStyleChoice> {
        match self.lock_style.as_str() {
            "auto" => Ok(LockStyleChoice::Auto),
            "posix" => Ok(LockStyleChoice::Fixed(LockStyle::Posix)),
            "flock" => Ok(LockStyleChoice::Fixed(LockStyle::Flock)),
            "none" => Ok(LockStyleChoice::Fixed(LockStyle::NoLock)),
            other => Err(Error::Config(format!(
                "Invalid lock_style '{}'. Expected \"auto\", \"posix\", \"flock\" or \"none\".",
                other
            ))),
        }
    }

    /// Parse the downgrade policy string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"auto"`, `"on"` or `"off"`.
    pub fn downgrade_policy(&self) -> Result<DowngradePolicy> {
        match self.nfs_downgrade.as_str() {
            "auto" => Ok(DowngradePolicy::Auto),
            "on" => Ok(DowngradePolicy::On),
            "off" => Ok(DowngradePolicy::Off),
            other => Err(Error::Config(format!(
                "Invalid nfs_downgrade '{}'. Expected \"auto\", \"on\" or \"off\".",
                other
            ))),
        }
    }

    /// Busy timeout, or `None` when retrying is disabled.
    pub fn busy_timeout(&self) -> Option<Duration> {
        if self.busy_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.busy_timeout_ms))
        }
    }

    /// Check every field parses.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.lock_style()?;
        self.downgrade_policy()?;
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Strata lock configuration
#
# Lock back-end: "auto" (default), "posix", "flock" or "none"
#   "auto"  = byte-range locks, or flock on filesystems without them
#   "none"  = no locking; only for externally synchronized access
lock_style = "auto"

# Keep retrying a contended lock for up to this many milliseconds.
# 0 (default) reports "database is locked" immediately.
busy_timeout_ms = 0

# Split-range downgrade for network filesystems: "auto", "on" or "off"
nfs_downgrade = "auto"

# Open the shared-index file read-only (default: false)
readonly_shm = false
"#
    }

    /// Parse config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML or a field is invalid.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: LockConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse lock config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Read config from `path` if it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn from_file_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

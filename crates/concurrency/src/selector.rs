//! Back-end selection from configuration and filesystem capabilities

use std::fs::File;
use std::io;
use std::path::Path;

use strata_core::{DowngradePolicy, LockStyle, LockStyleChoice};
use tracing::debug;

use crate::range_lock::{ByteRange, LockKind, PosixRangeLock, RangeLock};

/// Filesystem family, as far as locking is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    /// NFS; byte-range locks work but downgrades can misbehave
    Nfs,
    /// SMB/CIFS; byte-range locks are unreliable
    Smb,
    /// Anything else
    Other,
}

/// What the filesystem holding a database supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsCapabilities {
    /// Filesystem family
    pub kind: FsKind,
    /// Whether `fcntl` byte-range locks are available
    pub range_locks: bool,
}

impl Default for FsCapabilities {
    fn default() -> Self {
        FsCapabilities {
            kind: FsKind::Other,
            range_locks: true,
        }
    }
}

/// Learns the capabilities of the filesystem holding an open file
pub trait FsProbe: Send + Sync {
    /// Probe the filesystem `file` lives on
    fn probe(&self, file: &File, path: &Path) -> io::Result<FsCapabilities>;
}

/// [`FsProbe`] using `fstatfs` and a trial `F_GETLK`
#[derive(Debug, Default, Clone, Copy)]
pub struct StatfsProbe;

impl FsProbe for StatfsProbe {
    fn probe(&self, file: &File, path: &Path) -> io::Result<FsCapabilities> {
        let kind = fs_kind(file)?;
        let range_locks = PosixRangeLock
            .probe(file, ByteRange::PENDING, LockKind::Write)
            .is_ok();
        debug!(target: "strata::select", path = %path.display(), ?kind, range_locks, "filesystem probed");
        Ok(FsCapabilities { kind, range_locks })
    }
}

#[cfg(all(target_os = "linux", not(target_env = "musl")))]
fn fs_kind(file: &File) -> io::Result<FsKind> {
    use nix::sys::statfs::{fstatfs, NFS_SUPER_MAGIC, SMB_SUPER_MAGIC};

    let stat = fstatfs(file).map_err(io::Error::from)?;
    let fs_type = stat.filesystem_type();
    Ok(if fs_type == NFS_SUPER_MAGIC {
        FsKind::Nfs
    } else if fs_type == SMB_SUPER_MAGIC {
        FsKind::Smb
    } else {
        FsKind::Other
    })
}

#[cfg(not(all(target_os = "linux", not(target_env = "musl"))))]
fn fs_kind(_file: &File) -> io::Result<FsKind> {
    Ok(FsKind::Other)
}

/// [`FsProbe`] returning fixed capabilities
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedProbe(pub FsCapabilities);

impl FsProbe for FixedProbe {
    fn probe(&self, _file: &File, _path: &Path) -> io::Result<FsCapabilities> {
        Ok(self.0)
    }
}

/// Pick the lock style for a file
///
/// An explicit choice always wins. Otherwise SMB, or any filesystem without
/// byte-range locks, gets whole-file `flock`; everything else gets the full
/// byte-range protocol.
pub fn select_style(choice: LockStyleChoice, caps: FsCapabilities) -> LockStyle {
    let style = match choice {
        LockStyleChoice::Fixed(style) => style,
        LockStyleChoice::Auto if caps.kind == FsKind::Smb || !caps.range_locks => LockStyle::Flock,
        LockStyleChoice::Auto => LockStyle::Posix,
    };
    debug!(target: "strata::select", ?choice, ?caps, style = style.as_str(), "lock style selected");
    style
}

/// Whether the split-range downgrade applies
pub fn use_split_downgrade(policy: DowngradePolicy, caps: FsCapabilities) -> bool {
    match policy {
        DowngradePolicy::On => true,
        DowngradePolicy::Off => false,
        DowngradePolicy::Auto => caps.kind == FsKind::Nfs,
    }
}

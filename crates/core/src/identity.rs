//! File identity for per-process lock coalescing
//!
//! Two handles refer to the same file when they share an identity. On Unix
//! that is the (device, inode) pair, which survives renames and hard links.
//! Elsewhere we fall back to the canonical path.

use std::fmt;
use std::fs::{File, Metadata};
use std::io;
use std::path::{Path, PathBuf};

/// Stable identity of an open file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileIdentity {
    /// Device and inode number
    DevIno {
        /// Device id
        dev: u64,
        /// Inode number
        ino: u64,
    },
    /// Canonicalized path, for platforms without stable inode numbers
    Path(PathBuf),
}

impl FileIdentity {
    /// Identity of an already open file
    ///
    /// `path` is only consulted on platforms without inode numbers.
    pub fn of_file(file: &File, path: &Path) -> io::Result<Self> {
        let meta = file.metadata()?;
        Self::from_metadata(&meta, path)
    }

    /// Identity of the file at `path`, or `None` if it does not exist
    pub fn of_path(path: &Path) -> io::Result<Option<Self>> {
        match std::fs::metadata(path) {
            Ok(meta) => Self::from_metadata(&meta, path).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[cfg(unix)]
    fn from_metadata(meta: &Metadata, _path: &Path) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        Ok(FileIdentity::DevIno {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    fn from_metadata(_meta: &Metadata, path: &Path) -> io::Result<Self> {
        Ok(FileIdentity::Path(path.canonicalize()?))
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileIdentity::DevIno { dev, ino } => write!(f, "{}:{}", dev, ino),
            FileIdentity::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

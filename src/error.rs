// src/error.rs

//! Error types shared across the bootstrap engine

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while bootstrapping a target root.
///
/// Every variant renders as a one-line human message. `InstallerFailed`
/// additionally carries the child command line and exit status so `--debug`
/// output can show exactly what was run inside the chroot.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("malformed archive {}: {reason}", path.display())]
    MalformedArchive { path: PathBuf, reason: String },

    #[error("unsupported member '{name}' in archive ({kind})")]
    UnsupportedMember { name: String, kind: String },

    #[error("archive member escapes the target root: {0}")]
    PathEscape(String),

    #[error("{} exists and is not a symlink into usr/", .0.display())]
    UsrMergeConflict(PathBuf),

    #[error("failed to {op} {}: {source}", target.display())]
    MountFailed {
        op: String,
        target: PathBuf,
        source: nix::Error,
    },

    #[error("no package named '{0}' in the archive index")]
    UnknownPackage(String),

    #[error("cannot satisfy dependency '{dependency}' of {package}")]
    DependencyUnresolved { package: String, dependency: String },

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("installer failed: `{command}` exited with {status}")]
    InstallerFailed { command: String, status: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Wrap an archive decoding failure with the archive path.
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedArchive {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

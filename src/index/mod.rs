// src/index/mod.rs

//! Package metadata model and the index interface
//!
//! The bootstrap state machine only ever talks to a `PackageIndex`; the
//! shipped implementation (`AptIndex`) resolves against a Debian-format
//! archive, and tests substitute an in-memory fake.

pub mod apt;

pub use apt::AptIndex;

use crate::progress::ProgressTracker;
use crate::error::Result;
use std::path::PathBuf;

/// Archive-declared priority of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Essential,
    Required,
    Important,
    Standard,
    #[default]
    Optional,
    Extra,
}

impl Priority {
    pub fn parse(s: &str) -> Self {
        match s {
            "essential" => Self::Essential,
            "required" => Self::Required,
            "important" => Self::Important,
            "standard" => Self::Standard,
            "extra" => Self::Extra,
            _ => Self::Optional,
        }
    }
}

/// Selection classes of the bootstrap, in the order the stages grow the
/// installed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    Essential,
    Required,
    Important,
    Requested,
}

/// Multi-Arch field of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiArch {
    #[default]
    No,
    Same,
    Foreign,
    Allowed,
}

impl MultiArch {
    pub fn parse(s: &str) -> Self {
        match s {
            "same" => Self::Same,
            "foreign" => Self::Foreign,
            "allowed" => Self::Allowed,
            _ => Self::No,
        }
    }
}

/// One binary package as described by the archive index.
///
/// Dependency fields hold AND-lists of OR-groups with version constraints
/// already stripped; resolution in this tool is by name.
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub priority: Priority,
    pub essential: bool,
    pub multi_arch: MultiArch,
    /// Pool path relative to the archive root
    pub filename: String,
    pub size: u64,
    pub sha256: Option<String>,
    pub depends: Vec<Vec<String>>,
    pub pre_depends: Vec<Vec<String>>,
    pub recommends: Vec<Vec<String>>,
    pub provides: Vec<String>,
}

impl Package {
    /// Identity of the package inside the chroot: plain name, or
    /// `name:architecture` for Multi-Arch: same packages.
    pub fn chroot_name(&self) -> String {
        if self.multi_arch == MultiArch::Same {
            format!("{}:{}", self.name, self.architecture)
        } else {
            self.name.clone()
        }
    }

    /// Cache file name: `<name>_<version>_<arch>.deb` with the epoch colon
    /// escaped the way apt does.
    pub fn archive_file_name(&self) -> String {
        format!(
            "{}_{}_{}.deb",
            self.name,
            self.version.replace(':', "%3a"),
            self.architecture
        )
    }
}

/// The resolution and fetch interface the bootstrap core consumes.
pub trait PackageIndex {
    /// Refresh metadata from the configured sources.
    fn update(&mut self) -> Result<()>;

    /// Rebuild resolution state; must be called after the target's status
    /// file has been mutated by a chrooted installer.
    fn open(&mut self) -> Result<()>;

    /// All packages in a selection class. `Requested` is resolved through
    /// `mark_install` of the configured names and yields nothing here.
    fn filter_by_priority(&self, class: PriorityClass) -> Vec<&Package>;

    /// Schedule a package and its dependency closure for installation.
    /// Idempotent; already-installed packages are skipped.
    fn mark_install(&mut self, name: &str) -> Result<()>;

    /// Marked packages whose state will change on commit, sorted by name.
    fn changes(&self) -> Vec<&Package>;

    /// Download all changed packages' archives into the cache directory.
    fn fetch_archives(&mut self, progress: &dyn ProgressTracker) -> Result<()>;

    /// Execute the install transaction with the target's own installer.
    fn commit(&mut self, progress: &dyn ProgressTracker) -> Result<()>;

    /// Where a package's .deb lives in the cache.
    fn archive_path(&self, package: &Package) -> PathBuf;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::parse("required"), Priority::Required);
        assert_eq!(Priority::parse("important"), Priority::Important);
        assert_eq!(Priority::parse("weird"), Priority::Optional);
    }

    #[test]
    fn test_chroot_name_multiarch() {
        let mut pkg = Package {
            name: "libc6".to_string(),
            architecture: "armhf".to_string(),
            ..Default::default()
        };
        assert_eq!(pkg.chroot_name(), "libc6");
        pkg.multi_arch = MultiArch::Same;
        assert_eq!(pkg.chroot_name(), "libc6:armhf");
    }

    #[test]
    fn test_archive_file_name_escapes_epoch() {
        let pkg = Package {
            name: "mawk".to_string(),
            version: "1:1.3.3-17".to_string(),
            architecture: "amd64".to_string(),
            ..Default::default()
        };
        assert_eq!(pkg.archive_file_name(), "mawk_1%3a1.3.3-17_amd64.deb");
    }
}

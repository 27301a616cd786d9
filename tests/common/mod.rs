// tests/common/mod.rs

//! Shared fixtures for integration tests: synthetic .deb archives and an
//! in-memory package index.

use debstrap::progress::ProgressTracker;
use debstrap::{Error, Package, PackageIndex, Priority, PriorityClass, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

/// One entry for a synthetic payload.
pub enum DebEntry {
    Dir(&'static str, u32),
    File(&'static str, &'static [u8], u32),
    Symlink(&'static str, &'static str),
}

/// Build a .deb at `dest` containing the given payload entries.
///
/// Entries are owned by the invoking user so extraction works in
/// unprivileged test runs too.
pub fn build_deb(dest: &Path, entries: &[DebEntry]) {
    let uid = u64::from(nix::unistd::getuid().as_raw());
    let gid = u64::from(nix::unistd::getgid().as_raw());
    let data_tar = {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for entry in entries {
            match entry {
                DebEntry::Dir(path, mode) => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_path(format!("./{path}/")).unwrap();
                    header.set_mode(*mode);
                    header.set_uid(uid);
                    header.set_gid(gid);
                    header.set_mtime(1600000000);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, std::io::empty()).unwrap();
                }
                DebEntry::File(path, content, mode) => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_path(format!("./{path}")).unwrap();
                    header.set_mode(*mode);
                    header.set_uid(uid);
                    header.set_gid(gid);
                    header.set_mtime(1600000000);
                    header.set_size(content.len() as u64);
                    header.set_cksum();
                    builder.append(&header, *content).unwrap();
                }
                DebEntry::Symlink(path, target) => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_path(format!("./{path}")).unwrap();
                    header.set_link_name(target).unwrap();
                    header.set_mode(0o777);
                    header.set_uid(uid);
                    header.set_gid(gid);
                    header.set_mtime(1600000000);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, std::io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap().finish().unwrap()
    };

    let control_tar = {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let builder = tar::Builder::new(encoder);
        builder.into_inner().unwrap().finish().unwrap()
    };

    let file = File::create(dest).unwrap();
    let mut archive = ar::Builder::new(file);
    archive
        .append(&ar::Header::new(b"debian-binary".to_vec(), 4), &b"2.0\n"[..])
        .unwrap();
    archive
        .append(
            &ar::Header::new(b"control.tar.gz".to_vec(), control_tar.len() as u64),
            &control_tar[..],
        )
        .unwrap();
    archive
        .append(
            &ar::Header::new(b"data.tar.gz".to_vec(), data_tar.len() as u64),
            &data_tar[..],
        )
        .unwrap();
}

/// Index over a fixed candidate list, with archives in a local directory.
pub struct FakeIndex {
    pub packages: Vec<Package>,
    pub cache_dir: PathBuf,
    marked: BTreeSet<String>,
}

impl FakeIndex {
    pub fn new(packages: Vec<Package>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            packages,
            cache_dir: cache_dir.into(),
            marked: BTreeSet::new(),
        }
    }
}

impl PackageIndex for FakeIndex {
    fn update(&mut self) -> Result<()> {
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn filter_by_priority(&self, class: PriorityClass) -> Vec<&Package> {
        self.packages
            .iter()
            .filter(|pkg| match class {
                PriorityClass::Essential => pkg.essential,
                PriorityClass::Required => pkg.priority == Priority::Required,
                PriorityClass::Important => pkg.priority == Priority::Important,
                PriorityClass::Requested => false,
            })
            .collect()
    }

    fn mark_install(&mut self, name: &str) -> Result<()> {
        if !self.packages.iter().any(|pkg| pkg.name == name) {
            return Err(Error::UnknownPackage(name.to_string()));
        }
        self.marked.insert(name.to_string());
        Ok(())
    }

    fn changes(&self) -> Vec<&Package> {
        self.marked
            .iter()
            .filter_map(|name| self.packages.iter().find(|pkg| pkg.name == *name))
            .collect()
    }

    fn fetch_archives(&mut self, _progress: &dyn ProgressTracker) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self, _progress: &dyn ProgressTracker) -> Result<()> {
        Ok(())
    }

    fn archive_path(&self, package: &Package) -> PathBuf {
        self.cache_dir.join(package.archive_file_name())
    }
}

/// A minimal essential package record.
pub fn package(name: &str, version: &str, essential: bool) -> Package {
    Package {
        name: name.to_string(),
        version: version.to_string(),
        architecture: "amd64".to_string(),
        priority: Priority::Required,
        essential,
        ..Default::default()
    }
}

// src/status.rs

//! The dpkg status database inside the target
//!
//! Between stage 1 extraction and the first real install the target needs a
//! status file claiming dpkg itself is installed, or dpkg refuses to run.
//! After stage 2 the file is authoritative and only read back.

use crate::error::Result;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Handle to `var/lib/dpkg` inside a target root.
pub struct StatusDb {
    root: PathBuf,
}

impl StatusDb {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join("var/lib/dpkg/status")
    }

    fn info_dir(&self) -> PathBuf {
        self.root.join("var/lib/dpkg/info")
    }

    /// Rewrite the status file with a single installed stanza for `name`,
    /// and create its (empty) file list.
    ///
    /// Used exactly once, for the installer package itself, so the first
    /// chrooted dpkg invocation believes it is already present.
    pub fn fake_install(&self, name: &str, version: &str) -> Result<()> {
        debug!("faking installed status for {} {}", name, version);
        fs::create_dir_all(self.info_dir())?;
        if let Some(parent) = self.status_path().parent() {
            fs::create_dir_all(parent)?;
        }

        let stanza = format!(
            "Package: {name}\nVersion: {version}\nMaintainer: unknown\nStatus: install ok installed\n\n"
        );
        fs::write(self.status_path(), stanza)?;
        fs::write(self.info_dir().join(format!("{name}.list")), "")?;
        Ok(())
    }

    /// Parse the installed set from the status file.
    ///
    /// Returns name -> version for every stanza whose Status ends in
    /// "installed". A missing status file is an empty set.
    pub fn installed(&self) -> Result<HashMap<String, String>> {
        let path = self.status_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&path)?;

        let mut installed = HashMap::new();
        for stanza in content.split("\n\n") {
            let mut name = None;
            let mut version = None;
            let mut is_installed = false;
            for line in stanza.lines() {
                if let Some(value) = line.strip_prefix("Package:") {
                    name = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("Version:") {
                    version = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("Status:") {
                    is_installed = value.trim().ends_with("installed");
                }
            }
            if let (Some(name), Some(version), true) = (name, version, is_installed) {
                installed.insert(name, version);
            }
        }
        debug!("status file lists {} installed packages", installed.len());
        Ok(installed)
    }

    /// Create empty status and available files if absent.
    pub fn ensure_files(&self) -> Result<()> {
        if let Some(parent) = self.status_path().parent() {
            fs::create_dir_all(parent)?;
        }
        for name in ["status", "available"] {
            let path = self.root.join("var/lib/dpkg").join(name);
            if !path.exists() {
                fs::write(&path, "")?;
            }
        }
        Ok(())
    }
}

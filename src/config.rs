// src/config.rs

//! Bootstrap configuration
//!
//! Every option has a default so that `BootstrapConfig::new(suite, target)`
//! alone describes a runnable bootstrap. The CLI layer fills in whatever the
//! user overrode.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Mirror used when none is given on the command line.
pub const DEFAULT_MIRROR: &str = "http://archive.ubuntu.com/ubuntu";

/// Well-known host keyring, used when present and no `--keyring` is given.
pub const DEFAULT_KEYRING: &str = "/usr/share/keyrings/ubuntu-archive-keyring.gpg";

/// Configuration for one bootstrap run.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Distribution suite (e.g. "xenial", "bookworm")
    pub suite: String,
    /// Absolute path of the root being built
    pub target: PathBuf,
    /// Archive base URL
    pub url: String,
    /// Target architecture
    pub arch: String,
    /// Archive components to enable
    pub components: Vec<String>,
    /// Extra packages requested by the user
    pub packages: Vec<String>,
    /// Keyring blob copied into the target for archive verification
    pub keyring: Option<PathBuf>,
    /// Include Priority: required packages in the final set
    pub required: bool,
    /// Include Priority: important packages in the final set
    pub important: bool,
    /// Expand Recommends when resolving dependencies
    pub recommends: bool,
    /// Resolve and print the package set instead of installing
    pub dry_run: bool,
    /// Include child command lines and exit statuses in error output
    pub debug: bool,
    /// Override for the .deb cache directory
    pub cache_dir: Option<PathBuf>,
}

impl BootstrapConfig {
    /// Create a configuration with defaults for everything but suite and target.
    pub fn new(suite: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        let keyring = default_keyring();
        if keyring.is_none() {
            warn!(
                "default keyring {} not found; archive fetches will be unauthenticated",
                DEFAULT_KEYRING
            );
        }
        Self {
            suite: suite.into(),
            target: target.into(),
            url: DEFAULT_MIRROR.to_string(),
            arch: host_architecture(),
            components: vec!["main".to_string()],
            packages: Vec::new(),
            keyring,
            required: true,
            important: true,
            recommends: true,
            dry_run: false,
            debug: false,
            cache_dir: None,
        }
    }

    /// Validate the configuration before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.suite.is_empty() {
            return Err(Error::Config("suite must not be empty".into()));
        }
        if self.arch.is_empty() {
            return Err(Error::Config("architecture must not be empty".into()));
        }
        if self.components.is_empty() {
            return Err(Error::Config("at least one component is required".into()));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(Error::Config(format!("unsupported archive URL: {}", self.url)));
        }
        if let Some(ref keyring) = self.keyring {
            if !keyring.is_file() {
                return Err(Error::Config(format!(
                    "keyring {} does not exist",
                    keyring.display()
                )));
            }
        }
        Ok(())
    }

    /// Directory .deb archives are fetched into.
    ///
    /// Defaults to the target's own apt archive cache so the chrooted
    /// installer can reach the files without copying.
    pub fn archive_cache(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.target.join("var/cache/apt/archives"))
    }

    /// The single line written to the target's `etc/apt/sources.list`.
    pub fn sources_list_line(&self) -> String {
        format!(
            "deb {} {} {}\n",
            self.url,
            self.suite,
            self.components.join(" ")
        )
    }
}

fn default_keyring() -> Option<PathBuf> {
    let path = Path::new(DEFAULT_KEYRING);
    path.is_file().then(|| path.to_path_buf())
}

/// The host's first configured dpkg architecture.
///
/// Falls back to a static mapping of the build target when dpkg is not
/// available on the host.
pub fn host_architecture() -> String {
    if let Ok(output) = Command::new("dpkg").arg("--print-architecture").output() {
        if output.status.success() {
            if let Some(arch) = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
            {
                return arch;
            }
        }
    }
    let fallback = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        other => other,
    };
    debug!("dpkg not available, assuming architecture {}", fallback);
    fallback.to_string()
}

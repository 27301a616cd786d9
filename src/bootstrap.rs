// src/bootstrap.rs

//! The two-stage bootstrap state machine
//!
//! Stage 1 extracts the essential set straight into the target tree with no
//! installer available. Stage 2 runs the target's own dpkg under chroot: an
//! early fixed-order install pass, an unpack pass for the rest of the
//! essential closure, and a configure pass. The remaining priority classes
//! and user-requested packages are then installed as a normal transaction.
//!
//! ```text
//! update -> mark(essential) -> fetch -> extract -> fake-install(dpkg)
//!        -> prepare chroot -> early install -> unpack -> configure
//!        -> mark(required, important, requested) -> commit -> teardown
//! ```
//!
//! Cleanup (mount stack drain, daemon-control restoration, keyring removal)
//! runs on every exit path.

use crate::chroot::ChrootEnv;
use crate::config::BootstrapConfig;
use crate::deb::{extract_member, DebReader};
use crate::error::{Error, Result};
use crate::index::{AptIndex, PackageIndex, PriorityClass};
use crate::progress::{LogProgress, ProgressTracker};
use crate::status::StatusDb;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Packages dpkg must install (not merely unpack) before anything else,
/// in this exact order.
pub const EARLY_PACKAGES: &[&str] = &[
    "base-passwd",
    "base-files",
    "dpkg",
    "libc6",
    "perl-base",
    "mawk",
    "debconf",
    "debianutils",
    "passwd",
];

/// Workaround: debconf's apt-utils dependency is not expressed in a way the
/// essential closure picks up.
const EXTRA_ESSENTIAL: &str = "apt-utils";

const FORCE_FLAGS: &[&str] = &["--force-depends", "--force-unsafe-io"];

/// Drives one bootstrap of one target directory.
pub struct Bootstrapper {
    config: BootstrapConfig,
    env: ChrootEnv,
    index: Box<dyn PackageIndex>,
    db: StatusDb,
    progress: Box<dyn ProgressTracker>,
}

impl Bootstrapper {
    /// Create a bootstrapper backed by the Debian archive index.
    pub fn new(config: BootstrapConfig) -> Result<Self> {
        let index = Box::new(AptIndex::new(&config)?);
        Self::with_index(config, index)
    }

    /// Create a bootstrapper with a caller-supplied index (used by tests).
    pub fn with_index(config: BootstrapConfig, index: Box<dyn PackageIndex>) -> Result<Self> {
        config.validate()?;
        let env = ChrootEnv::new(&config.target)?;
        let db = StatusDb::new(env.target());
        Ok(Self {
            config,
            env,
            index,
            db,
            progress: Box::new(LogProgress::new("fetch")),
        })
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    /// Run the bootstrap to completion (or print the dry-run resolution).
    ///
    /// Whatever happens inside, mounts are drained, daemon controls are
    /// restored, and the temporary keyring is removed before returning.
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_stages();
        // No-ops after a clean finish; on any failure this is what puts the
        // target back in a safe state.
        if let Err(e) = self.env.restore_daemons() {
            warn!("failed to restore daemon controls: {e}");
        }
        self.env.umount_all();
        if let Err(e) = self.env.remove_keyring() {
            warn!("failed to remove temporary keyring: {e}");
        }
        result
    }

    fn run_stages(&mut self) -> Result<()> {
        info!(
            "bootstrapping {} into {} from {}",
            self.config.suite,
            self.config.target.display(),
            self.config.url
        );
        self.index.update()?;

        if self.config.dry_run {
            for line in self.resolve_dry_run()? {
                println!("{line}");
            }
            return Ok(());
        }

        self.env.heal()?;
        self.env.skeleton(&self.config)?;
        self.env.usrmerge()?;

        self.mark_essential()?;
        self.index.fetch_archives(self.progress.as_ref())?;
        self.extract_essential()?;
        self.fake_install_dpkg()?;
        self.prepare_chroot()?;
        self.early_install()?;
        self.unpack_remaining()?;
        self.configure_pending()?;
        self.mark_priorities()?;
        self.index.commit(self.progress.as_ref())?;
        self.finish()
    }

    /// Resolve the full install set and render the `name\tversion` lines,
    /// sorted by name.
    fn resolve_dry_run(&mut self) -> Result<Vec<String>> {
        let mut names = self.class_names(PriorityClass::Essential);
        if self.config.required {
            names.extend(self.class_names(PriorityClass::Required));
        }
        if self.config.important {
            names.extend(self.class_names(PriorityClass::Important));
        }
        for name in names {
            self.index.mark_install(&name)?;
        }
        for name in self.config.packages.clone() {
            self.index.mark_install(&name)?;
        }

        // Order by package name; the emitted identity (name:arch for
        // Multi-Arch: same) would sort libc6 after libc6-dev.
        let mut changed = self.index.changes();
        changed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(changed
            .into_iter()
            .map(|pkg| format!("{}\t{}", pkg.chroot_name(), pkg.version))
            .collect())
    }

    fn class_names(&self, class: PriorityClass) -> Vec<String> {
        self.index
            .filter_by_priority(class)
            .into_iter()
            .map(|pkg| pkg.name.clone())
            .collect()
    }

    /// Mark the essential set (exactly once) plus the apt-utils workaround.
    fn mark_essential(&mut self) -> Result<()> {
        let names = self.class_names(PriorityClass::Essential);
        info!("marking {} essential packages", names.len());
        for name in names {
            self.index.mark_install(&name)?;
        }
        if let Err(e) = self.index.mark_install(EXTRA_ESSENTIAL) {
            warn!("could not mark {EXTRA_ESSENTIAL}: {e}");
        }
        Ok(())
    }

    /// Stage 1: unpack every fetched archive straight into the target.
    fn extract_essential(&mut self) -> Result<()> {
        let target = self.env.target().to_path_buf();
        let archives: Vec<_> = self
            .index
            .changes()
            .into_iter()
            .map(|pkg| (pkg.name.clone(), self.index.archive_path(pkg)))
            .collect();

        info!("extracting {} packages into {}", archives.len(), target.display());
        for (name, archive) in archives {
            debug!("extracting {name}");
            let reader = DebReader::open(&archive)?;
            reader.each_member(|member, data| extract_member(&target, member, data))?;
        }
        Ok(())
    }

    /// Write the fake installed stanza for dpkg so the first chrooted
    /// invocation finds itself already present.
    fn fake_install_dpkg(&mut self) -> Result<()> {
        let version = self
            .index
            .changes()
            .into_iter()
            .find(|pkg| pkg.name == "dpkg")
            .map(|pkg| pkg.version.clone())
            .ok_or_else(|| Error::UnknownPackage("dpkg".to_string()))?;
        self.db.fake_install("dpkg", &version)
    }

    /// Mounts, device nodes, and the last few fixups dpkg needs to run.
    fn prepare_chroot(&mut self) -> Result<()> {
        self.env.makedev()?;
        self.env.mount("proc", "proc", "proc")?;
        self.env.mount("sysfs", "sysfs", "sys")?;
        self.env.bind_mount(Path::new("/tmp"), "tmp")?;

        self.env.run("/sbin/ldconfig", &[])?;

        let awk = self.env.target().join("usr/bin/awk");
        if awk.symlink_metadata().is_err() {
            std::os::unix::fs::symlink("mawk", &awk)?;
        }
        let localtime = self.env.target().join("etc/localtime");
        if localtime.symlink_metadata().is_err() {
            std::os::unix::fs::symlink("/usr/share/zoneinfo/UTC", &localtime)?;
        }

        self.env.suppress_daemons()
    }

    /// Install the early packages one at a time, in the fixed order.
    fn early_install(&mut self) -> Result<()> {
        self.stage_archives()?;
        for name in EARLY_PACKAGES {
            let Some(file_name) = self.archive_in_chroot(name) else {
                warn!("{name} is not in the change set, skipping early install");
                continue;
            };
            info!("installing {name}");
            let mut args = vec!["--install"];
            args.extend_from_slice(FORCE_FLAGS);
            args.push(&file_name);
            self.env.run("/usr/bin/dpkg", &args)?;
        }
        Ok(())
    }

    /// Unpack everything else in the change set.
    fn unpack_remaining(&mut self) -> Result<()> {
        let remaining: Vec<String> = self
            .index
            .changes()
            .into_iter()
            .map(|pkg| pkg.name.clone())
            .filter(|name| !EARLY_PACKAGES.contains(&name.as_str()))
            .collect();

        info!("unpacking {} packages", remaining.len());
        for name in remaining {
            let Some(file_name) = self.archive_in_chroot(&name) else {
                continue;
            };
            debug!("unpacking {name}");
            let mut args = vec!["--unpack"];
            args.extend_from_slice(FORCE_FLAGS);
            args.push(&file_name);
            self.env.run("/usr/bin/dpkg", &args)?;
        }
        Ok(())
    }

    /// Configure everything unpacked so far.
    fn configure_pending(&mut self) -> Result<()> {
        info!("configuring unpacked packages");
        self.env.run(
            "/usr/bin/dpkg",
            &[
                "--configure",
                "--pending",
                "--force-configure-any",
                "--force-depends",
                "--force-unsafe-io",
            ],
        )
    }

    /// Re-read the status database and mark the remaining priority classes
    /// plus the user-requested packages.
    fn mark_priorities(&mut self) -> Result<()> {
        self.index.open()?;

        let mut names = Vec::new();
        if self.config.required {
            names.extend(self.class_names(PriorityClass::Required));
        }
        if self.config.important {
            names.extend(self.class_names(PriorityClass::Important));
        }
        for name in names {
            self.index.mark_install(&name)?;
        }
        // A requested name the index does not know is the user's error and
        // fails the bootstrap.
        for name in self.config.packages.clone() {
            self.index.mark_install(&name)?;
        }
        Ok(())
    }

    /// Tear down: daemon controls back, kernel filesystems unmounted in the
    /// fixed order, keyring removed.
    fn finish(&mut self) -> Result<()> {
        self.env.restore_daemons()?;
        self.env.umount("sys")?;
        self.env.umount("proc")?;
        self.env.umount("tmp")?;
        self.env.remove_keyring()?;
        println!("Installation complete");
        Ok(())
    }

    /// Make sure a change-set archive sits in the target's apt cache and
    /// return its chroot-relative path.
    fn archive_in_chroot(&self, name: &str) -> Option<String> {
        self.index
            .changes()
            .into_iter()
            .find(|pkg| pkg.name == name)
            .map(|pkg| format!("/var/cache/apt/archives/{}", pkg.archive_file_name()))
    }

    /// Copy archives into the target's cache when an external cache
    /// directory is configured.
    fn stage_archives(&self) -> Result<()> {
        let target_cache = self.env.target().join("var/cache/apt/archives");
        fs::create_dir_all(&target_cache)?;
        for pkg in self.index.changes() {
            let cached = self.index.archive_path(pkg);
            let staged = target_cache.join(pkg.archive_file_name());
            if cached != staged && !staged.is_file() {
                fs::copy(&cached, &staged)?;
            }
        }
        Ok(())
    }
}

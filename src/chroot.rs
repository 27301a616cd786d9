// src/chroot.rs

//! Target directory environment
//!
//! Owns everything about the target tree that is not package content: the
//! skeleton layout, the /usr merge, device nodes, the mount stack, daemon
//! start suppression, and running commands under chroot.
//!
//! The mount stack and the temporary keyring are released on drop, so any
//! exit path (error, panic, early return) leaves the target unmounted.

use crate::config::BootstrapConfig;
use crate::error::{Error, Result};
use crate::status::StatusDb;
use nix::mount::{mount, umount, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Directories created by `skeleton`.
const SKELETON_DIRS: &[&str] = &[
    "etc/apt/apt.conf.d",
    "etc/apt/preferences.d",
    "etc/apt/trusted.gpg.d",
    "var/lib/apt/lists/partial",
    "var/cache/apt/archives/partial",
    "var/log/apt",
    "var/lib/dpkg/updates",
    "var/lib/dpkg/info",
];

/// Directories merged into /usr.
const USR_MERGE_DIRS: &[&str] = &["bin", "sbin", "lib", "lib64"];

/// Character devices created by `makedev`: (name, major, minor, gid).
/// All are mode 0666 and owned by root; tty belongs to group 5.
const DEVICE_NODES: &[(&str, u64, u64, u32)] = &[
    ("full", 1, 7, 0),
    ("null", 1, 3, 0),
    ("random", 1, 8, 0),
    ("tty", 5, 0, 5),
    ("urandom", 1, 9, 0),
    ("zero", 1, 5, 0),
];

/// Symlinks created under /dev: (name, target).
const DEV_SYMLINKS: &[(&str, &str)] = &[
    ("fd", "/proc/self/fd"),
    ("stderr", "fd/2"),
    ("stdin", "fd/0"),
    ("stdout", "fd/1"),
];

/// Where the keyring blob is installed inside the target.
const KEYRING_DEST: &str = "etc/apt/trusted.gpg.d/apt-bootstrap.gpg";

/// Policy layer script that tells maintainer scripts not to start services.
const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";
const POLICY_RC_D_BODY: &str = "#!/bin/sh\nexit 101\n";

/// Saved-aside suffix for the real start-stop-daemon.
const DIVERT_SUFFIX: &str = ".REAL";

/// Manages the target directory for one bootstrap.
pub struct ChrootEnv {
    target: PathBuf,
    /// LIFO of mount points created by this process
    mounts: Vec<PathBuf>,
    /// Keyring copy to remove when the bootstrap ends
    keyring_copy: Option<PathBuf>,
}

impl ChrootEnv {
    /// Create the environment, making the target directory if needed.
    pub fn new(target: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(target.as_ref())?;
        let target = fs::canonicalize(target.as_ref())?;
        Ok(Self {
            target,
            mounts: Vec::new(),
            keyring_copy: None,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Create the base layout: apt/dpkg directories, sources.list, the
    /// status and available files, and the keyring copy.
    ///
    /// Safe to call on an already-prepared target; existing files are left
    /// untouched.
    pub fn skeleton(&mut self, config: &BootstrapConfig) -> Result<()> {
        for dir in SKELETON_DIRS {
            fs::create_dir_all(self.target.join(dir))?;
        }

        let sources = self.target.join("etc/apt/sources.list");
        if !sources.exists() {
            fs::write(&sources, config.sources_list_line())?;
        }

        StatusDb::new(&self.target).ensure_files()?;

        match config.keyring {
            Some(ref keyring) => self.install_keyring(keyring)?,
            None => warn!("no keyring configured; archive fetches are unauthenticated"),
        }
        Ok(())
    }

    /// Point /bin, /sbin, /lib, /lib64 at their usr/ counterparts, and
    /// mirror the merge under usr/lib/debug.
    pub fn usrmerge(&self) -> Result<()> {
        for dir in USR_MERGE_DIRS {
            fs::create_dir_all(self.target.join("usr").join(dir))?;
            ensure_merge_symlink(&self.target.join(dir), &format!("usr/{dir}"))?;
        }
        let debug_root = self.target.join("usr/lib/debug");
        fs::create_dir_all(&debug_root)?;
        for dir in USR_MERGE_DIRS {
            ensure_merge_symlink(&debug_root.join(dir), &format!("usr/{dir}"))?;
        }
        Ok(())
    }

    /// Populate /dev with the nodes a chrooted installer needs.
    ///
    /// When the kernel denies a ptmx node, falls back to a symlink into
    /// devpts and warns that the caller must mount it with ptmxmode=666.
    pub fn makedev(&self) -> Result<()> {
        let dev = self.target.join("dev");
        fs::create_dir_all(&dev)?;

        for (name, major, minor, gid) in DEVICE_NODES {
            let path = dev.join(name);
            if path.symlink_metadata().is_ok() {
                continue;
            }
            mknod(
                &path,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(0o666),
                makedev(*major, *minor),
            )
            .map_err(|e| device_error(&path, e))?;
            chown(&path, Some(Uid::from_raw(0)), Some(Gid::from_raw(*gid)))
                .map_err(|e| device_error(&path, e))?;
        }

        for (name, link_target) in DEV_SYMLINKS {
            let path = dev.join(name);
            if path.symlink_metadata().is_err() {
                symlink(link_target, &path)?;
            }
        }

        fs::create_dir_all(dev.join("shm"))?;
        fs::create_dir_all(dev.join("pts"))?;

        let ptmx = dev.join("ptmx");
        if ptmx.symlink_metadata().is_err() {
            match mknod(
                &ptmx,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(0o666),
                makedev(5, 2),
            ) {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        "mknod dev/ptmx failed ({e}); linking to pts/ptmx instead, \
                         mount devpts with ptmxmode=666"
                    );
                    symlink("pts/ptmx", &ptmx)?;
                }
            }
        }
        Ok(())
    }

    /// Mount a kernel filesystem at `rel` inside the target.
    ///
    /// An already-mounted target is a warning, not an error, and is not
    /// pushed onto the stack.
    pub fn mount(&mut self, fstype: &str, source: &str, rel: &str) -> Result<()> {
        let point = self.target.join(rel);
        fs::create_dir_all(&point)?;
        if is_mounted(&point) {
            warn!("{} is already mounted, leaving it alone", point.display());
            return Ok(());
        }
        mount(
            Some(source),
            &point,
            Some(fstype),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| Error::MountFailed {
            op: format!("mount {fstype} at"),
            target: point.clone(),
            source: e,
        })?;
        debug!("mounted {} at {}", fstype, point.display());
        self.mounts.push(point);
        Ok(())
    }

    /// Bind-mount a host path at `rel` inside the target.
    pub fn bind_mount(&mut self, source: &Path, rel: &str) -> Result<()> {
        let point = self.target.join(rel);
        fs::create_dir_all(&point)?;
        if is_mounted(&point) {
            warn!("{} is already mounted, leaving it alone", point.display());
            return Ok(());
        }
        mount(
            Some(source),
            &point,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| Error::MountFailed {
            op: format!("bind {} at", source.display()),
            target: point.clone(),
            source: e,
        })?;
        debug!("bind-mounted {} at {}", source.display(), point.display());
        self.mounts.push(point);
        Ok(())
    }

    /// Unmount `rel` and drop it from the stack.
    pub fn umount(&mut self, rel: &str) -> Result<()> {
        let point = self.target.join(rel);
        let Some(index) = self.mounts.iter().rposition(|m| *m == point) else {
            debug!("{} is not on the mount stack", point.display());
            return Ok(());
        };
        umount(&point).map_err(|e| Error::MountFailed {
            op: "umount".to_string(),
            target: point.clone(),
            source: e,
        })?;
        debug!("unmounted {}", point.display());
        self.mounts.remove(index);
        Ok(())
    }

    /// Drain the mount stack in LIFO order.
    ///
    /// Used on shutdown and from the drop guard; failures are logged and
    /// draining continues so one stuck mount cannot leave others behind.
    pub fn umount_all(&mut self) {
        while let Some(point) = self.mounts.pop() {
            match umount(&point) {
                Ok(()) => debug!("unmounted {}", point.display()),
                Err(e) => warn!("failed to unmount {}: {}", point.display(), e),
            }
        }
    }

    pub fn mount_stack_len(&self) -> usize {
        self.mounts.len()
    }

    /// Divert start-stop-daemon to /bin/true and install policy-rc.d so
    /// maintainer scripts cannot start services during configuration.
    pub fn suppress_daemons(&self) -> Result<()> {
        let daemon = self.target.join("sbin/start-stop-daemon");
        if daemon.symlink_metadata().is_ok() {
            let saved = saved_daemon_path(&daemon);
            if saved.symlink_metadata().is_err() {
                fs::rename(&daemon, &saved)?;
                symlink("/bin/true", &daemon)?;
                debug!("diverted {}", daemon.display());
            }
        }

        let policy = self.target.join(POLICY_RC_D);
        if let Some(parent) = policy.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&policy, POLICY_RC_D_BODY)?;
        fs::set_permissions(&policy, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    /// Undo `suppress_daemons`. Also used to heal state left behind by an
    /// aborted earlier run.
    pub fn restore_daemons(&self) -> Result<()> {
        let daemon = self.target.join("sbin/start-stop-daemon");
        let saved = saved_daemon_path(&daemon);
        if saved.symlink_metadata().is_ok() {
            if daemon.symlink_metadata().is_ok() {
                fs::remove_file(&daemon)?;
            }
            fs::rename(&saved, &daemon)?;
            debug!("restored {}", daemon.display());
        }

        let policy = self.target.join(POLICY_RC_D);
        if policy.symlink_metadata().is_ok() {
            fs::remove_file(&policy)?;
            debug!("removed {}", policy.display());
        }
        Ok(())
    }

    /// Detect and repair daemon-suppression state from an aborted run
    /// before doing anything else to the target.
    pub fn heal(&self) -> Result<()> {
        let saved = saved_daemon_path(&self.target.join("sbin/start-stop-daemon"));
        let policy = self.target.join(POLICY_RC_D);
        if saved.symlink_metadata().is_ok() || policy.symlink_metadata().is_ok() {
            info!("healing daemon-suppression state left by an earlier run");
            self.restore_daemons()?;
        }
        Ok(())
    }

    /// Copy the keyring blob into the target.
    pub fn install_keyring(&mut self, keyring: &Path) -> Result<()> {
        let dest = self.target.join(KEYRING_DEST);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(keyring, &dest)?;
        debug!("installed keyring at {}", dest.display());
        self.keyring_copy = Some(dest);
        Ok(())
    }

    /// Remove the keyring copy installed by `install_keyring`.
    pub fn remove_keyring(&mut self) -> Result<()> {
        if let Some(keyring) = self.keyring_copy.take() {
            if keyring.exists() {
                fs::remove_file(&keyring)?;
                debug!("removed temporary keyring {}", keyring.display());
            }
        }
        Ok(())
    }

    /// Run a command inside the target via chroot.
    pub fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        run_in_chroot(&self.target, program, args)
    }
}

impl Drop for ChrootEnv {
    fn drop(&mut self) {
        self.umount_all();
        if let Err(e) = self.remove_keyring() {
            warn!("failed to remove temporary keyring: {e}");
        }
    }
}

/// Run `program` under chroot with the bootstrap environment.
///
/// Children always see LC_ALL=C and DEBIAN_FRONTEND=noninteractive; stdin
/// is closed so debconf cannot hang waiting for answers.
pub fn run_in_chroot(target: &Path, program: &str, args: &[&str]) -> Result<()> {
    let rendered = format!("chroot {} {} {}", target.display(), program, args.join(" "));
    debug!("running {rendered}");

    let status = Command::new("chroot")
        .arg(target)
        .arg(program)
        .args(args)
        .env("LC_ALL", "C")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .stdin(Stdio::null())
        .status()?;

    if !status.success() {
        return Err(Error::InstallerFailed {
            command: rendered,
            status: status.to_string(),
        });
    }
    Ok(())
}

/// Ensure `path` is a symlink with exactly `link_target` as its text.
fn ensure_merge_symlink(path: &Path, link_target: &str) -> Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.file_type().is_symlink() => Ok(()),
        Ok(_) => Err(Error::UsrMergeConflict(path.to_path_buf())),
        Err(_) => {
            symlink(link_target, path)?;
            Ok(())
        }
    }
}

fn saved_daemon_path(daemon: &Path) -> PathBuf {
    let mut name = daemon
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(DIVERT_SUFFIX);
    daemon.with_file_name(name)
}

fn device_error(path: &Path, errno: nix::Error) -> Error {
    match errno {
        nix::Error::EPERM | nix::Error::EACCES => {
            Error::PermissionDenied(format!("creating device node {}", path.display()))
        }
        e => Error::Io(std::io::Error::from_raw_os_error(e as i32)),
    }
}

/// Check /proc/self/mounts for `point`.
fn is_mounted(point: &Path) -> bool {
    let resolved = fs::canonicalize(point).unwrap_or_else(|_| point.to_path_buf());
    let Ok(mounts) = fs::read_to_string("/proc/self/mounts") else {
        return false;
    };
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_point)
        .any(|m| Path::new(&m) == resolved)
}

/// Undo the octal escapes (\040 and friends) in /proc/self/mounts fields.
fn unescape_mount_point(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let (Some(&a), Some(&b), Some(&c)) =
                (bytes.get(i + 1), bytes.get(i + 2), bytes.get(i + 3))
            {
                if a.is_ascii_digit() && b.is_ascii_digit() && c.is_ascii_digit() {
                    out.push((a - b'0') * 64 + (b - b'0') * 8 + (c - b'0'));
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(target: &Path) -> BootstrapConfig {
        let mut config = BootstrapConfig::new("xenial", target);
        config.keyring = None;
        config
    }

    #[test]
    fn test_skeleton_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = ChrootEnv::new(dir.path()).unwrap();
        env.skeleton(&test_config(dir.path())).unwrap();

        for path in SKELETON_DIRS {
            assert!(env.target().join(path).is_dir(), "{path} missing");
        }
        assert!(env.target().join("var/lib/dpkg/status").is_file());
        assert!(env.target().join("var/lib/dpkg/available").is_file());

        let sources = fs::read_to_string(env.target().join("etc/apt/sources.list")).unwrap();
        assert_eq!(sources, "deb http://archive.ubuntu.com/ubuntu xenial main\n");
        assert_eq!(sources.lines().count(), 1);
    }

    #[test]
    fn test_skeleton_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = ChrootEnv::new(dir.path()).unwrap();
        let config = test_config(dir.path());

        env.skeleton(&config).unwrap();
        fs::write(env.target().join("var/lib/dpkg/status"), "Package: x\n").unwrap();
        env.skeleton(&config).unwrap();

        // A second run must not clobber existing files.
        let status = fs::read_to_string(env.target().join("var/lib/dpkg/status")).unwrap();
        assert_eq!(status, "Package: x\n");
    }

    #[test]
    fn test_usrmerge_creates_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let env = ChrootEnv::new(dir.path()).unwrap();
        env.usrmerge().unwrap();
        env.usrmerge().unwrap(); // idempotent

        for d in USR_MERGE_DIRS {
            let link = env.target().join(d);
            assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
            assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from(format!("usr/{d}")));

            let debug_link = env.target().join("usr/lib/debug").join(d);
            assert_eq!(
                fs::read_link(&debug_link).unwrap(),
                PathBuf::from(format!("usr/{d}"))
            );
        }
    }

    #[test]
    fn test_usrmerge_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let env = ChrootEnv::new(dir.path()).unwrap();
        fs::create_dir(env.target().join("bin")).unwrap();

        let result = env.usrmerge();
        assert!(matches!(result, Err(Error::UsrMergeConflict(_))));
        assert_eq!(env.mount_stack_len(), 0);
    }

    #[test]
    fn test_daemon_suppression_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let env = ChrootEnv::new(dir.path()).unwrap();
        env.usrmerge().unwrap();

        let daemon = env.target().join("usr/sbin/start-stop-daemon");
        fs::write(&daemon, b"#!/bin/sh\n# the real one\n").unwrap();

        env.suppress_daemons().unwrap();
        let via_sbin = env.target().join("sbin/start-stop-daemon");
        assert!(via_sbin.symlink_metadata().unwrap().file_type().is_symlink());
        assert!(env
            .target()
            .join("usr/sbin/start-stop-daemon.REAL")
            .is_file());

        let policy = env.target().join(POLICY_RC_D);
        let body = fs::read_to_string(&policy).unwrap();
        assert_eq!(body, POLICY_RC_D_BODY);
        assert_eq!(
            fs::metadata(&policy).unwrap().permissions().mode() & 0o7777,
            0o755
        );

        env.restore_daemons().unwrap();
        assert!(!policy.exists());
        assert!(!env.target().join("usr/sbin/start-stop-daemon.REAL").exists());
        let restored = fs::read(&daemon).unwrap();
        assert_eq!(restored, b"#!/bin/sh\n# the real one\n");
    }

    #[test]
    fn test_heal_removes_stale_policy() {
        let dir = tempfile::tempdir().unwrap();
        let env = ChrootEnv::new(dir.path()).unwrap();

        // Simulate an aborted run that left policy-rc.d behind.
        let policy = env.target().join(POLICY_RC_D);
        fs::create_dir_all(policy.parent().unwrap()).unwrap();
        fs::write(&policy, POLICY_RC_D_BODY).unwrap();

        env.heal().unwrap();
        assert!(!policy.exists());
    }

    #[test]
    fn test_heal_restores_saved_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let env = ChrootEnv::new(dir.path()).unwrap();
        env.usrmerge().unwrap();

        let daemon = env.target().join("usr/sbin/start-stop-daemon");
        fs::write(daemon.with_file_name("start-stop-daemon.REAL"), b"real").unwrap();
        symlink("/bin/true", &daemon).unwrap();

        env.heal().unwrap();
        assert!(!daemon.with_file_name("start-stop-daemon.REAL").exists());
        assert_eq!(fs::read(&daemon).unwrap(), b"real");
    }

    #[test]
    fn test_keyring_install_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("archive.gpg");
        fs::write(&blob, b"\x99\x01keyring-bytes").unwrap();

        let target = dir.path().join("root");
        let mut env = ChrootEnv::new(&target).unwrap();
        env.install_keyring(&blob).unwrap();

        let dest = env.target().join(KEYRING_DEST);
        assert_eq!(fs::read(&dest).unwrap(), b"\x99\x01keyring-bytes");

        env.remove_keyring().unwrap();
        assert!(!dest.exists());
    }

    #[test]
    fn test_drop_removes_keyring() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("archive.gpg");
        fs::write(&blob, b"key").unwrap();

        let target = dir.path().join("root");
        let dest;
        {
            let mut env = ChrootEnv::new(&target).unwrap();
            env.install_keyring(&blob).unwrap();
            dest = env.target().join(KEYRING_DEST);
            assert!(dest.exists());
        }
        assert!(!dest.exists());
    }

    #[test]
    fn test_unescape_mount_point() {
        assert_eq!(unescape_mount_point("/mnt/with\\040space"), "/mnt/with space");
        assert_eq!(unescape_mount_point("/plain"), "/plain");
    }

    #[test]
    fn test_umount_unknown_path_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = ChrootEnv::new(dir.path()).unwrap();
        env.umount("proc").unwrap();
        assert_eq!(env.mount_stack_len(), 0);
    }
}

// src/deb/extract.rs

//! Member materialization
//!
//! Writes one archive member into the target tree, preserving mode, owner,
//! timestamps, and device/link semantics. Paths that would land outside the
//! target root are rejected before anything touches the filesystem.

use super::reader::{ArchiveMember, MemberKind};
use crate::error::{Error, Result};
use nix::sys::stat::{makedev, mknod, utimensat, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Materialize `member` under `root`.
///
/// Parent directories are created on demand with default permissions; only
/// entries the archive names explicitly get their mode and owner applied.
pub fn extract_member(root: &Path, member: &ArchiveMember, data: &[u8]) -> Result<()> {
    let dest = join_under_root(root, &member.name)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    trace!("extracting {} -> {}", member.name, dest.display());

    match member.kind {
        MemberKind::File => {
            write_atomic(&dest, data)?;
            apply_metadata(&dest, member)?;
        }
        MemberKind::Directory => {
            if !dest.is_dir() {
                fs::create_dir_all(&dest)?;
            }
            apply_metadata(&dest, member)?;
        }
        MemberKind::Symlink => {
            let target = link_target(member)?;
            if dest.symlink_metadata().is_ok() {
                fs::remove_file(&dest)?;
            }
            symlink(target, &dest)?;
            // Only the ownership is applied; the link's own mode and times
            // are left to the kernel (lchmod/lutimes are not portable).
            chown_no_follow(&dest, member.uid, member.gid)?;
        }
        MemberKind::Hardlink => {
            let target = link_target(member)?;
            let source = join_under_root(root, &target.to_string_lossy())?;
            if dest.symlink_metadata().is_ok() {
                fs::remove_file(&dest)?;
            }
            fs::hard_link(&source, &dest)?;
        }
        MemberKind::CharDevice | MemberKind::BlockDevice => {
            let kind = if member.kind == MemberKind::CharDevice {
                SFlag::S_IFCHR
            } else {
                SFlag::S_IFBLK
            };
            make_node(&dest, kind, member.mode, makedev(member.major, member.minor))?;
            apply_metadata(&dest, member)?;
        }
        MemberKind::Fifo => {
            make_node(&dest, SFlag::S_IFIFO, member.mode, 0)?;
            apply_metadata(&dest, member)?;
        }
    }
    Ok(())
}

fn link_target(member: &ArchiveMember) -> Result<&Path> {
    member.link_target.as_deref().ok_or_else(|| Error::UnsupportedMember {
        name: member.name.clone(),
        kind: "link without target".to_string(),
    })
}

/// Join a member name onto the root, rejecting absolute names and any `..`
/// component.
pub fn join_under_root(root: &Path, name: &str) -> Result<PathBuf> {
    let mut joined = root.to_path_buf();
    let mut pushed = 0usize;
    for component in Path::new(name).components() {
        match component {
            Component::Normal(c) => {
                joined.push(c);
                pushed += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathEscape(name.to_string()));
            }
        }
    }
    if pushed == 0 {
        return Err(Error::PathEscape(name.to_string()));
    }
    Ok(joined)
}

/// Write file contents through a temp file and rename into place.
fn write_atomic(dest: &Path, data: &[u8]) -> Result<()> {
    let temp = dest.with_extension("debstrap-tmp");
    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&temp, dest)?;
    Ok(())
}

/// chmod + chown + mtime for everything but symlinks.
fn apply_metadata(path: &Path, member: &ArchiveMember) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(member.mode))?;
    chown_no_follow(path, member.uid, member.gid)?;
    let ts = TimeSpec::new(member.mtime as i64, 0);
    utimensat(None, path, &ts, &ts, UtimensatFlags::FollowSymlink)
        .map_err(|e| nix_error("utimensat", path, e))?;
    Ok(())
}

fn chown_no_follow(path: &Path, uid: u64, gid: u64) -> Result<()> {
    fchownat(
        None,
        path,
        Some(Uid::from_raw(uid as u32)),
        Some(Gid::from_raw(gid as u32)),
        FchownatFlags::NoFollowSymlink,
    )
    .map_err(|e| nix_error("chown", path, e))
}

fn make_node(path: &Path, kind: SFlag, mode: u32, dev: u64) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path)?;
    }
    mknod(path, kind, Mode::from_bits_truncate(mode), dev)
        .map_err(|e| nix_error("mknod", path, e))
}

fn nix_error(op: &str, path: &Path, errno: nix::Error) -> Error {
    match errno {
        nix::Error::EPERM | nix::Error::EACCES => {
            Error::PermissionDenied(format!("{op} {}", path.display()))
        }
        e => Error::Io(std::io::Error::from_raw_os_error(e as i32)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getgid, getuid};
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    fn member(name: &str, kind: MemberKind) -> ArchiveMember {
        ArchiveMember {
            name: name.to_string(),
            size: 0,
            mode: 0o644,
            uid: getuid().as_raw() as u64,
            gid: getgid().as_raw() as u64,
            mtime: 1600000000,
            kind,
            link_target: None,
            major: 0,
            minor: 0,
        }
    }

    #[test]
    fn test_extract_file_preserves_metadata() {
        let root = tempfile::tempdir().unwrap();
        let mut m = member("etc/hostname", MemberKind::File);
        m.mode = 0o640;
        m.size = 5;

        extract_member(root.path(), &m, b"host\n").unwrap();

        let dest = root.path().join("etc/hostname");
        let meta = fs::metadata(&dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"host\n");
        assert_eq!(meta.mode() & 0o7777, 0o640);
        assert_eq!(meta.mtime(), 1600000000);
    }

    #[test]
    fn test_extract_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut m = member("var/log/apt", MemberKind::Directory);
        m.mode = 0o750;

        extract_member(root.path(), &m, b"").unwrap();
        // Re-extraction over the existing directory must not fail.
        extract_member(root.path(), &m, b"").unwrap();

        let meta = fs::metadata(root.path().join("var/log/apt")).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.mode() & 0o7777, 0o750);
    }

    #[test]
    fn test_extract_symlink_verbatim_target() {
        let root = tempfile::tempdir().unwrap();
        let mut m = member("usr/bin/awk", MemberKind::Symlink);
        m.link_target = Some(PathBuf::from("mawk"));

        extract_member(root.path(), &m, b"").unwrap();

        let dest = root.path().join("usr/bin/awk");
        let link = fs::read_link(&dest).unwrap();
        // The referent does not exist; the link text is preserved verbatim.
        assert_eq!(link, PathBuf::from("mawk"));
        assert!(dest.symlink_metadata().unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_extract_hardlink() {
        let root = tempfile::tempdir().unwrap();
        let mut original = member("bin/gzip", MemberKind::File);
        original.size = 4;
        extract_member(root.path(), &original, b"ELF\0").unwrap();

        let mut link = member("bin/gunzip", MemberKind::Hardlink);
        link.link_target = Some(PathBuf::from("./bin/gzip"));
        extract_member(root.path(), &link, b"").unwrap();

        let a = fs::metadata(root.path().join("bin/gzip")).unwrap();
        let b = fs::metadata(root.path().join("bin/gunzip")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn test_extract_fifo() {
        let root = tempfile::tempdir().unwrap();
        let mut m = member("run/initctl", MemberKind::Fifo);
        m.mode = 0o600;

        extract_member(root.path(), &m, b"").unwrap();

        let meta = fs::metadata(root.path().join("run/initctl")).unwrap();
        assert!(meta.file_type().is_fifo());
        assert_eq!(meta.mode() & 0o7777, 0o600);
    }

    #[test]
    fn test_extract_char_device_requires_root() {
        let root = tempfile::tempdir().unwrap();
        let mut m = member("dev/null", MemberKind::CharDevice);
        m.mode = 0o666;
        m.uid = 0;
        m.gid = 0;
        m.major = 1;
        m.minor = 3;

        let result = extract_member(root.path(), &m, b"");
        if getuid().is_root() {
            result.unwrap();
            let meta = fs::metadata(root.path().join("dev/null")).unwrap();
            assert!(meta.file_type().is_char_device());
            assert_eq!(meta.rdev(), makedev(1, 3));
            assert_eq!(meta.mode() & 0o7777, 0o666);
        } else {
            assert!(matches!(result, Err(Error::PermissionDenied(_))));
        }
    }

    #[test]
    fn test_path_escape_rejected() {
        let root = tempfile::tempdir().unwrap();
        for name in ["../evil", "usr/../../evil", "/etc/passwd", ".."] {
            let m = member(name, MemberKind::File);
            assert!(
                matches!(extract_member(root.path(), &m, b""), Err(Error::PathEscape(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_join_under_root_normalizes_curdir() {
        let joined = join_under_root(Path::new("/t"), "./usr/bin/dpkg").unwrap();
        assert_eq!(joined, PathBuf::from("/t/usr/bin/dpkg"));
    }
}

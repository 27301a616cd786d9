// tests/bootstrap.rs

//! Integration tests driving the library pieces together: stage-1
//! extraction against synthetic archives, the dry-run path, and the
//! cleanup guarantees around a failing stage 2.

mod common;

use common::{build_deb, package, DebEntry, FakeIndex};
use debstrap::chroot::ChrootEnv;
use debstrap::deb::{extract_member, DebReader};
use debstrap::{BootstrapConfig, Bootstrapper, StatusDb};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

fn test_config(target: &Path) -> BootstrapConfig {
    let mut config = BootstrapConfig::new("xenial", target);
    config.keyring = None;
    config
}

fn is_mount_point(path: &Path) -> bool {
    let Ok(mounts) = fs::read_to_string("/proc/self/mounts") else {
        return false;
    };
    let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|point| Path::new(point) == resolved)
}

#[test]
fn stage_one_extraction_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("root");

    let mut env = ChrootEnv::new(&target).unwrap();
    env.skeleton(&test_config(&target)).unwrap();
    env.usrmerge().unwrap();

    let deb_path = dir.path().join("dpkg_1.18.4_amd64.deb");
    build_deb(
        &deb_path,
        &[
            DebEntry::Dir("usr/bin", 0o755),
            DebEntry::File("usr/bin/dpkg", b"#!/bin/sh\nexit 0\n", 0o755),
            DebEntry::File("etc/dpkg/dpkg.cfg", b"# dpkg configuration\n", 0o644),
            DebEntry::Symlink("usr/bin/dpkg-statoverride", "dpkg"),
        ],
    );

    let reader = DebReader::open(&deb_path).unwrap();
    let mut members = Vec::new();
    reader
        .each_member(|member, data| {
            members.push(member.clone());
            extract_member(env.target(), member, data)
        })
        .unwrap();

    // Re-reading the tree yields the metadata the archive declared.
    for member in &members {
        let extracted = env.target().join(&member.name);
        let meta = extracted.symlink_metadata().unwrap();
        if meta.file_type().is_symlink() {
            assert_eq!(
                fs::read_link(&extracted).unwrap().as_os_str(),
                member.link_target.as_ref().unwrap().as_os_str()
            );
        } else {
            assert_eq!(meta.mode() & 0o7777, member.mode, "{}", member.name);
            assert_eq!(u64::from(meta.uid()), member.uid);
            assert_eq!(u64::from(meta.gid()), member.gid);
            assert_eq!(meta.mtime() as u64, member.mtime);
        }
    }

    assert_eq!(
        fs::read(env.target().join("usr/bin/dpkg")).unwrap(),
        b"#!/bin/sh\nexit 0\n"
    );

    // The usr merge makes the same file visible through /bin paths.
    assert!(env.target().join("bin").symlink_metadata().unwrap().file_type().is_symlink());

    let db = StatusDb::new(env.target());
    db.fake_install("dpkg", "1.18.4").unwrap();
    let status = fs::read_to_string(env.target().join("var/lib/dpkg/status")).unwrap();
    assert_eq!(status.matches("Package:").count(), 1);
    assert!(status.contains("Package: dpkg\n"));
}

#[test]
fn dry_run_reports_and_leaves_target_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("root");

    let mut config = test_config(&target);
    config.dry_run = true;
    config.packages = vec!["extra-tool".to_string()];

    let packages = vec![
        package("base-files", "9.4ubuntu4", true),
        package("dpkg", "1.18.4ubuntu1", true),
        package("extra-tool", "2.0-1", false),
    ];
    let index = FakeIndex::new(packages, dir.path());

    let mut bootstrapper = Bootstrapper::with_index(config, Box::new(index)).unwrap();
    bootstrapper.run().unwrap();

    // Dry run resolves only: no skeleton, no mounts, no daemon suppression.
    assert!(!target.join("etc/apt/sources.list").exists());
    assert!(!target.join("usr/sbin/policy-rc.d").exists());
    assert!(!is_mount_point(&target.join("proc")));
}

#[test]
fn usrmerge_conflict_aborts_before_any_mount() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("root");
    fs::create_dir_all(target.join("bin")).unwrap();

    let index = FakeIndex::new(vec![package("dpkg", "1.18", true)], dir.path());
    let mut bootstrapper =
        Bootstrapper::with_index(test_config(&target), Box::new(index)).unwrap();

    let result = bootstrapper.run();
    assert!(matches!(result, Err(debstrap::Error::UsrMergeConflict(_))));
    assert!(!is_mount_point(&target.join("proc")));
    assert!(!is_mount_point(&target.join("sys")));
}

#[test]
fn failed_stage_two_cleans_up_mounts_and_policy() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("root");
    let cache = dir.path().join("cache");
    fs::create_dir_all(&cache).unwrap();

    // Two essential packages with real archives; the target still has no
    // ldconfig, so stage 2 preparation fails inside the chroot (or earlier,
    // unprivileged, at device-node creation).
    let packages = vec![
        package("base-files", "9.4", true),
        package("dpkg", "1.18", true),
    ];
    build_deb(
        &cache.join("base-files_9.4_amd64.deb"),
        &[
            DebEntry::Dir("etc", 0o755),
            DebEntry::File("etc/debian_version", b"stretch/sid\n", 0o644),
        ],
    );
    build_deb(
        &cache.join("dpkg_1.18_amd64.deb"),
        &[
            DebEntry::Dir("usr/bin", 0o755),
            DebEntry::File("usr/bin/dpkg", b"#!/bin/sh\nexit 0\n", 0o755),
        ],
    );

    let mut config = test_config(&target);
    config.cache_dir = Some(cache.clone());
    let index = FakeIndex::new(packages, &cache);

    let mut bootstrapper = Bootstrapper::with_index(config, Box::new(index)).unwrap();
    let result = bootstrapper.run();
    assert!(result.is_err(), "stage 2 cannot succeed in this fixture");

    // Stage 1 ran: the tree is populated and dpkg is fake-installed.
    assert!(target.join("etc/debian_version").is_file());
    let installed = StatusDb::new(&target).installed().unwrap();
    assert_eq!(installed.get("dpkg").map(String::as_str), Some("1.18"));

    // Cleanup ran: nothing is left mounted and no policy layer remains.
    assert!(!is_mount_point(&target.join("proc")));
    assert!(!is_mount_point(&target.join("sys")));
    assert!(!is_mount_point(&target.join("tmp")));
    assert!(!target.join("usr/sbin/policy-rc.d").exists());
}

// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("debstrap")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Bootstrap a Debian or Ubuntu root filesystem from a package archive")
        .arg(Arg::new("suite").required(true).help("Distribution suite (e.g. xenial, bookworm)"))
        .arg(Arg::new("target").required(true).help("Directory to bootstrap into"))
        .arg(Arg::new("mirror").help("Archive mirror URL"))
        .arg(
            Arg::new("dry_run")
                .short('n')
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Resolve and print the package set without installing"),
        )
        .arg(
            Arg::new("arch")
                .short('a')
                .long("arch")
                .help("Target architecture (defaults to the host architecture)"),
        )
        .arg(Arg::new("components").long("components").help("Archive components, comma separated"))
        .arg(Arg::new("packages").long("packages").help("Extra packages to install, comma separated"))
        .arg(Arg::new("keyring").long("keyring").help("Keyring file copied into the target"))
        .arg(
            Arg::new("no_required")
                .long("no-required")
                .action(ArgAction::SetTrue)
                .help("Exclude Priority: required packages"),
        )
        .arg(
            Arg::new("no_important")
                .long("no-important")
                .action(ArgAction::SetTrue)
                .help("Exclude Priority: important packages"),
        )
        .arg(
            Arg::new("no_recommends")
                .long("no-recommends")
                .action(ArgAction::SetTrue)
                .help("Ignore Recommends when resolving dependencies"),
        )
        .arg(Arg::new("cache_dir").long("cache-dir").help("Directory to cache downloaded .deb files in"))
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("More log output"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Full debug output, including chroot command lines"),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    if let Err(e) = fs::write(man_dir.join("debstrap.8"), buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}

// src/lib.rs

//! debstrap
//!
//! Two-stage Debian/Ubuntu root filesystem bootstrapper. Given a suite, a
//! target directory, and an archive mirror, it materializes a chroot tree
//! holding the essential, required, and important priority classes plus any
//! requested packages, configured by the target's own dpkg running under
//! chroot.
//!
//! # Architecture
//!
//! - Stage 1: the essential closure is fetched and extracted directly into
//!   the target, since no installer exists yet
//! - Stage 2: dpkg runs inside the chroot to install, unpack, and configure
//! - The archive is abstracted behind `PackageIndex`; the shipped
//!   implementation resolves against Debian-format Release/Packages files

pub mod bootstrap;
pub mod chroot;
pub mod compression;
pub mod config;
pub mod deb;
mod error;
pub mod fetch;
pub mod index;
pub mod progress;
pub mod status;

pub use bootstrap::Bootstrapper;
pub use config::BootstrapConfig;
pub use error::{Error, Result};
pub use index::{MultiArch, Package, PackageIndex, Priority, PriorityClass};
pub use status::StatusDb;

// src/deb/mod.rs

//! Debian binary package handling
//!
//! A .deb is an ar archive whose `data.tar.*` member holds the filesystem
//! payload. `reader` iterates that payload member by member; `extract`
//! materializes members under a target root.

pub mod extract;
pub mod reader;

pub use extract::extract_member;
pub use reader::{ArchiveMember, DebReader, MemberKind};

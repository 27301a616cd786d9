// src/deb/reader.rs

//! Streaming reader for .deb payloads
//!
//! Locates the `data.tar.*` member inside the ar container, decompresses it
//! transparently, and yields each tar entry together with its payload bytes.

use crate::compression::{self, Format};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::trace;

/// ar global header, present at the start of every .deb.
const AR_MAGIC: [u8; 8] = *b"!<arch>\n";

/// Filesystem entry kinds a .deb payload can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    File,
    Directory,
    Symlink,
    Hardlink,
    CharDevice,
    BlockDevice,
    Fifo,
}

/// One payload entry with full metadata.
///
/// `name` is relative to the target root, with no leading `/` or `./`.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    pub name: String,
    pub size: u64,
    /// Permission bits including setuid/setgid/sticky (12 bits)
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub kind: MemberKind,
    /// Target for symlinks and hardlinks
    pub link_target: Option<PathBuf>,
    pub major: u64,
    pub minor: u64,
}

/// Handle to an opened .deb archive.
pub struct DebReader {
    path: PathBuf,
}

impl DebReader {
    /// Open a .deb, verifying the ar container magic.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut magic = [0u8; 8];
        let mut file = File::open(&path)?;
        file.read_exact(&mut magic)
            .map_err(|e| Error::malformed(&path, format!("short read: {e}")))?;
        if magic != AR_MAGIC {
            return Err(Error::malformed(&path, "not an ar archive"));
        }
        Ok(Self { path })
    }

    /// Iterate the payload, calling `visitor` with each member and its bytes.
    ///
    /// Members are visited in archive order; a well-formed payload lists
    /// directories before their children.
    pub fn each_member<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&ArchiveMember, &[u8]) -> Result<()>,
    {
        let file = File::open(&self.path)?;
        let mut container = ar::Archive::new(file);

        while let Some(entry) = container.next_entry() {
            let entry =
                entry.map_err(|e| Error::malformed(&self.path, format!("bad ar member: {e}")))?;
            let ident = String::from_utf8_lossy(entry.header().identifier()).to_string();
            if !ident.starts_with("data.tar") {
                continue;
            }

            trace!("{}: payload member {}", self.path.display(), ident);
            let decoder = compression::decoder(entry, Format::from_name(&ident))
                .map_err(|e| Error::malformed(&self.path, format!("{ident}: {e}")))?;
            return self.walk_payload(decoder, &mut visitor);
        }

        Err(Error::malformed(&self.path, "no data.tar member"))
    }

    fn walk_payload<F>(&self, reader: Box<dyn Read + '_>, visitor: &mut F) -> Result<()>
    where
        F: FnMut(&ArchiveMember, &[u8]) -> Result<()>,
    {
        let mut payload = tar::Archive::new(reader);
        let entries = payload
            .entries()
            .map_err(|e| Error::malformed(&self.path, format!("bad tar payload: {e}")))?;

        for entry in entries {
            let mut entry =
                entry.map_err(|e| Error::malformed(&self.path, format!("bad tar entry: {e}")))?;
            let Some(member) = self.read_header(&entry)? else {
                continue;
            };

            let mut data = Vec::with_capacity(member.size as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| Error::malformed(&self.path, format!("{}: {e}", member.name)))?;
            if data.len() as u64 != member.size {
                return Err(Error::malformed(
                    &self.path,
                    format!(
                        "{}: payload is {} bytes, header declares {}",
                        member.name,
                        data.len(),
                        member.size
                    ),
                ));
            }

            visitor(&member, &data)?;
        }
        Ok(())
    }

    /// Decode one tar header into an `ArchiveMember`.
    ///
    /// Returns `None` for the payload's own root entry (`./`).
    fn read_header<R: Read>(&self, entry: &tar::Entry<'_, R>) -> Result<Option<ArchiveMember>> {
        let header = entry.header();

        let raw_path = entry
            .path()
            .map_err(|e| Error::malformed(&self.path, format!("bad member path: {e}")))?;
        let name = raw_path
            .to_string_lossy()
            .trim_start_matches("./")
            .trim_start_matches('/')
            .trim_end_matches('/')
            .to_string();
        if name.is_empty() || name == "." {
            return Ok(None);
        }

        let kind = match header.entry_type() {
            tar::EntryType::Regular => MemberKind::File,
            tar::EntryType::Directory => MemberKind::Directory,
            tar::EntryType::Symlink => MemberKind::Symlink,
            tar::EntryType::Link => MemberKind::Hardlink,
            tar::EntryType::Char => MemberKind::CharDevice,
            tar::EntryType::Block => MemberKind::BlockDevice,
            tar::EntryType::Fifo => MemberKind::Fifo,
            other => {
                return Err(Error::UnsupportedMember {
                    name,
                    kind: format!("{other:?}"),
                })
            }
        };

        let link_target = entry
            .link_name()
            .map_err(|e| Error::malformed(&self.path, format!("{name}: bad link name: {e}")))?
            .map(|t| t.into_owned());
        if matches!(kind, MemberKind::Symlink | MemberKind::Hardlink) && link_target.is_none() {
            return Err(Error::malformed(&self.path, format!("{name}: link without target")));
        }

        let mode = header
            .mode()
            .map_err(|e| Error::malformed(&self.path, format!("{name}: bad mode: {e}")))?
            & 0o7777;
        let size = if kind == MemberKind::File {
            header
                .size()
                .map_err(|e| Error::malformed(&self.path, format!("{name}: bad size: {e}")))?
        } else {
            0
        };

        Ok(Some(ArchiveMember {
            size,
            mode,
            uid: header
                .uid()
                .map_err(|e| Error::malformed(&self.path, format!("{name}: bad uid: {e}")))?,
            gid: header
                .gid()
                .map_err(|e| Error::malformed(&self.path, format!("{name}: bad gid: {e}")))?,
            mtime: header
                .mtime()
                .map_err(|e| Error::malformed(&self.path, format!("{name}: bad mtime: {e}")))?,
            kind,
            link_target,
            major: header
                .device_major()
                .unwrap_or(None)
                .map(u64::from)
                .unwrap_or(0),
            minor: header
                .device_minor()
                .unwrap_or(None)
                .map(u64::from)
                .unwrap_or(0),
            name,
        }))
    }
}

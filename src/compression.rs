// src/compression.rs

//! Decompression for archive payloads and index files
//!
//! Debian binary packages carry their payload as `data.tar.gz`,
//! `data.tar.xz`, or `data.tar.zst`; apt indices are served as `.xz` or
//! `.gz`. This module detects the format (by name or by magic bytes) and
//! hands back a streaming decoder.

use std::io::{self, Read};

/// Compression formats a .deb payload or apt index can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Uncompressed
    Plain,
    Gzip,
    Xz,
    Zstd,
}

impl Format {
    /// Detect the format from a file or member name.
    pub fn from_name(name: &str) -> Self {
        if name.ends_with(".gz") {
            Self::Gzip
        } else if name.ends_with(".xz") {
            Self::Xz
        } else if name.ends_with(".zst") {
            Self::Zstd
        } else {
            Self::Plain
        }
    }

    /// Detect the format from leading magic bytes.
    pub fn from_magic(data: &[u8]) -> Self {
        if data.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if data.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Self::Xz
        } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else {
            Self::Plain
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Wrap `reader` in a decoder for `format`.
pub fn decoder<'a, R: Read + 'a>(reader: R, format: Format) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match format {
        Format::Plain => Box::new(reader),
        Format::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        Format::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
        Format::Zstd => Box::new(zstd::Decoder::new(reader)?),
    })
}

/// Decompress a byte slice, detecting the format from its magic bytes.
pub fn decompress_auto(data: &[u8]) -> io::Result<Vec<u8>> {
    let format = Format::from_magic(data);
    let mut out = Vec::new();
    decoder(data, format)?.read_to_end(&mut out)?;
    Ok(out)
}

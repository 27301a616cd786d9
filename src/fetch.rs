// src/fetch.rs

//! HTTP fetch layer
//!
//! Blocking reqwest client with bounded retries, temp-file + atomic-rename
//! downloads, and SHA256 verification. The bootstrap core treats network
//! behavior (including retries) as this layer's business.

use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Request timeout for metadata and archive fetches.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts per download before giving up.
const MAX_RETRIES: u32 = 3;

/// Base delay between retries; grows linearly with the attempt number.
const RETRY_DELAY_MS: u64 = 1000;

/// Chunk size for streaming downloads.
const STREAM_BUFFER_SIZE: usize = 8192;

/// HTTP client used for index and archive downloads.
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::FetchFailed(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Fetch a URL into memory. No retries: a missing index variant is an
    /// expected outcome the caller falls back from.
    pub fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        debug!("fetching {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::FetchFailed(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::FetchFailed(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|e| Error::FetchFailed(format!("{url}: {e}")))?;
        Ok(bytes.to_vec())
    }

    /// Download a URL to `dest`, streaming through a temp file and renaming
    /// into place. Retries transport errors with linear backoff.
    pub fn download_file(
        &self,
        url: &str,
        dest: &Path,
        progress: &dyn ProgressTracker,
    ) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_download(url, dest, progress) {
                Ok(size) => return Ok(size),
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        return Err(e);
                    }
                    warn!("download attempt {} for {} failed: {}", attempt, url, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    fn try_download(
        &self,
        url: &str,
        dest: &Path,
        progress: &dyn ProgressTracker,
    ) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::FetchFailed(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::FetchFailed(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }

        progress.set_length(response.content_length().unwrap_or(0));
        progress.set_position(0);

        let temp = dest.with_extension("partial");
        let mut file = File::create(&temp)?;
        let mut buffer = [0u8; STREAM_BUFFER_SIZE];
        let mut downloaded: u64 = 0;
        loop {
            let n = response
                .read(&mut buffer)
                .map_err(|e| Error::FetchFailed(format!("read from {url}: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])?;
            downloaded += n as u64;
            progress.set_position(downloaded);
        }
        file.sync_all()?;
        fs::rename(&temp, dest)?;

        debug!("downloaded {} ({} bytes)", dest.display(), downloaded);
        Ok(downloaded)
    }
}

/// Hex SHA256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex SHA256 of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Verify a file against an expected hex digest.
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual != expected {
        return Err(Error::ChecksumMismatch {
            name: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

// src/progress.rs

//! Progress reporting for downloads and installs
//!
//! The bootstrap engine reports progress through the `ProgressTracker`
//! trait so the CLI can show bars (indicatif) while library consumers and
//! tests stay quiet or log.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Minimal progress interface consumed by the fetch and commit stages.
pub trait ProgressTracker {
    fn set_message(&self, message: &str);
    fn set_length(&self, length: u64);
    fn set_position(&self, position: u64);
    fn increment(&self, amount: u64);
    fn finish(&self, message: &str);
}

/// No-op tracker for tests and scripted use.
#[derive(Debug, Default)]
pub struct SilentProgress;

impl ProgressTracker for SilentProgress {
    fn set_message(&self, _message: &str) {}
    fn set_length(&self, _length: u64) {}
    fn set_position(&self, _position: u64) {}
    fn increment(&self, _amount: u64) {}
    fn finish(&self, _message: &str) {}
}

/// Logs progress milestones through tracing.
#[derive(Debug)]
pub struct LogProgress {
    name: String,
    position: AtomicU64,
    length: AtomicU64,
}

impl LogProgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: AtomicU64::new(0),
            length: AtomicU64::new(0),
        }
    }
}

impl ProgressTracker for LogProgress {
    fn set_message(&self, message: &str) {
        info!("{}: {}", self.name, message);
    }

    fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Relaxed);
    }

    fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Relaxed);
    }

    fn increment(&self, amount: u64) {
        self.position.fetch_add(amount, Ordering::Relaxed);
    }

    fn finish(&self, message: &str) {
        info!("{}: {}", self.name, message);
    }
}

/// Visual progress bar for interactive runs.
pub struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    /// A bytes-style bar for archive downloads.
    pub fn bytes() -> Self {
        let bar = ProgressBar::no_length();
        bar.set_style(
            ProgressStyle::with_template(
                "{msg:30} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        Self { bar }
    }
}

impl ProgressTracker for CliProgress {
    fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn set_length(&self, length: u64) {
        self.bar.set_length(length);
    }

    fn set_position(&self, position: u64) {
        self.bar.set_position(position);
    }

    fn increment(&self, amount: u64) {
        self.bar.inc(amount);
    }

    fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

//! Upload counters shared by the per-table workers.
//!
//! Workers record every archive and metadata object as it lands; the
//! orchestrator reads a [`UploadSummary`] once all of them have finished.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct UploadStats {
    start_time: Instant,
    archives_uploaded: AtomicU64,
    archives_resumed: AtomicU64,
    compressed_bytes: AtomicU64,
    data_bytes: AtomicU64,
    metadata_bytes: AtomicU64,
    required_parts: AtomicU64,
}

impl UploadStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            archives_uploaded: AtomicU64::new(0),
            archives_resumed: AtomicU64::new(0),
            compressed_bytes: AtomicU64::new(0),
            data_bytes: AtomicU64::new(0),
            metadata_bytes: AtomicU64::new(0),
            required_parts: AtomicU64::new(0),
        }
    }

    /// An archive of `data_size` bytes was uploaded as `compressed` bytes.
    pub fn record_archive(&self, compressed: u64, data_size: u64) {
        self.archives_uploaded.fetch_add(1, Ordering::Relaxed);
        self.compressed_bytes.fetch_add(compressed, Ordering::Relaxed);
        self.data_bytes.fetch_add(data_size, Ordering::Relaxed);
    }

    /// An archive found done in the resumable ledger.
    pub fn record_resumed(&self, compressed: u64, data_size: u64) {
        self.archives_resumed.fetch_add(1, Ordering::Relaxed);
        self.compressed_bytes.fetch_add(compressed, Ordering::Relaxed);
        self.data_bytes.fetch_add(data_size, Ordering::Relaxed);
    }

    pub fn record_metadata(&self, size: u64) {
        self.metadata_bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn record_required(&self, parts: usize) {
        self.required_parts.fetch_add(parts as u64, Ordering::Relaxed);
    }

    pub fn summary(&self, backup_name: &str, tables: usize) -> UploadSummary {
        UploadSummary {
            backup_name: backup_name.to_string(),
            tables,
            archives_uploaded: self.archives_uploaded.load(Ordering::Relaxed),
            archives_resumed: self.archives_resumed.load(Ordering::Relaxed),
            compressed_size: self.compressed_bytes.load(Ordering::Relaxed),
            data_size: self.data_bytes.load(Ordering::Relaxed),
            metadata_size: self.metadata_bytes.load(Ordering::Relaxed),
            required_parts: self.required_parts.load(Ordering::Relaxed),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for UploadStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub backup_name: String,
    pub tables: usize,
    pub archives_uploaded: u64,
    /// Archives skipped because a previous attempt already uploaded them
    pub archives_resumed: u64,
    pub compressed_size: u64,
    pub data_size: u64,
    pub metadata_size: u64,
    /// Parts carried by the diff-from backup
    pub required_parts: u64,
    pub elapsed: Duration,
}

impl UploadSummary {
    /// Average upload speed over the run
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed.as_secs_f64();
        if elapsed > 0.0 {
            (self.compressed_size as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

impl fmt::Display for UploadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} tables, {} archives ({} resumed), {} compressed, {} metadata, {} parts from diff, took {} ({})",
            self.backup_name,
            self.tables,
            self.archives_uploaded + self.archives_resumed,
            self.archives_resumed,
            format_bytes(self.compressed_size),
            format_bytes(self.metadata_size),
            self.required_parts,
            format_duration(self.elapsed.as_secs()),
            format_speed(self.average_speed()),
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

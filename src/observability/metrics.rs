//! Backup counters
//!
//! - Counters only, monotonic
//! - Thread-safe, Relaxed ordering (exact totals are read after the pools join)

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Operational counters for one backup run
#[derive(Debug, Default)]
pub struct BackupMetrics {
    /// Tablespace files fully copied
    files_copied: AtomicU64,
    /// Tablespaces skipped because they were dropped or renamed mid-copy
    files_skipped: AtomicU64,
    /// Pages handed to a write filter
    pages_copied: AtomicU64,
    /// Corrupted pages replaced by zeroes in the copy
    pages_zero_filled: AtomicU64,
    /// Bytes appended to the backup log
    log_bytes_copied: AtomicU64,
    /// Chunks appended to the backup log
    log_chunks_copied: AtomicU64,
    /// Structural events delivered to the active sink
    structural_events: AtomicU64,
}

impl BackupMetrics {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_files_copied(&self) {
        self.files_copied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_files_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_pages_copied(&self, pages: u64) {
        self.pages_copied.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn increment_pages_zero_filled(&self) {
        self.pages_zero_filled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one durable append to the backup log
    pub fn add_log_chunks(&self, chunks: u64, bytes: u64) {
        self.log_chunks_copied.fetch_add(chunks, Ordering::Relaxed);
        self.log_bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_structural_events(&self) {
        self.structural_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_copied: self.files_copied.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            pages_copied: self.pages_copied.load(Ordering::Relaxed),
            pages_zero_filled: self.pages_zero_filled.load(Ordering::Relaxed),
            log_bytes_copied: self.log_bytes_copied.load(Ordering::Relaxed),
            log_chunks_copied: self.log_chunks_copied.load(Ordering::Relaxed),
            structural_events: self.structural_events.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`BackupMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub files_copied: u64,
    pub files_skipped: u64,
    pub pages_copied: u64,
    pub pages_zero_filled: u64,
    pub log_bytes_copied: u64,
    pub log_chunks_copied: u64,
    pub structural_events: u64,
}

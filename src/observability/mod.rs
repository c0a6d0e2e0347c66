//! Observability for backup runs
//!
//! - Structured logging (JSON lines, deterministic key order)
//! - Monotonic counters per run
//!
//! # Usage
//!
//! ```ignore
//! use aerobackup::observability::Logger;
//!
//! Logger::info("STAGE_ENTERED", &[("stage", "block_ddl")]);
//! ```

mod logger;
mod metrics;

pub use logger::{Logger, Severity, LOG_LEVEL_ENV};
pub use metrics::{BackupMetrics, MetricsSnapshot};

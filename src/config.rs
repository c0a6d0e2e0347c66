//! Backup run configuration
//!
//! Loaded from JSON. Every optional field has a default; `load` validates
//! before returning.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::filter::NameFilter;
use crate::observability::Severity;
use crate::redo::{Lsn, Transport};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Archive format when the backup is streamed into one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    Tar,
}

/// Retry schedule shared by log tailing, LSN waits and source opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> Arc<dyn BackoffPolicy> {
        Arc::new(ExponentialBackoff {
            initial: Duration::from_millis(self.initial_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
            jitter: self.jitter,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Engine data directory holding the `*.ibd` files
    pub datadir: PathBuf,

    /// Engine redo log file
    pub log_file: PathBuf,

    /// Where the backup is written
    pub target_dir: PathBuf,

    /// Copy worker threads
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Combined read and write operations per second; unlimited when absent
    #[serde(default)]
    pub io_throttle: Option<u64>,

    /// Skip the lock RPCs; structural changes after BlockDdl then fail the run
    #[serde(default)]
    pub no_lock: bool,

    /// Record and zero-fill pages that keep failing validation
    #[serde(default)]
    pub log_corrupted_pages: bool,

    /// Regexes over tablespace names; empty means every name
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,

    /// Base LSN of an incremental backup
    #[serde(default)]
    pub incremental_lsn: Option<u64>,

    /// Changed-page bitmap restricting an incremental backup's reads
    #[serde(default)]
    pub changed_pages: Option<PathBuf>,

    #[serde(default)]
    pub transport: Transport,

    /// LZ4-compress every file
    #[serde(default)]
    pub compress: bool,

    #[serde(default)]
    pub stream: Option<StreamFormat>,

    /// Upper bound on each LSN wait; unbounded when absent
    #[serde(default)]
    pub lsn_wait_timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_page_read_retries")]
    pub page_read_retries: u32,

    #[serde(default)]
    pub recover_binlog_info: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_parallel() -> usize {
    4
}
fn default_page_read_retries() -> u32 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_attempts() -> u32 {
    20
}
fn default_initial_delay_ms() -> u64 {
    10
}
fn default_max_delay_ms() -> u64 {
    500
}
fn default_multiplier() -> u32 {
    2
}

impl BackupConfig {
    /// A configuration with every optional field at its default
    pub fn new(
        datadir: impl Into<PathBuf>,
        log_file: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            datadir: datadir.into(),
            log_file: log_file.into(),
            target_dir: target_dir.into(),
            parallel: default_parallel(),
            io_throttle: None,
            no_lock: false,
            log_corrupted_pages: false,
            include: Vec::new(),
            exclude: Vec::new(),
            incremental_lsn: None,
            changed_pages: None,
            transport: Transport::default(),
            compress: false,
            stream: None,
            lsn_wait_timeout_secs: None,
            retry: RetryConfig::default(),
            page_read_retries: default_page_read_retries(),
            recover_binlog_info: false,
            log_level: default_log_level(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: BackupConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel == 0 {
            return Err(ConfigError::Invalid("parallel must be > 0".to_string()));
        }
        if self.io_throttle == Some(0) {
            return Err(ConfigError::Invalid(
                "io_throttle must be > 0 when set".to_string(),
            ));
        }
        if self.target_dir == self.datadir {
            return Err(ConfigError::Invalid(
                "target_dir must differ from datadir".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 || self.retry.multiplier == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts and retry.multiplier must be > 0".to_string(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.changed_pages.is_some() && self.incremental_lsn.is_none() {
            return Err(ConfigError::Invalid(
                "changed_pages requires incremental_lsn".to_string(),
            ));
        }
        if self.log_severity().is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown log_level '{}'",
                self.log_level
            )));
        }
        self.name_filter()?;
        Ok(())
    }

    pub fn name_filter(&self) -> Result<NameFilter, ConfigError> {
        NameFilter::new(&self.include, &self.exclude)
            .map_err(|e| ConfigError::Invalid(format!("bad include/exclude pattern: {}", e)))
    }

    pub fn log_severity(&self) -> Option<Severity> {
        Severity::parse(&self.log_level)
    }

    pub fn policy(&self) -> Arc<dyn BackoffPolicy> {
        self.retry.policy()
    }

    pub fn incremental_base(&self) -> Option<Lsn> {
        self.incremental_lsn.map(Lsn::new)
    }

    pub fn lsn_wait_timeout(&self) -> Option<Duration> {
        self.lsn_wait_timeout_secs.map(Duration::from_secs)
    }
}

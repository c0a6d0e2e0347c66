//! Backup metadata files
//!
//! - `aero_checkpoints`: line-oriented `key = value` text with stable keys,
//!   written last by a successful run. Restore refuses to start without it.
//! - `backup_info.json`: descriptive manifest of the run.
//!
//! Both are written through a temporary file, fsynced, then renamed.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::observability::MetricsSnapshot;
use crate::redo::Lsn;

pub const CHECKPOINTS_FILE: &str = "aero_checkpoints";
pub const BACKUP_INFO_FILE: &str = "backup_info.json";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata file {} not found; the backup did not complete", .0.display())]
    Missing(PathBuf),
    #[error("metadata line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("metadata I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("backup info JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MetadataError {
    fn io(path: &Path, source: io::Error) -> Self {
        MetadataError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupType {
    FullBackuped,
    Incremental,
    FullPrepared,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::FullBackuped => "full-backuped",
            BackupType::Incremental => "incremental",
            BackupType::FullPrepared => "full-prepared",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "full-backuped" => Some(BackupType::FullBackuped),
            "incremental" => Some(BackupType::Incremental),
            "full-prepared" => Some(BackupType::FullPrepared),
            _ => None,
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of `aero_checkpoints`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoints {
    pub backup_type: BackupType,
    /// Start of the copied log; for incrementals, the base backup's `to_lsn`
    pub from_lsn: Lsn,
    /// Consistency point the restore replays to
    pub to_lsn: Lsn,
    /// Highest LSN the log copy reached
    pub last_lsn: Lsn,
    pub recover_binlog_info: bool,
}

impl Checkpoints {
    pub fn render(&self) -> String {
        format!(
            "backup_type = {}\nfrom_lsn = {}\nto_lsn = {}\nlast_lsn = {}\nrecover_binlog_info = {}\n",
            self.backup_type,
            self.from_lsn,
            self.to_lsn,
            self.last_lsn,
            u8::from(self.recover_binlog_info)
        )
    }

    pub fn parse(text: &str) -> Result<Self, MetadataError> {
        let mut backup_type = None;
        let mut from_lsn = None;
        let mut to_lsn = None;
        let mut last_lsn = None;
        let mut recover_binlog_info = false;

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| MetadataError::Parse {
                line: line_no,
                reason: format!("expected 'key = value', got '{}'", line),
            })?;
            let value = value.trim();
            let parse_lsn = |value: &str| {
                value
                    .parse::<u64>()
                    .map(Lsn::new)
                    .map_err(|_| MetadataError::Parse {
                        line: line_no,
                        reason: format!("bad LSN '{}'", value),
                    })
            };
            match key.trim() {
                "backup_type" => {
                    backup_type =
                        Some(BackupType::parse(value).ok_or_else(|| MetadataError::Parse {
                            line: line_no,
                            reason: format!("unknown backup type '{}'", value),
                        })?)
                }
                "from_lsn" => from_lsn = Some(parse_lsn(value)?),
                "to_lsn" => to_lsn = Some(parse_lsn(value)?),
                "last_lsn" => last_lsn = Some(parse_lsn(value)?),
                "recover_binlog_info" => recover_binlog_info = value == "1",
                // Unknown keys are kept forward compatible
                _ => {}
            }
        }

        let missing = |key: &str| MetadataError::Parse {
            line: 0,
            reason: format!("missing key '{}'", key),
        };
        Ok(Self {
            backup_type: backup_type.ok_or_else(|| missing("backup_type"))?,
            from_lsn: from_lsn.ok_or_else(|| missing("from_lsn"))?,
            to_lsn: to_lsn.ok_or_else(|| missing("to_lsn"))?,
            last_lsn: last_lsn.ok_or_else(|| missing("last_lsn"))?,
            recover_binlog_info,
        })
    }

    pub fn write_to(&self, dir: &Path) -> Result<(), MetadataError> {
        write_atomically(&dir.join(CHECKPOINTS_FILE), self.render().as_bytes())
    }

    pub fn read_from(dir: &Path) -> Result<Self, MetadataError> {
        let path = dir.join(CHECKPOINTS_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(MetadataError::Missing(path)),
            Err(e) => Err(MetadataError::io(&path, e)),
        }
    }
}

/// Contents of `backup_info.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub backup_id: Uuid,
    pub tool_version: String,
    pub backup_type: BackupType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub from_lsn: Lsn,
    pub to_lsn: Lsn,
    pub last_lsn: Lsn,
    pub no_lock: bool,
    pub compressed: bool,
    pub streamed: bool,
    pub metrics: MetricsSnapshot,
}

impl BackupInfo {
    pub fn new(
        checkpoints: &Checkpoints,
        start_time: DateTime<Utc>,
        metrics: MetricsSnapshot,
    ) -> Self {
        Self {
            backup_id: Uuid::new_v4(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            backup_type: checkpoints.backup_type,
            start_time,
            end_time: Utc::now(),
            from_lsn: checkpoints.from_lsn,
            to_lsn: checkpoints.to_lsn,
            last_lsn: checkpoints.last_lsn,
            no_lock: false,
            compressed: false,
            streamed: false,
            metrics,
        }
    }

    pub fn to_json(&self) -> Result<String, MetadataError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, dir: &Path) -> Result<(), MetadataError> {
        write_atomically(&dir.join(BACKUP_INFO_FILE), self.to_json()?.as_bytes())
    }

    pub fn read_from(dir: &Path) -> Result<Self, MetadataError> {
        let path = dir.join(BACKUP_INFO_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MetadataError::Missing(path))
            }
            Err(e) => return Err(MetadataError::io(&path, e)),
        };
        Ok(serde_json::from_str(&text)?)
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), MetadataError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| MetadataError::io(parent, e))?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).map_err(|e| MetadataError::io(&tmp, e))?;
    file.write_all(contents)
        .map_err(|e| MetadataError::io(&tmp, e))?;
    file.sync_all().map_err(|e| MetadataError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| MetadataError::io(path, e))
}

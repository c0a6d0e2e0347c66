//! Backup run error types
//!
//! Error codes:
//! - AERO_BACKUP_CONFIG (ERROR severity)
//! - AERO_BACKUP_RPC_FAILED (FATAL severity)
//! - AERO_BACKUP_STAGE_ORDER (FATAL severity)
//! - AERO_BACKUP_COPY_FAILED (FATAL severity)
//! - AERO_BACKUP_LOG_COPY_FAILED (FATAL severity)
//! - AERO_BACKUP_LOG_CAPACITY (FATAL severity)
//! - AERO_BACKUP_UNEXPECTED_DDL (FATAL severity)
//! - AERO_BACKUP_RECONCILE_FAILED (FATAL severity)
//! - AERO_BACKUP_METADATA (FATAL severity)
//!
//! Only the orchestrator turns component results into these errors; every
//! one of them except a configuration error abandons the run.

use std::error::Error as StdError;
use std::fmt;

use crate::config::ConfigError;
use crate::copier::CopyError;
use crate::ddl::{ReconcileError, StructuralEvent};
use crate::engine::EngineError;
use crate::redo::{Lsn, RedoError};

use super::stages::BackupStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupErrorCode {
    AeroBackupConfig,
    AeroBackupRpcFailed,
    AeroBackupStageOrder,
    AeroBackupCopyFailed,
    AeroBackupLogCopyFailed,
    /// The log copy could not reach the LSN the backup needs
    AeroBackupLogCapacity,
    /// A structural change slipped past BlockDdl without the DDL lock
    AeroBackupUnexpectedDdl,
    AeroBackupReconcileFailed,
    AeroBackupMetadata,
}

impl BackupErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupErrorCode::AeroBackupConfig => "AERO_BACKUP_CONFIG",
            BackupErrorCode::AeroBackupRpcFailed => "AERO_BACKUP_RPC_FAILED",
            BackupErrorCode::AeroBackupStageOrder => "AERO_BACKUP_STAGE_ORDER",
            BackupErrorCode::AeroBackupCopyFailed => "AERO_BACKUP_COPY_FAILED",
            BackupErrorCode::AeroBackupLogCopyFailed => "AERO_BACKUP_LOG_COPY_FAILED",
            BackupErrorCode::AeroBackupLogCapacity => "AERO_BACKUP_LOG_CAPACITY",
            BackupErrorCode::AeroBackupUnexpectedDdl => "AERO_BACKUP_UNEXPECTED_DDL",
            BackupErrorCode::AeroBackupReconcileFailed => "AERO_BACKUP_RECONCILE_FAILED",
            BackupErrorCode::AeroBackupMetadata => "AERO_BACKUP_METADATA",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            BackupErrorCode::AeroBackupConfig => Severity::Error,
            _ => Severity::Fatal,
        }
    }
}

impl fmt::Display for BackupErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
pub struct BackupError {
    code: BackupErrorCode,
    message: String,
    /// (requested, reached) of a failed LSN wait
    lsns: Option<(Lsn, Lsn)>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl BackupError {
    fn new(code: BackupErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            lsns: None,
            source: None,
        }
    }

    fn caused_by(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn config(source: ConfigError) -> Self {
        Self::new(BackupErrorCode::AeroBackupConfig, "invalid backup configuration")
            .caused_by(source)
    }

    pub fn rpc_failed(stage: BackupStage, source: EngineError) -> Self {
        Self::new(
            BackupErrorCode::AeroBackupRpcFailed,
            format!("engine rejected the {} stage", stage),
        )
        .caused_by(source)
    }

    pub fn stage_order(current: Option<BackupStage>, requested: BackupStage) -> Self {
        let current = current.map_or_else(|| "none".to_string(), |s| s.to_string());
        Self::new(
            BackupErrorCode::AeroBackupStageOrder,
            format!("cannot enter {} after {}", requested, current),
        )
    }

    pub fn copy_failed(source: CopyError) -> Self {
        Self::new(BackupErrorCode::AeroBackupCopyFailed, "tablespace copy failed")
            .caused_by(source)
    }

    pub fn log_copy_failed(source: RedoError) -> Self {
        Self::new(BackupErrorCode::AeroBackupLogCopyFailed, "log copy failed").caused_by(source)
    }

    pub fn log_capacity(requested: Lsn, reached: Lsn, detail: Option<String>) -> Self {
        let mut message = format!(
            "log copy reached LSN {} but the backup needs LSN {}; the engine overwrote log that \
             was not copied yet, increase the log capacity or reduce write load",
            reached, requested
        );
        if let Some(detail) = detail {
            message.push_str(&format!(" ({})", detail));
        }
        let mut err = Self::new(BackupErrorCode::AeroBackupLogCapacity, message);
        err.lsns = Some((requested, reached));
        err
    }

    pub fn unexpected_ddl(event: &StructuralEvent) -> Self {
        Self::new(
            BackupErrorCode::AeroBackupUnexpectedDdl,
            format!(
                "structural change after BlockDdl without the DDL lock: {}; retry the backup or \
                 run it with locks",
                event
            ),
        )
    }

    pub fn reconcile_failed(source: ReconcileError) -> Self {
        Self::new(
            BackupErrorCode::AeroBackupReconcileFailed,
            "structural change reconciliation failed",
        )
        .caused_by(source)
    }

    pub fn metadata(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::new(BackupErrorCode::AeroBackupMetadata, message).caused_by(source)
    }

    pub fn code(&self) -> BackupErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// (requested, reached) LSNs of a log capacity failure
    pub fn lsns(&self) -> Option<(Lsn, Lsn)> {
        self.lsns
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code.severity(), self.code, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl StdError for BackupError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

pub type BackupResult<T> = Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_capacity_carries_lsns() {
        let err = BackupError::log_capacity(Lsn::new(1000), Lsn::new(700), None);
        assert_eq!(err.code(), BackupErrorCode::AeroBackupLogCapacity);
        assert_eq!(err.lsns(), Some((Lsn::new(1000), Lsn::new(700))));
        let text = err.to_string();
        assert!(text.starts_with("[FATAL] AERO_BACKUP_LOG_CAPACITY"));
        assert!(text.contains("increase the log capacity"));
    }

    #[test]
    fn test_rpc_failure_keeps_cause() {
        let err = BackupError::rpc_failed(
            BackupStage::BlockDdl,
            EngineError::Rpc {
                rpc: "stage_block_ddl",
                reason: "timeout".to_string(),
            },
        );
        assert!(err.to_string().contains("block_ddl"));
        assert!(err.to_string().contains("caused by: engine RPC stage_block_ddl failed: timeout"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn test_config_errors_are_not_fatal() {
        let err = BackupError::config(ConfigError::Invalid("parallel must be > 0".to_string()));
        assert_eq!(err.severity(), Severity::Error);
    }
}

//! Prepare error types
//!
//! Error codes:
//! - AERO_PREPARE_INVALID_BACKUP (FATAL severity)
//! - AERO_PREPARE_IO (FATAL severity)
//! - AERO_PREPARE_MARKER (FATAL severity)
//! - AERO_PREPARE_REPLAY (FATAL severity)
//! - AERO_PREPARE_UNREPAIRABLE (FATAL severity)
//! - AERO_PREPARE_INCREMENTAL (FATAL severity)
//!
//! Every prepare error leaves the backup unprepared; `aero_checkpoints`
//! keeps its previous backup type.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::Path;

use crate::corrupted::RegistryError;
use crate::metadata::MetadataError;
use crate::redo::RedoError;

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
pub enum PrepareErrorCode {
    /// Metadata missing, unreadable, or in the wrong state
    AeroPrepareInvalidBackup,
    AeroPrepareIo,
    /// A marker file could not be applied
    AeroPrepareMarker,
    /// The backup log does not replay cleanly to `to_lsn`
    AeroPrepareReplay,
    /// Corrupted pages remain after repair
    AeroPrepareUnrepairable,
    /// A delta does not fit its base
    AeroPrepareIncremental,
}

impl PrepareErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrepareErrorCode::AeroPrepareInvalidBackup => "AERO_PREPARE_INVALID_BACKUP",
            PrepareErrorCode::AeroPrepareIo => "AERO_PREPARE_IO",
            PrepareErrorCode::AeroPrepareMarker => "AERO_PREPARE_MARKER",
            PrepareErrorCode::AeroPrepareReplay => "AERO_PREPARE_REPLAY",
            PrepareErrorCode::AeroPrepareUnrepairable => "AERO_PREPARE_UNREPAIRABLE",
            PrepareErrorCode::AeroPrepareIncremental => "AERO_PREPARE_INCREMENTAL",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Fatal
    }
}

impl fmt::Display for PrepareErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
pub struct PrepareError {
    code: PrepareErrorCode,
    message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl PrepareError {
    fn new(code: PrepareErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    fn caused_by(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn invalid_backup(message: impl Into<String>) -> Self {
        Self::new(PrepareErrorCode::AeroPrepareInvalidBackup, message)
    }

    pub fn metadata(source: MetadataError) -> Self {
        Self::new(
            PrepareErrorCode::AeroPrepareInvalidBackup,
            "cannot read backup metadata",
        )
        .caused_by(source)
    }

    pub fn metadata_write(source: MetadataError) -> Self {
        Self::new(PrepareErrorCode::AeroPrepareIo, "cannot write backup metadata")
            .caused_by(source)
    }

    pub fn io_at_path(path: &Path, source: io::Error) -> Self {
        Self::new(
            PrepareErrorCode::AeroPrepareIo,
            format!("I/O error on {}", path.display()),
        )
        .caused_by(source)
    }

    pub fn registry(source: RegistryError) -> Self {
        Self::new(PrepareErrorCode::AeroPrepareIo, "corrupted page list").caused_by(source)
    }

    pub fn marker(marker: &Path, message: impl Into<String>) -> Self {
        Self::new(
            PrepareErrorCode::AeroPrepareMarker,
            format!("{}: {}", marker.display(), message.into()),
        )
    }

    pub fn replay(message: impl Into<String>) -> Self {
        Self::new(PrepareErrorCode::AeroPrepareReplay, message)
    }

    pub fn replay_log(source: RedoError) -> Self {
        Self::new(PrepareErrorCode::AeroPrepareReplay, "cannot read the backup log")
            .caused_by(source)
    }

    pub fn unrepairable(pages: usize) -> Self {
        Self::new(
            PrepareErrorCode::AeroPrepareUnrepairable,
            format!(
                "{} corrupted page(s) are still allocated and could not be rebuilt; \
                 the list is kept in the backup directory",
                pages
            ),
        )
    }

    pub fn incremental(message: impl Into<String>) -> Self {
        Self::new(PrepareErrorCode::AeroPrepareIncremental, message)
    }

    pub fn code(&self) -> PrepareErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }
}

impl fmt::Display for PrepareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code.severity(), self.code, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl StdError for PrepareError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

pub type PrepareResult<T> = Result<T, PrepareError>;

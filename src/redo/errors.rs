//! Redo log copy error types
//!
//! Error codes:
//! - AERO_REDO_SOURCE_READ (ERROR severity, retried by the tailer)
//! - AERO_REDO_DESTINATION_WRITE (FATAL severity)
//! - AERO_REDO_CORRUPTION (FATAL severity)
//! - AERO_REDO_OVERRUN (FATAL severity)
//! - AERO_REDO_HEADER (FATAL severity)
//! - AERO_REDO_NOT_BOUNDARY (ERROR severity)
//! - AERO_REDO_TASK_FAILED (FATAL severity)

use std::fmt;
use std::io;

use super::lsn::Lsn;

/// Severity levels for redo errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The operation failed; the caller may retry or decide
    Error,
    /// The backup log can no longer be trusted
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

/// Redo-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoErrorCode {
    /// Reading the engine's circular log failed
    AeroRedoSourceRead,
    /// Appending to the backup log failed
    AeroRedoDestinationWrite,
    /// A chunk passed its checksum but could not be decoded, or the backup
    /// log framing is broken
    AeroRedoCorruption,
    /// The engine overwrote log the tailer had not copied yet
    AeroRedoOverrun,
    /// Log header missing or invalid
    AeroRedoHeader,
    /// A truncation point does not fall on a chunk boundary
    AeroRedoNotBoundary,
    /// The log copy thread could not start or panicked
    AeroRedoTaskFailed,
}

impl RedoErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            RedoErrorCode::AeroRedoSourceRead => "AERO_REDO_SOURCE_READ",
            RedoErrorCode::AeroRedoDestinationWrite => "AERO_REDO_DESTINATION_WRITE",
            RedoErrorCode::AeroRedoCorruption => "AERO_REDO_CORRUPTION",
            RedoErrorCode::AeroRedoOverrun => "AERO_REDO_OVERRUN",
            RedoErrorCode::AeroRedoHeader => "AERO_REDO_HEADER",
            RedoErrorCode::AeroRedoNotBoundary => "AERO_REDO_NOT_BOUNDARY",
            RedoErrorCode::AeroRedoTaskFailed => "AERO_REDO_TASK_FAILED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            RedoErrorCode::AeroRedoSourceRead => Severity::Error,
            RedoErrorCode::AeroRedoNotBoundary => Severity::Error,
            RedoErrorCode::AeroRedoDestinationWrite => Severity::Fatal,
            RedoErrorCode::AeroRedoCorruption => Severity::Fatal,
            RedoErrorCode::AeroRedoOverrun => Severity::Fatal,
            RedoErrorCode::AeroRedoHeader => Severity::Fatal,
            RedoErrorCode::AeroRedoTaskFailed => Severity::Fatal,
        }
    }
}

impl fmt::Display for RedoErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Redo error with context
#[derive(Debug)]
pub struct RedoError {
    code: RedoErrorCode,
    message: String,
    lsn: Option<Lsn>,
    source: Option<io::Error>,
}

impl RedoError {
    fn new(code: RedoErrorCode, message: impl Into<String>, source: Option<io::Error>) -> Self {
        Self {
            code,
            message: message.into(),
            lsn: None,
            source,
        }
    }

    pub fn source_read(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(RedoErrorCode::AeroRedoSourceRead, message, Some(source))
    }

    pub fn destination_write(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(RedoErrorCode::AeroRedoDestinationWrite, message, Some(source))
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(RedoErrorCode::AeroRedoCorruption, message, None)
    }

    pub fn corruption_at(lsn: Lsn, message: impl Into<String>) -> Self {
        let mut err = Self::corruption(message);
        err.lsn = Some(lsn);
        err
    }

    pub fn overrun(cursor: Lsn, checkpoint: Lsn) -> Self {
        let mut err = Self::new(
            RedoErrorCode::AeroRedoOverrun,
            format!(
                "log was overwritten before it was copied: copied up to {}, engine checkpoint at {}; \
                 the log is too small for this write load",
                cursor, checkpoint
            ),
            None,
        );
        err.lsn = Some(cursor);
        err
    }

    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::new(RedoErrorCode::AeroRedoHeader, message, None)
    }

    pub fn not_boundary(lsn: Lsn, message: impl Into<String>) -> Self {
        let mut err = Self::new(RedoErrorCode::AeroRedoNotBoundary, message, None);
        err.lsn = Some(lsn);
        err
    }

    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::new(RedoErrorCode::AeroRedoTaskFailed, message, None)
    }

    pub fn code(&self) -> RedoErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// LSN at which the error was detected, when known
    pub fn lsn(&self) -> Option<Lsn> {
        self.lsn
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn is_fatal(&self) -> bool {
        self.code.severity() == Severity::Fatal
    }

    /// Whether the tailer should retry this error with backoff
    pub fn is_source_read(&self) -> bool {
        self.code == RedoErrorCode::AeroRedoSourceRead
    }
}

impl fmt::Display for RedoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code.severity(), self.code, self.message)?;
        if let Some(lsn) = self.lsn {
            write!(f, " (at LSN {})", lsn)?;
        }
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for RedoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for redo operations
pub type RedoResult<T> = Result<T, RedoError>;

//! File copy error types
//!
//! Error codes:
//! - AERO_COPY_SOURCE (ERROR severity)
//! - AERO_COPY_SOURCE_MISSING (ERROR severity)
//! - AERO_COPY_DESTINATION (FATAL severity)
//! - AERO_COPY_CORRUPTED_PAGE (FATAL severity)
//! - AERO_COPY_BITMAP (ERROR severity)
//! - AERO_COPY_ABORTED (ERROR severity)
//!
//! Destination failures are always fatal: a partially written copy cannot
//! be trusted. Source failures are decided by the caller.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::page::PageId;

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
pub enum CopyErrorCode {
    /// Reading a tablespace file failed
    AeroCopySource,
    /// A tablespace file could not be opened, even after retries
    AeroCopySourceMissing,
    /// Writing the copy failed
    AeroCopyDestination,
    /// A page kept failing validation and corrupted pages are not logged
    AeroCopyCorruptedPage,
    /// The changed-page bitmap is unreadable
    AeroCopyBitmap,
    /// The pass was cut short
    AeroCopyAborted,
}

impl CopyErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            CopyErrorCode::AeroCopySource => "AERO_COPY_SOURCE",
            CopyErrorCode::AeroCopySourceMissing => "AERO_COPY_SOURCE_MISSING",
            CopyErrorCode::AeroCopyDestination => "AERO_COPY_DESTINATION",
            CopyErrorCode::AeroCopyCorruptedPage => "AERO_COPY_CORRUPTED_PAGE",
            CopyErrorCode::AeroCopyBitmap => "AERO_COPY_BITMAP",
            CopyErrorCode::AeroCopyAborted => "AERO_COPY_ABORTED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            CopyErrorCode::AeroCopyDestination | CopyErrorCode::AeroCopyCorruptedPage => {
                Severity::Fatal
            }
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for CopyErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug)]
pub struct CopyError {
    code: CopyErrorCode,
    message: String,
    path: Option<PathBuf>,
    source: Option<io::Error>,
}

impl CopyError {
    fn new(code: CopyErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
            source: None,
        }
    }

    fn with_io(mut self, path: &Path, source: io::Error) -> Self {
        self.path = Some(path.to_path_buf());
        self.source = Some(source);
        self
    }

    pub fn source_read(path: &Path, source: io::Error) -> Self {
        Self::new(CopyErrorCode::AeroCopySource, "failed to read tablespace file")
            .with_io(path, source)
    }

    pub fn source_missing(path: &Path, source: io::Error) -> Self {
        Self::new(
            CopyErrorCode::AeroCopySourceMissing,
            "tablespace file cannot be opened and no drop or rename explains it",
        )
        .with_io(path, source)
    }

    pub fn destination(name: &str, source: io::Error) -> Self {
        Self::new(
            CopyErrorCode::AeroCopyDestination,
            format!("failed to write '{}'", name),
        )
        .with_source(source)
    }

    pub fn corrupted_page(name: &str, page: PageId, attempts: u32) -> Self {
        Self::new(
            CopyErrorCode::AeroCopyCorruptedPage,
            format!(
                "page {} of '{}' failed validation {} times; enable corrupted page logging to continue",
                page, name, attempts
            ),
        )
    }

    pub fn bitmap(path: &Path, message: impl Into<String>) -> Self {
        let mut err = Self::new(CopyErrorCode::AeroCopyBitmap, message);
        err.path = Some(path.to_path_buf());
        err
    }

    pub fn bitmap_io(path: &Path, source: io::Error) -> Self {
        Self::new(CopyErrorCode::AeroCopyBitmap, "failed to read changed-page bitmap")
            .with_io(path, source)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(CopyErrorCode::AeroCopyAborted, message)
    }

    fn with_source(mut self, source: io::Error) -> Self {
        self.source = Some(source);
        self
    }

    pub fn code(&self) -> CopyErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn is_fatal(&self) -> bool {
        self.code.severity() == Severity::Fatal
    }
}

impl fmt::Display for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code.severity(), self.code, self.message)?;
        if let Some(ref path) = self.path {
            write!(f, " ({})", path.display())?;
        }
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for CopyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type CopyResult<T> = Result<T, CopyError>;

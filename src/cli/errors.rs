//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero status.

use std::fmt;
use std::io;

use crate::prepare::PrepareError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Bad command-line value
    InvalidArgument,
    /// I/O error (stdout)
    IoError,
    /// Prepare, inspect or incremental apply failed
    PrepareFailed,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "AERO_CLI_INVALID_ARGUMENT",
            Self::IoError => "AERO_CLI_IO_ERROR",
            Self::PrepareFailed => "AERO_CLI_PREPARE_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidArgument, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<PrepareError> for CliError {
    fn from(e: PrepareError) -> Self {
        Self::new(CliErrorCode::PrepareFailed, e.to_string())
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_error_keeps_its_code_in_the_message() {
        let err: CliError = PrepareError::invalid_backup("no metadata").into();
        assert_eq!(err.code(), &CliErrorCode::PrepareFailed);
        assert_eq!(
            err.to_string(),
            "AERO_CLI_PREPARE_FAILED: [FATAL] AERO_PREPARE_INVALID_BACKUP: no metadata"
        );
    }
}

//! Backup orchestration
//!
//! [`BackupRun`] drives the engine through the [`BackupStage`]s in order,
//! starting and stopping the log copy and the file copier around them.
//! Components return results; only this module decides what is fatal.

mod errors;
mod orchestrator;
mod stages;

pub use errors::{BackupError, BackupErrorCode, BackupResult, Severity};
pub use orchestrator::{BackupRun, BackupSummary, STREAM_ARCHIVE_NAME};
pub use stages::{BackupStage, StageCursor};

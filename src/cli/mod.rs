//! CLI module for aerobackup
//!
//! Restore-side commands only:
//! - prepare: make a finished backup consistent
//! - inspect: print a backup's metadata
//! - apply-incremental: fold an incremental into a prepared base

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{apply_incremental, inspect_backup, prepare_backup, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::write_response;

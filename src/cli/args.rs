//! CLI argument definitions using clap
//!
//! Commands:
//! - aerobackup prepare --target-dir <path>
//! - aerobackup inspect --target-dir <path>
//! - aerobackup apply-incremental --base-dir <path> --incremental-dir <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// aerobackup - restore-side tools for hot backups
#[derive(Parser, Debug)]
#[command(name = "aerobackup")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Minimum log severity (trace, info, warn, error, fatal)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply markers, replay the backup log and repair corrupted pages
    Prepare {
        /// Backup directory
        #[arg(long)]
        target_dir: PathBuf,
    },

    /// Print the metadata and state of a backup directory
    Inspect {
        /// Backup directory
        #[arg(long)]
        target_dir: PathBuf,
    },

    /// Fold an incremental backup into a prepared full backup
    ApplyIncremental {
        /// Prepared full backup
        #[arg(long)]
        base_dir: PathBuf,

        /// Incremental backup taken from the base's to_lsn
        #[arg(long)]
        incremental_dir: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

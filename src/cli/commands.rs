//! CLI command implementations
//!
//! Each command runs one restore-side operation and prints a JSON summary.

use std::path::Path;

use serde_json::{json, Value};

use crate::corrupted::RepairReport;
use crate::metadata::Checkpoints;
use crate::observability::{Logger, Severity};
use crate::page::PageId;
use crate::prepare::{self, MarkerReport, ReplayReport};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Parse arguments, set up logging and run the command
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    let severity = Severity::parse(&cli.log_level).ok_or_else(|| {
        CliError::invalid_argument(format!("unknown log level '{}'", cli.log_level))
    })?;
    Logger::init(severity);
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    let data = match cmd {
        Command::Prepare { target_dir } => prepare_backup(&target_dir)?,
        Command::Inspect { target_dir } => inspect_backup(&target_dir)?,
        Command::ApplyIncremental {
            base_dir,
            incremental_dir,
        } => apply_incremental(&base_dir, &incremental_dir)?,
    };
    write_response(data)
}

pub fn prepare_backup(target_dir: &Path) -> CliResult<Value> {
    let report = prepare::prepare(target_dir)?;
    Ok(json!({
        "checkpoints": checkpoints_json(&report.checkpoints),
        "markers": markers_json(&report.markers),
        "replay": replay_json(&report.replay),
        "repair": repair_json(&report.repair),
    }))
}

pub fn inspect_backup(target_dir: &Path) -> CliResult<Value> {
    let inspection = prepare::inspect(target_dir)?;
    let info = match &inspection.info {
        Some(info) => serde_json::to_value(info)?,
        None => Value::Null,
    };
    Ok(json!({
        "target_dir": inspection.target_dir.display().to_string(),
        "checkpoints": checkpoints_json(&inspection.checkpoints),
        "info": info,
        "corrupted_pages": inspection.corrupted_pages,
        "pending_markers": inspection.pending_markers,
    }))
}

pub fn apply_incremental(base_dir: &Path, incremental_dir: &Path) -> CliResult<Value> {
    let report = prepare::apply_incremental(base_dir, incremental_dir)?;
    Ok(json!({
        "checkpoints": checkpoints_json(&report.checkpoints),
        "markers": markers_json(&report.markers),
        "deltas": {
            "files": report.deltas.files,
            "pages": report.deltas.pages,
            "created": report.deltas.created,
        },
        "replay": replay_json(&report.replay),
        "repair": repair_json(&report.repair),
    }))
}

fn checkpoints_json(checkpoints: &Checkpoints) -> Value {
    json!({
        "backup_type": checkpoints.backup_type.as_str(),
        "from_lsn": checkpoints.from_lsn.get(),
        "to_lsn": checkpoints.to_lsn.get(),
        "last_lsn": checkpoints.last_lsn.get(),
        "recover_binlog_info": checkpoints.recover_binlog_info,
    })
}

fn markers_json(markers: &MarkerReport) -> Value {
    json!({
        "deleted": markers.deleted,
        "renamed": markers.renamed,
        "replaced": markers.replaced,
    })
}

fn replay_json(replay: &ReplayReport) -> Value {
    json!({
        "chunks": replay.chunks,
        "records": replay.records,
        "pages_applied": replay.pages_applied,
        "pages_current": replay.pages_current,
        "pages_unknown": replay.pages_unknown,
        "pages_corrupted": replay.pages_corrupted,
        "end_lsn": replay.end_lsn.get(),
    })
}

fn repair_json(repair: &RepairReport) -> Value {
    fn pages(pages: &[PageId]) -> Vec<String> {
        pages.iter().map(ToString::to_string).collect()
    }
    json!({
        "zero_filled": pages(&repair.zero_filled),
        "rebuilt": pages(&repair.rebuilt),
        "unrepairable": pages(&repair.unrepairable),
    })
}

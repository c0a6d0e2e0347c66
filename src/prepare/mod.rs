//! Restore-side preparation of a finished backup
//!
//! A backup directory is usable only after `prepare`:
//! 1. `aero_checkpoints` must exist; without it the run did not complete
//! 2. markers are applied (`.del`, then `.ren`, then `.new`)
//! 3. the backup log is replayed to exactly `to_lsn`
//! 4. recorded corrupted pages are repaired
//! 5. the backup type becomes `full-prepared`
//!
//! Incremental backups are folded into a prepared base with
//! `apply_incremental`.

mod errors;
mod incremental;
mod markers;
mod replay;

use std::path::{Path, PathBuf};

use crate::copier::LZ4_SUFFIX;
use crate::corrupted::{repair, CorruptedPages, RepairReport};
use crate::metadata::{BackupInfo, BackupType, Checkpoints, MetadataError};
use crate::observability::Logger;
use crate::redo::{normalize_sequence_bits, BACKUP_LOG_NAME};
use crate::stage::STREAM_ARCHIVE_NAME;

pub use errors::{PrepareError, PrepareErrorCode, PrepareResult, Severity};
pub use incremental::{apply_deltas, DeltaReport};
pub use markers::{apply_markers, MarkerReport};
pub use replay::{replay_log, ReplayReport};

use markers::{walk_files, MarkerSet};

/// Outcome of `prepare`
#[derive(Debug, Clone)]
pub struct PrepareReport {
    pub checkpoints: Checkpoints,
    pub markers: MarkerReport,
    pub replay: ReplayReport,
    pub repair: RepairReport,
}

/// Outcome of `apply_incremental`
#[derive(Debug, Clone)]
pub struct IncrementalReport {
    pub checkpoints: Checkpoints,
    pub markers: MarkerReport,
    pub deltas: DeltaReport,
    pub replay: ReplayReport,
    pub repair: RepairReport,
}

/// What `inspect` found in a backup directory
#[derive(Debug, Clone)]
pub struct BackupInspection {
    pub target_dir: PathBuf,
    pub checkpoints: Checkpoints,
    pub info: Option<BackupInfo>,
    pub corrupted_pages: usize,
    pub pending_markers: usize,
}

/// Makes the backup in `target_dir` consistent at its `to_lsn`
pub fn prepare(target_dir: &Path) -> PrepareResult<PrepareReport> {
    let mut checkpoints = Checkpoints::read_from(target_dir).map_err(PrepareError::metadata)?;
    match checkpoints.backup_type {
        BackupType::FullBackuped => {}
        BackupType::FullPrepared => {
            return Err(PrepareError::invalid_backup(format!(
                "{} is already prepared",
                target_dir.display()
            )))
        }
        BackupType::Incremental => {
            return Err(PrepareError::invalid_backup(format!(
                "{} is an incremental backup; apply it onto a prepared full backup",
                target_dir.display()
            )))
        }
    }
    check_layout(target_dir)?;
    Logger::info(
        "PREPARE_STARTED",
        &[
            ("from_lsn", &checkpoints.from_lsn.to_string()),
            ("target_dir", &target_dir.display().to_string()),
            ("to_lsn", &checkpoints.to_lsn.to_string()),
        ],
    );

    let markers = apply_markers(target_dir, target_dir)?;
    let replay = replay_into(target_dir, target_dir, &checkpoints)?;
    let repair = repair_pages(target_dir, target_dir, &replay)?;

    checkpoints.backup_type = BackupType::FullPrepared;
    checkpoints
        .write_to(target_dir)
        .map_err(PrepareError::metadata_write)?;
    Logger::info(
        "PREPARE_COMPLETE",
        &[
            ("pages_applied", &replay.pages_applied.to_string()),
            ("rebuilt", &repair.rebuilt.len().to_string()),
            ("to_lsn", &checkpoints.to_lsn.to_string()),
            ("zero_filled", &repair.zero_filled.len().to_string()),
        ],
    );
    Ok(PrepareReport {
        checkpoints,
        markers,
        replay,
        repair,
    })
}

/// Folds the incremental backup in `inc_dir` into the prepared full
/// backup in `base_dir`, which then stands at the incremental's `to_lsn`
pub fn apply_incremental(base_dir: &Path, inc_dir: &Path) -> PrepareResult<IncrementalReport> {
    let mut base = Checkpoints::read_from(base_dir).map_err(PrepareError::metadata)?;
    let inc = Checkpoints::read_from(inc_dir).map_err(PrepareError::metadata)?;
    if base.backup_type != BackupType::FullPrepared {
        return Err(PrepareError::invalid_backup(format!(
            "base {} is {}; prepare it first",
            base_dir.display(),
            base.backup_type
        )));
    }
    if inc.backup_type != BackupType::Incremental {
        return Err(PrepareError::invalid_backup(format!(
            "{} is {}, not an incremental backup",
            inc_dir.display(),
            inc.backup_type
        )));
    }
    if inc.from_lsn != base.to_lsn {
        return Err(PrepareError::incremental(format!(
            "incremental starts at LSN {} but the base ends at {}",
            inc.from_lsn, base.to_lsn
        )));
    }
    check_layout(inc_dir)?;
    Logger::info(
        "INCREMENTAL_APPLY_STARTED",
        &[
            ("base_dir", &base_dir.display().to_string()),
            ("from_lsn", &inc.from_lsn.to_string()),
            ("inc_dir", &inc_dir.display().to_string()),
            ("to_lsn", &inc.to_lsn.to_string()),
        ],
    );

    let markers = apply_markers(inc_dir, base_dir)?;
    let deltas = apply_deltas(inc_dir, base_dir)?;
    let replay = replay_into(inc_dir, base_dir, &inc)?;
    let repair = repair_pages(inc_dir, base_dir, &replay)?;

    base.to_lsn = inc.to_lsn;
    base.last_lsn = inc.last_lsn;
    base.write_to(base_dir).map_err(PrepareError::metadata_write)?;
    Logger::info(
        "INCREMENTAL_APPLY_COMPLETE",
        &[
            ("delta_pages", &deltas.pages.to_string()),
            ("pages_applied", &replay.pages_applied.to_string()),
            ("to_lsn", &base.to_lsn.to_string()),
        ],
    );
    Ok(IncrementalReport {
        checkpoints: base,
        markers,
        deltas,
        replay,
        repair,
    })
}

/// Reads a backup directory without changing it
pub fn inspect(target_dir: &Path) -> PrepareResult<BackupInspection> {
    let checkpoints = Checkpoints::read_from(target_dir).map_err(PrepareError::metadata)?;
    let info = match BackupInfo::read_from(target_dir) {
        Ok(info) => Some(info),
        Err(MetadataError::Missing(_)) => None,
        Err(e) => return Err(PrepareError::metadata(e)),
    };
    let corrupted = CorruptedPages::read_from(target_dir).map_err(PrepareError::registry)?;
    let pending_markers = MarkerSet::scan(target_dir)?.len();
    Ok(BackupInspection {
        target_dir: target_dir.to_path_buf(),
        checkpoints,
        info,
        corrupted_pages: corrupted.page_count(),
        pending_markers,
    })
}

/// Normalizes and replays the backup log kept in `log_dir`
fn replay_into(
    log_dir: &Path,
    data_dir: &Path,
    checkpoints: &Checkpoints,
) -> PrepareResult<ReplayReport> {
    let log_path = log_dir.join(BACKUP_LOG_NAME);
    let normalized = normalize_sequence_bits(&log_path).map_err(PrepareError::replay_log)?;
    if normalized > 0 {
        Logger::warn(
            "LOG_SEQUENCE_BITS_NORMALIZED",
            &[("chunks", &normalized.to_string())],
        );
    }
    let corrupted = CorruptedPages::read_from(log_dir).map_err(PrepareError::registry)?;
    replay_log(&log_path, data_dir, checkpoints.to_lsn, &corrupted)
}

/// Repairs the pages listed in `list_dir` against the files in `data_dir`.
///
/// The list shrinks to what could not be repaired; anything left fails.
fn repair_pages(
    list_dir: &Path,
    data_dir: &Path,
    replay: &ReplayReport,
) -> PrepareResult<RepairReport> {
    let corrupted = CorruptedPages::read_from(list_dir).map_err(PrepareError::registry)?;
    if corrupted.is_empty() {
        return Ok(RepairReport::default());
    }
    let report =
        repair(&corrupted, data_dir, &replay.reinitialized).map_err(PrepareError::registry)?;
    corrupted
        .write_to(list_dir)
        .map_err(PrepareError::registry)?;
    if !report.is_clean() {
        return Err(PrepareError::unrepairable(report.unrepairable.len()));
    }
    Ok(report)
}

/// Streamed and compressed backups must be unpacked first
fn check_layout(dir: &Path) -> PrepareResult<()> {
    if dir.join(STREAM_ARCHIVE_NAME).exists() {
        return Err(PrepareError::invalid_backup(format!(
            "{} holds a streamed backup; extract {} first",
            dir.display(),
            STREAM_ARCHIVE_NAME
        )));
    }
    if let Some(path) = walk_files(dir)?
        .into_iter()
        .find(|p| p.to_string_lossy().ends_with(LZ4_SUFFIX))
    {
        return Err(PrepareError::invalid_backup(format!(
            "{} is compressed; decompress the backup first",
            path.display()
        )));
    }
    Ok(())
}

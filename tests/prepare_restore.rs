//! Backup, prepare, and incremental apply end to end

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use aerobackup::config::BackupConfig;
use aerobackup::corrupted::{CorruptedPages, CORRUPTED_PAGES_FILE};
use aerobackup::engine::EngineSession;
use aerobackup::metadata::{BackupType, Checkpoints};
use aerobackup::page::{PageId, PAGE_SIZE};
use aerobackup::prepare::{self, PrepareErrorCode};
use aerobackup::stage::{BackupRun, BackupSummary};

use common::{catalog, fast_policy, two_table_engine, SimEngine, SimSession};
use parking_lot::Mutex;

fn backup(
    engine: &Arc<Mutex<SimEngine>>,
    session: SimSession,
    target: &str,
    incremental_lsn: Option<u64>,
) -> BackupSummary {
    let mut config = engine.lock().config(target);
    config.incremental_lsn = incremental_lsn;
    backup_with(engine, session, config)
}

fn backup_with(
    engine: &Arc<Mutex<SimEngine>>,
    session: SimSession,
    config: BackupConfig,
) -> BackupSummary {
    BackupRun::new(config, Arc::new(session) as Arc<dyn EngineSession>, catalog(engine))
        .unwrap()
        .with_policy(fast_policy())
        .execute()
        .unwrap()
}

fn read_page_of(path: &Path, page_no: usize) -> Vec<u8> {
    fs::read(path).unwrap()[page_no * PAGE_SIZE..(page_no + 1) * PAGE_SIZE].to_vec()
}

/// Every live tablespace of the engine matches the prepared copy
fn assert_matches_engine(engine: &SimEngine, prepared: &Path) {
    for name in engine.tablespace_names() {
        let file = format!("{}.ibd", name);
        assert_eq!(
            fs::read(prepared.join(&file)).unwrap(),
            fs::read(engine.file_path(&name)).unwrap(),
            "{} differs after prepare",
            file
        );
    }
}

#[test]
fn test_prepare_reproduces_engine_state() {
    let engine = two_table_engine();
    let session = SimSession::new(Arc::clone(&engine));
    session.on("stage_flush", |engine| {
        engine.write(5, 2, 0x22);
        engine.rename(5, "db/t1b");
        engine.drop_tablespace(7);
        engine.create_tablespace("db/t3", 9, 3);
        engine.write(9, 2, 0x33);
    });
    session.on("stage_block_ddl", |engine| {
        engine.write(5, 3, 0x44);
        engine.write(9, 1, 0x55);
    });
    let summary = backup(&engine, session, "full", None);
    let target = engine.lock().target("full");

    let report = prepare::prepare(&target).unwrap();
    assert_eq!(report.markers.deleted, vec!["db/t2".to_string()]);
    assert_eq!(
        report.markers.renamed,
        vec![("db/t1".to_string(), "db/t1b".to_string())]
    );
    assert_eq!(report.markers.replaced, vec!["db/t3".to_string()]);
    assert_eq!(report.replay.end_lsn, summary.checkpoints.to_lsn);
    assert!(report.replay.pages_applied >= 2);
    assert!(report.repair.is_clean());

    assert!(!target.join("db/t1.ibd").exists());
    assert!(!target.join("db/t2.ibd").exists());
    assert!(!target.join("db/t1.ren").exists());
    assert!(!target.join("db/t3.new").exists());
    assert_matches_engine(&engine.lock(), &target);

    let checkpoints = Checkpoints::read_from(&target).unwrap();
    assert_eq!(checkpoints.backup_type, BackupType::FullPrepared);
}

#[test]
fn test_rename_out_of_excluded_name_is_restored() {
    let engine = two_table_engine();
    {
        let mut engine = engine.lock();
        engine.create_tablespace("scratch/t9", 9, 3);
        engine.checkpoint();
    }
    let session = SimSession::new(Arc::clone(&engine));
    session.on("stage_flush", |engine| {
        engine.write(9, 1, 0x99);
        engine.rename(9, "db/t9");
    });
    let mut config = engine.lock().config("unexcluded");
    config.exclude = vec!["^scratch/".to_string()];
    let summary = backup_with(&engine, session, config);
    let target = engine.lock().target("unexcluded");

    assert_eq!(summary.reconcile.recopied, vec![(9, "db/t9".to_string())]);
    assert!(target.join("db/t9.new").exists());
    assert!(!target.join("scratch").exists());

    let report = prepare::prepare(&target).unwrap();
    assert_eq!(report.markers.replaced, vec!["db/t9".to_string()]);
    assert_matches_engine(&engine.lock(), &target);
}

#[test]
fn test_corrupted_allocated_page_fails_prepare() {
    let engine = two_table_engine();
    engine.lock().tear(5, 2);
    let session = SimSession::new(Arc::clone(&engine));
    // Lands in the log after the copy was taken
    session.on("stage_block_ddl", |engine| { engine.write(5, 2, 0x22); });
    let mut config = engine.lock().config("torn");
    config.log_corrupted_pages = true;
    config.page_read_retries = 2;
    let summary = backup_with(&engine, session, config);
    let target = engine.lock().target("torn");
    assert_eq!(summary.corrupted_pages, 1);

    let err = prepare::prepare(&target).unwrap_err();
    assert_eq!(err.code(), PrepareErrorCode::AeroPrepareUnrepairable);

    // The logged write was not layered over the zero-filled copy
    assert!(read_page_of(&target.join("db/t1.ibd"), 2)
        .iter()
        .all(|b| *b == 0));
    let left = CorruptedPages::read_from(&target).unwrap();
    assert!(left.contains(PageId::new(5, 2)));
    assert_eq!(left.page_count(), 1);
}

#[test]
fn test_corrupted_free_page_is_zero_filled() {
    let engine = two_table_engine();
    {
        let mut engine = engine.lock();
        engine.free_page(7, 3);
        engine.tear(7, 3);
    }
    let session = SimSession::new(Arc::clone(&engine));
    session.on("stage_block_ddl", |engine| { engine.write(7, 1, 0x71); });
    let mut config = engine.lock().config("torn-free");
    config.log_corrupted_pages = true;
    config.page_read_retries = 2;
    let summary = backup_with(&engine, session, config);
    let target = engine.lock().target("torn-free");
    assert_eq!(summary.corrupted_pages, 1);
    assert!(target.join(CORRUPTED_PAGES_FILE).exists());

    let report = prepare::prepare(&target).unwrap();
    assert_eq!(report.repair.zero_filled, vec![PageId::new(7, 3)]);
    assert!(report.repair.rebuilt.is_empty());
    assert!(!target.join(CORRUPTED_PAGES_FILE).exists());

    let prepared = target.join("db/t2.ibd");
    assert!(read_page_of(&prepared, 3).iter().all(|b| *b == 0));
    assert_eq!(
        read_page_of(&prepared, 1),
        read_page_of(&engine.lock().file_path("db/t2"), 1)
    );
    assert_eq!(
        fs::read(target.join("db/t1.ibd")).unwrap(),
        fs::read(engine.lock().file_path("db/t1")).unwrap()
    );
}

#[test]
fn test_prepare_twice_is_rejected() {
    let engine = two_table_engine();
    backup(&engine, SimSession::new(Arc::clone(&engine)), "twice", None);
    let target = engine.lock().target("twice");

    prepare::prepare(&target).unwrap();
    let err = prepare::prepare(&target).unwrap_err();
    assert_eq!(err.code(), PrepareErrorCode::AeroPrepareInvalidBackup);
    assert!(err.message().contains("already prepared"));
}

#[test]
fn test_incremental_applies_onto_prepared_base() {
    let engine = two_table_engine();
    let base = backup(&engine, SimSession::new(Arc::clone(&engine)), "base", None);
    let base_dir = engine.lock().target("base");
    prepare::prepare(&base_dir).unwrap();

    // Changes between the two backups reach the incremental as deltas
    {
        let mut engine = engine.lock();
        engine.write(7, 2, 0x66);
        engine.create_tablespace("db/t4", 11, 2);
        engine.checkpoint();
    }
    let session = SimSession::new(Arc::clone(&engine));
    session.on("stage_flush", |engine| {
        engine.write(5, 3, 0x77);
    });
    let inc = backup(
        &engine,
        session,
        "inc",
        Some(base.checkpoints.to_lsn.get()),
    );
    let inc_dir = engine.lock().target("inc");
    assert_eq!(inc.checkpoints.backup_type, BackupType::Incremental);
    assert_eq!(inc.checkpoints.from_lsn, base.checkpoints.to_lsn);
    assert!(inc_dir.join("db/t2.ibd.delta").exists());
    assert!(inc_dir.join("db/t2.ibd.meta").exists());

    let report = prepare::apply_incremental(&base_dir, &inc_dir).unwrap();
    assert_eq!(report.deltas.created, 1);
    assert!(report.deltas.pages >= 3);

    let merged = Checkpoints::read_from(&base_dir).unwrap();
    assert_eq!(merged.backup_type, BackupType::FullPrepared);
    assert_eq!(merged.to_lsn, inc.checkpoints.to_lsn);
    assert_matches_engine(&engine.lock(), &base_dir);
}

#[test]
fn test_incremental_needs_matching_base() {
    let engine = two_table_engine();
    backup(&engine, SimSession::new(Arc::clone(&engine)), "base", None);
    let base_dir = engine.lock().target("base");
    prepare::prepare(&base_dir).unwrap();

    engine.lock().write(7, 2, 0x66);
    backup(&engine, SimSession::new(Arc::clone(&engine)), "inc", Some(1));
    let inc_dir = engine.lock().target("inc");

    let err = prepare::apply_incremental(&base_dir, &inc_dir).unwrap_err();
    assert_eq!(err.code(), PrepareErrorCode::AeroPrepareIncremental);
}

#[test]
fn test_incremental_is_not_prepared_alone() {
    let engine = two_table_engine();
    backup(&engine, SimSession::new(Arc::clone(&engine)), "inc", Some(1));
    let inc_dir = engine.lock().target("inc");

    let err = prepare::prepare(&inc_dir).unwrap_err();
    assert_eq!(err.code(), PrepareErrorCode::AeroPrepareInvalidBackup);
}

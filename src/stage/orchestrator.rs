//! Staged backup protocol
//!
//! Start → Flush → BlockDdl → BlockCommit → End, on the calling thread.
//! The log copy runs on its own thread for the whole run; tablespace
//! copies run on the worker pool. Any failure stops both, releases the
//! engine locks on a best-effort basis, and leaves no `aero_checkpoints`
//! behind.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::backoff::{BackoffPolicy, Clock, SystemClock};
use crate::config::{BackupConfig, StreamFormat};
use crate::copier::{
    ChangedPageBitmap, CopierOptions, CopyPass, DirectorySink, FileCopier, IoThrottle, Lz4Sink,
    PassReport, ReadFilter, Sink, TarSink, WorkerPool, WriteFilter, LZ4_SUFFIX,
};
use crate::corrupted::CORRUPTED_PAGES_FILE;
use crate::ddl::{reconcile, DdlGuard, ReconcileReport};
use crate::engine::{EngineSession, TablespaceCatalog};
use crate::filter::NameFilter;
use crate::metadata::{BackupInfo, BackupType, Checkpoints, BACKUP_INFO_FILE, CHECKPOINTS_FILE};
use crate::observability::Logger;
use crate::page::SpaceId;
use crate::redo::{
    truncate_at, LogTailer, Lsn, RedoError, RedoErrorCode, TailerConfig, TailerHandle,
    TailerSummary, WaitOutcome, BACKUP_LOG_NAME, DEFAULT_BATCH_BYTES,
};
use crate::session::BackupContext;

use super::errors::{BackupError, BackupResult};
use super::stages::{BackupStage, StageCursor};

/// Archive written when streaming to tar
pub const STREAM_ARCHIVE_NAME: &str = "backup.tar";
const SPOOL_DIR: &str = ".spool";

/// What a successful run produced
#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub checkpoints: Checkpoints,
    pub info: BackupInfo,
    pub initial_pass: PassReport,
    pub flush_pass: PassReport,
    pub reconcile: ReconcileReport,
    pub log: TailerSummary,
    /// Pages left in the corrupted-page list
    pub corrupted_pages: usize,
}

/// Background pieces that must be stopped when the run ends
#[derive(Default)]
struct Resources {
    tailer: Option<TailerHandle>,
    pool: Option<WorkerPool>,
    throttle: Option<Arc<IoThrottle>>,
}

impl Resources {
    fn pool(&self) -> BackupResult<&WorkerPool> {
        self.pool.as_ref().ok_or_else(|| {
            BackupError::copy_failed(crate::copier::CopyError::aborted("copy pool is gone"))
        })
    }

    fn take_tailer(&mut self) -> BackupResult<TailerHandle> {
        self.tailer
            .take()
            .ok_or_else(|| BackupError::log_copy_failed(RedoError::task_failed("log copy is not running")))
    }

    fn teardown(&mut self) {
        if let Some(tailer) = self.tailer.take() {
            let _ = tailer.stop();
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        if let Some(throttle) = self.throttle.take() {
            throttle.shutdown();
        }
    }
}

impl Drop for Resources {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// One backup run against a live engine
pub struct BackupRun {
    config: BackupConfig,
    engine: Arc<dyn EngineSession>,
    catalog: Arc<dyn TablespaceCatalog>,
    ctx: Arc<BackupContext>,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn BackoffPolicy>,
    cursor: StageCursor,
    locked: bool,
}

impl BackupRun {
    pub fn new(
        config: BackupConfig,
        engine: Arc<dyn EngineSession>,
        catalog: Arc<dyn TablespaceCatalog>,
    ) -> BackupResult<Self> {
        config.validate().map_err(BackupError::config)?;
        if let Some(severity) = config.log_severity() {
            Logger::init(severity);
        }
        let policy = config.policy();
        Ok(Self {
            config,
            engine,
            catalog,
            ctx: Arc::new(BackupContext::new()),
            clock: Arc::new(SystemClock),
            policy,
            cursor: StageCursor::new(),
            locked: false,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Shared state of the run; the engine's log-apply path feeds
    /// `context().feed`
    pub fn context(&self) -> &Arc<BackupContext> {
        &self.ctx
    }

    pub fn stage(&self) -> Option<BackupStage> {
        self.cursor.current()
    }

    pub fn execute(mut self) -> BackupResult<BackupSummary> {
        let started = Utc::now();
        Logger::info(
            "BACKUP_STARTED",
            &[
                ("datadir", &self.config.datadir.display().to_string()),
                ("no_lock", &self.config.no_lock.to_string()),
                ("parallel", &self.config.parallel.to_string()),
                ("target_dir", &self.config.target_dir.display().to_string()),
            ],
        );

        let mut resources = Resources::default();
        let result = self.run(&mut resources, started);
        if let Err(err) = &result {
            self.abort(&mut resources, err);
        }
        result
    }

    fn abort(&mut self, resources: &mut Resources, err: &BackupError) {
        self.ctx.stop.request();
        resources.teardown();
        if self.locked {
            self.locked = false;
            if let Err(e) = self.engine.unlock_all() {
                Logger::warn("UNLOCK_FAILED", &[("error", &e.to_string())]);
            }
        }
        self.withdraw_metadata();
        let stage = self.cursor.current().map_or("none", |s| s.as_str());
        Logger::fatal(
            "BACKUP_FAILED",
            &[("error", &err.to_string()), ("stage", stage)],
        );
    }

    fn run(&mut self, res: &mut Resources, started: DateTime<Utc>) -> BackupResult<BackupSummary> {
        let target_dir = self.config.target_dir.clone();
        fs::create_dir_all(&target_dir)
            .map_err(|e| BackupError::metadata("cannot create target directory", e))?;

        let filter = Arc::new(self.config.name_filter().map_err(BackupError::config)?);
        let sink = self.build_sink(&target_dir)?;
        if let Some(ops) = self.config.io_throttle {
            res.throttle = Some(
                IoThrottle::start(ops)
                    .map_err(|e| BackupError::metadata("cannot start the IO throttle", e))?,
            );
        }
        let copier = Arc::new(self.build_copier(Arc::clone(&sink), Arc::clone(&filter), res)?);
        res.pool = Some(
            WorkerPool::new(self.config.parallel, "aero-copy")
                .map_err(|e| BackupError::metadata("cannot start copy workers", e))?,
        );

        let known = self
            .catalog
            .tablespaces()
            .map_err(|e| BackupError::rpc_failed(BackupStage::Start, e))?;
        self.ctx
            .tracker
            .seed_known(known.iter().map(|ts| ts.name.as_str()));

        // Start
        self.enter(BackupStage::Start)?;
        if !self.config.no_lock {
            self.engine
                .stage_start()
                .map_err(|e| BackupError::rpc_failed(BackupStage::Start, e))?;
            self.locked = true;
        }
        let tailer = LogTailer::open(
            &self.config.log_file,
            &target_dir,
            Arc::clone(&self.ctx),
            TailerConfig {
                transport: self.config.transport,
                batch_bytes: DEFAULT_BATCH_BYTES,
                policy: Arc::clone(&self.policy),
                clock: Arc::clone(&self.clock),
            },
        )
        .map_err(BackupError::log_copy_failed)?;
        let log_start = tailer.start_lsn();
        res.tailer = Some(tailer.spawn().map_err(BackupError::log_copy_failed)?);

        let initial_pass = copier
            .run_pass(res.pool()?, CopyPass::Initial)
            .map_err(BackupError::copy_failed)?;
        if !self.ctx.progress.wait_first_pass(self.deadline()) {
            return Err(self.tailer_failure(res, "log copy did not complete its first pass"));
        }

        // Flush
        self.enter(BackupStage::Flush)?;
        self.engine
            .stage_flush()
            .map_err(|e| BackupError::rpc_failed(BackupStage::Flush, e))?;
        // Structural changes up to the flush must be tracked before the
        // flush pass decides what to copy again
        let flush_lsn = self
            .engine
            .current_lsn()
            .map_err(|e| BackupError::rpc_failed(BackupStage::Flush, e))?;
        self.wait_lsn(flush_lsn, res)?;
        let flush_pass = copier
            .run_pass(res.pool()?, CopyPass::Flush)
            .map_err(BackupError::copy_failed)?;

        // BlockDdl
        self.enter(BackupStage::BlockDdl)?;
        if !self.config.no_lock {
            self.engine
                .stage_block_ddl()
                .map_err(|e| BackupError::rpc_failed(BackupStage::BlockDdl, e))?;
        }
        let ddl_lsn = self
            .engine
            .current_lsn()
            .map_err(|e| BackupError::rpc_failed(BackupStage::BlockDdl, e))?;
        self.wait_lsn(ddl_lsn, res)?;

        let guard = Arc::new(DdlGuard::new(self.config.no_lock, Arc::clone(&filter)));
        self.ctx.feed.install(guard.clone());
        let snapshot = self.ctx.tracker.snapshot();

        if self.config.log_corrupted_pages {
            // Entries of tablespaces about to be copied again are stale
            let mut recopy: BTreeSet<SpaceId> = snapshot
                .created
                .keys()
                .filter(|id| !snapshot.is_dropped(**id))
                .copied()
                .collect();
            recopy.extend(snapshot.uncopied_renames().map(|(id, _)| id));
            recopy.extend(snapshot.deferred.values().copied());
            self.ctx.corrupted.apply_ddl(&snapshot, &recopy);
        }

        let reconcile_report = reconcile(&snapshot, copier.as_ref(), sink.as_ref(), &filter)
            .map_err(BackupError::reconcile_failed)?;
        if let Some(event) = guard.violation() {
            return Err(BackupError::unexpected_ddl(&event));
        }
        if self.config.log_corrupted_pages {
            self.ctx
                .corrupted
                .write_to(&target_dir)
                .map_err(|e| BackupError::metadata("cannot write the corrupted page list", e))?;
        }

        // BlockCommit
        self.enter(BackupStage::BlockCommit)?;
        if !self.config.no_lock {
            self.engine
                .stage_block_commit()
                .map_err(|e| BackupError::rpc_failed(BackupStage::BlockCommit, e))?;
        }
        let to_lsn = self
            .engine
            .current_lsn()
            .map_err(|e| BackupError::rpc_failed(BackupStage::BlockCommit, e))?;
        self.ctx.progress.set_target(to_lsn);
        self.wait_lsn(to_lsn, res)?;

        let log = res
            .take_tailer()?
            .finish(to_lsn)
            .map_err(BackupError::log_copy_failed)?;
        if let Some(event) = guard.violation() {
            return Err(BackupError::unexpected_ddl(&event));
        }
        truncate_at(&target_dir.join(BACKUP_LOG_NAME), to_lsn)
            .map_err(BackupError::log_copy_failed)?;

        let checkpoints = Checkpoints {
            backup_type: match self.config.incremental_lsn {
                Some(_) => BackupType::Incremental,
                None => BackupType::FullBackuped,
            },
            from_lsn: self.config.incremental_base().unwrap_or(log_start),
            to_lsn,
            last_lsn: log.scanned_lsn,
            recover_binlog_info: self.config.recover_binlog_info,
        };
        checkpoints
            .write_to(&target_dir)
            .map_err(|e| BackupError::metadata("cannot write backup metadata", e))?;
        Logger::info(
            "BACKUP_METADATA_WRITTEN",
            &[
                ("from_lsn", &checkpoints.from_lsn.to_string()),
                ("last_lsn", &checkpoints.last_lsn.to_string()),
                ("to_lsn", &checkpoints.to_lsn.to_string()),
            ],
        );

        // End
        self.enter(BackupStage::End)?;
        if self.locked {
            self.locked = false;
            self.engine
                .unlock_all()
                .map_err(|e| BackupError::rpc_failed(BackupStage::End, e))?;
        }
        res.teardown();

        let mut info = BackupInfo::new(&checkpoints, started, self.ctx.metrics.snapshot());
        info.no_lock = self.config.no_lock;
        info.compressed = self.config.compress;
        info.streamed = self.config.stream.is_some();
        info.write_to(&target_dir)
            .map_err(|e| BackupError::metadata("cannot write backup info", e))?;

        if !sink.is_directory_at(&target_dir) {
            self.export_local_files(sink.as_ref(), &target_dir)?;
        }
        sink.finish().map_err(BackupError::copy_failed)?;

        let corrupted_pages = self.ctx.corrupted.page_count();
        Logger::info(
            "BACKUP_COMPLETE",
            &[
                ("corrupted_pages", &corrupted_pages.to_string()),
                ("files_copied", &info.metrics.files_copied.to_string()),
                ("to_lsn", &to_lsn.to_string()),
            ],
        );

        Ok(BackupSummary {
            checkpoints,
            info,
            initial_pass,
            flush_pass,
            reconcile: reconcile_report,
            log,
            corrupted_pages,
        })
    }

    /// Removes whatever a restore would accept as a finished backup.
    /// Metadata is written before End, so End can still fail after it.
    fn withdraw_metadata(&self) {
        let target_dir = &self.config.target_dir;
        if !target_dir.join(CHECKPOINTS_FILE).exists() {
            return;
        }
        let mut paths = Vec::new();
        for name in [CHECKPOINTS_FILE, BACKUP_INFO_FILE] {
            paths.push(target_dir.join(name));
            paths.push(target_dir.join(format!("{}{}", name, LZ4_SUFFIX)));
        }
        // The archive may already carry the metadata
        if self.config.stream.is_some() {
            paths.push(target_dir.join(STREAM_ARCHIVE_NAME));
        }
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => Logger::warn(
                    "BACKUP_METADATA_WITHDRAWN",
                    &[("path", &path.display().to_string())],
                ),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => Logger::error(
                    "BACKUP_METADATA_WITHDRAW_FAILED",
                    &[("error", &e.to_string()), ("path", &path.display().to_string())],
                ),
            }
        }
    }

    fn enter(&mut self, stage: BackupStage) -> BackupResult<()> {
        self.cursor.advance(stage)?;
        Logger::info(
            "STAGE_ENTERED",
            &[
                ("scanned_lsn", &self.ctx.progress.scanned().to_string()),
                ("stage", stage.as_str()),
            ],
        );
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.config.lsn_wait_timeout().map(|t| Instant::now() + t)
    }

    /// Waits for the log copy to reach `lsn`; anything short is fatal
    fn wait_lsn(&self, lsn: Lsn, res: &mut Resources) -> BackupResult<Lsn> {
        let wait = self
            .ctx
            .progress
            .wait_for(lsn, self.deadline(), self.policy.as_ref());
        Logger::info(
            "LSN_WAIT",
            &[
                ("outcome", &format!("{:?}", wait.outcome)),
                ("reached", &wait.reached.to_string()),
                ("requested", &lsn.to_string()),
            ],
        );
        match wait.outcome {
            WaitOutcome::Reached => Ok(wait.reached),
            WaitOutcome::TimedOut => Err(BackupError::log_capacity(
                lsn,
                wait.reached,
                Some("timed out waiting for the log copy".to_string()),
            )),
            WaitOutcome::TailerStopped => match res.tailer.take().map(TailerHandle::stop) {
                Some(Err(e)) if e.code() == RedoErrorCode::AeroRedoOverrun => {
                    Err(BackupError::log_capacity(lsn, wait.reached, Some(e.to_string())))
                }
                Some(Err(e)) => Err(BackupError::log_copy_failed(e)),
                _ => Err(BackupError::log_capacity(lsn, wait.reached, None)),
            },
        }
    }

    fn tailer_failure(&self, res: &mut Resources, reason: &str) -> BackupError {
        match res.tailer.take().map(TailerHandle::stop) {
            Some(Err(e)) => BackupError::log_copy_failed(e),
            _ => BackupError::log_copy_failed(RedoError::task_failed(reason)),
        }
    }

    fn build_sink(&self, target_dir: &Path) -> BackupResult<Arc<dyn Sink>> {
        let base: Arc<dyn Sink> = match self.config.stream {
            Some(StreamFormat::Tar) => Arc::new(
                TarSink::create(
                    &target_dir.join(STREAM_ARCHIVE_NAME),
                    &target_dir.join(SPOOL_DIR),
                )
                .map_err(BackupError::copy_failed)?,
            ),
            None => Arc::new(DirectorySink::new(target_dir)),
        };
        if self.config.compress {
            Ok(Arc::new(Lz4Sink::new(base)))
        } else {
            Ok(base)
        }
    }

    fn build_copier(
        &self,
        sink: Arc<dyn Sink>,
        filter: Arc<NameFilter>,
        res: &Resources,
    ) -> BackupResult<FileCopier> {
        let read_filter = match &self.config.changed_pages {
            Some(path) => ReadFilter::ChangedPages(
                ChangedPageBitmap::load(path).map_err(BackupError::copy_failed)?,
            ),
            None => ReadFilter::FullScan,
        };
        let write_filter = match self.config.incremental_base() {
            Some(base_lsn) => WriteFilter::Delta { base_lsn },
            None => WriteFilter::Identity,
        };
        let options = CopierOptions {
            read_filter,
            write_filter,
            filter,
            log_corrupted_pages: self.config.log_corrupted_pages,
            page_read_retries: self.config.page_read_retries,
            policy: Arc::clone(&self.policy),
            clock: Arc::clone(&self.clock),
        };
        let copier = FileCopier::new(
            Arc::clone(&self.catalog),
            sink,
            Arc::clone(&self.ctx),
            options,
        );
        Ok(match &res.throttle {
            Some(throttle) => copier.with_throttle(Arc::clone(throttle)),
            None => copier,
        })
    }

    /// Copies the files written locally into a streaming or compressing sink
    fn export_local_files(&self, sink: &dyn Sink, target_dir: &Path) -> BackupResult<()> {
        for name in [
            BACKUP_LOG_NAME,
            CORRUPTED_PAGES_FILE,
            CHECKPOINTS_FILE,
            BACKUP_INFO_FILE,
        ] {
            let path = target_dir.join(name);
            if !path.exists() {
                continue;
            }
            sink.import_file(name, &path)
                .map_err(BackupError::copy_failed)?;
        }
        Ok(())
    }
}

//! Tablespace file copier
//!
//! Each tablespace is copied by one pool job: open (with retries), read in
//! page batches through the read filter, validate every page, then hand the
//! pages to the write filter. Pages that keep failing validation are either
//! recorded in the corrupted-page registry and zero-filled, or abort the
//! run.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::backoff::{retry, BackoffPolicy, Clock, SystemClock};
use crate::ddl::{FreshCopyError, ReconcileSource, NEW_COPY_SUFFIX};
use crate::engine::{tablespace_file_name, TablespaceCatalog, TablespaceInfo};
use crate::filter::NameFilter;
use crate::observability::Logger;
use crate::page::{
    read_fsp_header, read_page, read_pages, verify_at, PageId, PageNo, PageStatus, SpaceId,
    PAGE_SIZE,
};
use crate::session::BackupContext;

use super::errors::{CopyError, CopyErrorCode, CopyResult};
use super::filters::{PageWriter, ReadFilter, WriteFilter};
use super::pool::WorkerPool;
use super::sink::Sink;
use super::throttle::IoThrottle;

/// Pages read per batch
pub const COPY_BATCH_PAGES: usize = 64;

const PAGE_REREAD_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPass {
    /// Every selected tablespace
    Initial,
    /// Tablespaces not copied yet or changed since their copy
    Flush,
}

impl std::fmt::Display for CopyPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyPass::Initial => write!(f, "initial"),
            CopyPass::Flush => write!(f, "flush"),
        }
    }
}

/// Outcome of copying one tablespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Copied { pages: u64, zero_filled: u64 },
    /// Dropped or renamed away before it could be read
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub files_copied: u64,
    pub files_skipped: u64,
    pub pages_copied: u64,
    pub pages_zero_filled: u64,
}

impl PassReport {
    fn add(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Copied { pages, zero_filled } => {
                self.files_copied += 1;
                self.pages_copied += pages;
                self.pages_zero_filled += zero_filled;
            }
            FileOutcome::Skipped => self.files_skipped += 1,
        }
    }
}

/// Size and modification time of a source file when its copy started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedFile {
    pub name: String,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Clone)]
pub struct CopierOptions {
    pub read_filter: ReadFilter,
    pub write_filter: WriteFilter,
    pub filter: Arc<NameFilter>,
    pub log_corrupted_pages: bool,
    /// Re-reads of a page that fails validation before it counts as corrupted
    pub page_read_retries: u32,
    pub policy: Arc<dyn BackoffPolicy>,
    pub clock: Arc<dyn Clock>,
}

impl Default for CopierOptions {
    fn default() -> Self {
        Self {
            read_filter: ReadFilter::FullScan,
            write_filter: WriteFilter::Identity,
            filter: Arc::new(NameFilter::allow_all()),
            log_corrupted_pages: false,
            page_read_retries: 10,
            policy: crate::backoff::default_policy(),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct FileCopier {
    catalog: Arc<dyn TablespaceCatalog>,
    sink: Arc<dyn Sink>,
    ctx: Arc<BackupContext>,
    options: CopierOptions,
    throttle: Option<Arc<IoThrottle>>,
    copied: Mutex<BTreeMap<SpaceId, CopiedFile>>,
}

impl FileCopier {
    pub fn new(
        catalog: Arc<dyn TablespaceCatalog>,
        sink: Arc<dyn Sink>,
        ctx: Arc<BackupContext>,
        options: CopierOptions,
    ) -> Self {
        Self {
            catalog,
            sink,
            ctx,
            options,
            throttle: None,
            copied: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_throttle(mut self, throttle: Arc<IoThrottle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub fn copied_files(&self) -> BTreeMap<SpaceId, CopiedFile> {
        self.copied.lock().clone()
    }

    /// Open tablespaces that pass the name filters
    pub fn select(&self) -> CopyResult<Vec<TablespaceInfo>> {
        let all = self
            .catalog
            .tablespaces()
            .map_err(|e| CopyError::aborted(format!("cannot list tablespaces: {}", e)))?;
        Ok(all
            .into_iter()
            .filter(|ts| self.options.filter.is_included(&ts.name))
            .collect())
    }

    pub fn needs_copy(&self, ts: &TablespaceInfo, pass: CopyPass) -> bool {
        let tracker = &self.ctx.tracker;
        if tracker.is_dropped(ts.id) {
            return false;
        }
        match pass {
            CopyPass::Initial => true,
            CopyPass::Flush => {
                // Reconciliation rewrites these as `.new` or `.ren`
                if tracker.is_created_or_renamed(ts.id) {
                    return false;
                }
                let copied = self.copied.lock();
                match copied.get(&ts.id) {
                    None => true,
                    Some(previous) => match file_state(ts) {
                        Some((len, modified)) => {
                            previous.name != ts.name
                                || previous.len != len
                                || previous.modified != modified
                        }
                        None => false,
                    },
                }
            }
        }
    }

    /// Copies every selected tablespace that needs it on `pool`.
    ///
    /// The first failing job aborts the pass; jobs not yet started are
    /// skipped and the failure is returned once the pool is idle.
    pub fn run_pass(self: &Arc<Self>, pool: &WorkerPool, pass: CopyPass) -> CopyResult<PassReport> {
        let selected = self.select()?;
        let report = Arc::new(Mutex::new(PassReport::default()));
        let failure: Arc<Mutex<Option<CopyError>>> = Arc::new(Mutex::new(None));

        Logger::info(
            "COPY_PASS_STARTED",
            &[("pass", &pass.to_string()), ("tablespaces", &selected.len().to_string())],
        );

        for ts in selected {
            if !self.needs_copy(&ts, pass) {
                continue;
            }
            let copier = Arc::clone(self);
            let report = Arc::clone(&report);
            let failure = Arc::clone(&failure);
            pool.execute(move || {
                if failure.lock().is_some() || copier.ctx.stop.is_requested() {
                    return;
                }
                match copier.copy_tablespace(&ts, None) {
                    Ok(outcome) => report.lock().add(outcome),
                    Err(err) => {
                        Logger::error(
                            "COPY_FAILED",
                            &[("error", &err.to_string()), ("name", ts.name.as_str())],
                        );
                        failure.lock().get_or_insert(err);
                    }
                }
            });
        }
        pool.wait_idle();

        if let Some(err) = failure.lock().take() {
            return Err(err);
        }
        let panicked = pool.take_panicked();
        if panicked > 0 {
            return Err(CopyError::aborted(format!("{} copy jobs panicked", panicked)));
        }
        if self.ctx.stop.is_requested() {
            return Err(CopyError::aborted("copy pass interrupted by stop request"));
        }

        let report = *report.lock();
        Logger::info(
            "COPY_PASS_COMPLETE",
            &[
                ("files_copied", &report.files_copied.to_string()),
                ("files_skipped", &report.files_skipped.to_string()),
                ("pages_copied", &report.pages_copied.to_string()),
                ("pages_zero_filled", &report.pages_zero_filled.to_string()),
                ("pass", &pass.to_string()),
            ],
        );
        Ok(report)
    }

    /// Copies one tablespace.
    ///
    /// Without a suffix the copy goes to `<name>.ibd` through the write
    /// filter and a source that stays unopenable is skipped only when the
    /// tracker has seen a drop or rename for it. With a suffix the copy is
    /// always a full one under `<name><suffix>`.
    pub fn copy_tablespace(&self, ts: &TablespaceInfo, suffix: Option<&str>) -> CopyResult<FileOutcome> {
        if suffix.is_none() && self.ctx.tracker.is_dropped(ts.id) {
            self.ctx.metrics.increment_files_skipped();
            return Ok(FileOutcome::Skipped);
        }

        let state = file_state(ts);
        let mut first_page: PageNo = 0;
        let mut pages = 0;
        let mut zero_filled = 0;

        for (idx, path) in ts.files.iter().enumerate() {
            let file = match self.open_source(path) {
                Ok(file) => file,
                Err(err) if suffix.is_none() && self.ctx.tracker.corroborates_missing(ts.id) => {
                    Logger::warn(
                        "TABLESPACE_SKIPPED",
                        &[("error", &err.to_string()), ("name", ts.name.as_str())],
                    );
                    self.ctx.metrics.increment_files_skipped();
                    return Ok(FileOutcome::Skipped);
                }
                Err(err) => return Err(err),
            };

            let dest = destination_name(&ts.name, idx, suffix);
            let write_filter = match suffix {
                Some(_) => WriteFilter::Identity,
                None => self.options.write_filter,
            };
            let mut writer = write_filter.open(self.sink.as_ref(), &dest, ts.id)?;
            let read_filter = match suffix {
                Some(_) => &ReadFilter::FullScan,
                None => &self.options.read_filter,
            };
            let (read, zeroed) =
                self.copy_file(ts, path, &file, first_page, read_filter, writer.as_mut())?;
            writer.finish()?;

            first_page += read as PageNo;
            pages += read;
            zero_filled += zeroed;
        }

        if suffix.is_none() {
            self.ctx.tracker.record_copied(ts.id, &ts.name);
            if let Some((len, modified)) = state {
                self.copied.lock().insert(
                    ts.id,
                    CopiedFile {
                        name: ts.name.clone(),
                        len,
                        modified,
                    },
                );
            }
        }
        self.ctx.metrics.increment_files_copied();
        self.ctx.metrics.add_pages_copied(pages);

        Logger::trace(
            "TABLESPACE_COPIED",
            &[
                ("name", ts.name.as_str()),
                ("pages", &pages.to_string()),
                ("space_id", &ts.id.to_string()),
                ("suffix", suffix.unwrap_or("")),
            ],
        );
        Ok(FileOutcome::Copied { pages, zero_filled })
    }

    fn open_source(&self, path: &Path) -> CopyResult<File> {
        retry(
            self.options.policy.as_ref(),
            self.options.clock.as_ref(),
            &self.ctx.stop,
            |_| File::open(path),
        )
        .map_err(|e| CopyError::source_missing(path, e))
    }

    /// Reads one data file; returns (pages read, pages zero-filled)
    fn copy_file(
        &self,
        ts: &TablespaceInfo,
        path: &Path,
        file: &File,
        first_page: PageNo,
        read_filter: &ReadFilter,
        writer: &mut dyn PageWriter,
    ) -> CopyResult<(u64, u64)> {
        let len = file
            .metadata()
            .map_err(|e| CopyError::source_read(path, e))?
            .len();
        let page_count = (len / PAGE_SIZE as u64) as PageNo;
        let ranges = read_filter
            .ranges(ts.id, page_count)
            .unwrap_or_else(|| vec![0..PageNo::MAX]);

        let mut buf = vec![0u8; COPY_BATCH_PAGES * PAGE_SIZE];
        let mut read_total = 0u64;
        let mut zero_filled = 0u64;

        for range in ranges {
            let mut local = range.start;
            while local < range.end {
                if self.ctx.stop.is_requested() {
                    return Err(CopyError::aborted("copy interrupted by stop request"));
                }
                let want = (range.end - local).min(COPY_BATCH_PAGES as PageNo) as usize;
                self.throttle();
                let got = read_pages(file, local, &mut buf[..want * PAGE_SIZE])
                    .map_err(|e| CopyError::source_read(path, e))?;
                if got == 0 {
                    break;
                }

                for idx in 0..got {
                    let page = &mut buf[idx * PAGE_SIZE..(idx + 1) * PAGE_SIZE];
                    let local_no = local + idx as PageNo;
                    let id = PageId::new(ts.id, first_page + local_no);
                    if verify_at(page, id) == PageStatus::Corrupted
                        && !self.reread(ts, path, file, local_no, id, page)?
                    {
                        zero_filled += 1;
                    }
                }

                self.throttle();
                writer.write_pages(local, &buf[..got * PAGE_SIZE])?;
                read_total += got as u64;
                local += got as PageNo;
                if got < want {
                    break;
                }
            }
        }
        Ok((read_total, zero_filled))
    }

    /// Re-reads a page that failed validation. Returns `false` when it was
    /// recorded as corrupted and zero-filled.
    fn reread(
        &self,
        ts: &TablespaceInfo,
        path: &Path,
        file: &File,
        local_no: PageNo,
        id: PageId,
        page: &mut [u8],
    ) -> CopyResult<bool> {
        let retries = self.options.page_read_retries;
        for _ in 0..retries {
            if self
                .options
                .clock
                .sleep_unless(&self.ctx.stop, PAGE_REREAD_DELAY)
            {
                return Err(CopyError::aborted("copy interrupted by stop request"));
            }
            self.throttle();
            let complete =
                read_page(file, local_no, page).map_err(|e| CopyError::source_read(path, e))?;
            if complete && verify_at(page, id) != PageStatus::Corrupted {
                return Ok(true);
            }
        }

        if !self.options.log_corrupted_pages {
            return Err(CopyError::corrupted_page(&ts.name, id, retries + 1));
        }
        Logger::warn(
            "PAGE_CORRUPTED",
            &[("name", ts.name.as_str()), ("page", &id.to_string())],
        );
        self.ctx.corrupted.add(&ts.name, id);
        self.ctx.metrics.increment_pages_zero_filled();
        page.fill(0);
        Ok(false)
    }

    fn throttle(&self) {
        if let Some(throttle) = &self.throttle {
            throttle.acquire();
        }
    }
}

impl ReconcileSource for FileCopier {
    fn copy_fresh(&self, space_id: SpaceId, name: &str) -> Result<(), FreshCopyError> {
        let ts = self.catalog.locate(space_id, name);
        match self.copy_tablespace(&ts, Some(NEW_COPY_SUFFIX)) {
            Ok(_) => Ok(()),
            Err(err) if err.code() == CopyErrorCode::AeroCopySourceMissing => {
                Err(FreshCopyError::OpenFailed(err.to_string()))
            }
            Err(err) => Err(FreshCopyError::Failed(err.to_string())),
        }
    }

    fn probe(&self, space_id: SpaceId, name: &str) -> bool {
        let ts = self.catalog.locate(space_id, name);
        let Some(path) = ts.files.first() else {
            return false;
        };
        let Ok(file) = File::open(path) else {
            return false;
        };
        matches!(read_fsp_header(&file), Ok(Some(fsp)) if fsp.space_id == space_id)
    }
}

/// Relative destination of data file `idx` of a tablespace
pub fn destination_name(name: &str, idx: usize, suffix: Option<&str>) -> String {
    let base = match suffix {
        Some(suffix) => format!("{}{}", name, suffix),
        None => tablespace_file_name(name),
    };
    if idx == 0 {
        base
    } else {
        format!("{}.{}", base, idx)
    }
}

fn file_state(ts: &TablespaceInfo) -> Option<(u64, Option<SystemTime>)> {
    let mut len = 0;
    let mut modified = None;
    for path in &ts.files {
        let meta = std::fs::metadata(path).ok()?;
        len += meta.len();
        modified = modified.max(meta.modified().ok());
    }
    Some((len, modified))
}

//! Background copy of the engine's circular log
//!
//! The tailer owns a cursor into the source log. Each round it collects the
//! complete chunks available at the cursor, appends them to the backup log,
//! delivers their structural records, and only then publishes the new
//! scanned LSN. It never copies a partial chunk.
//!
//! When nothing is available it backs off. Without a target it keeps
//! polling; once a target is set, exhausting the backoff policy ends the
//! task and the LSN wait reports how far it got.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::backoff::{default_policy, BackoffPolicy, Clock, SystemClock};
use crate::ddl::StructuralEvent;
use crate::observability::Logger;
use crate::session::BackupContext;

use super::backup_log::{BackupLogWriter, BACKUP_LOG_NAME};
use super::errors::{RedoError, RedoResult};
use super::lsn::Lsn;
use super::parser::{scan_chunk, ScanOutcome};
use super::record::{Chunk, LogRecord};
use super::ring::LogRing;
use super::transport::{open_source, LogSource, Transport};

/// Upper bound on bytes appended per round
pub const DEFAULT_BATCH_BYTES: usize = 1 << 20;

#[derive(Clone)]
pub struct TailerConfig {
    pub transport: Transport,
    pub batch_bytes: usize,
    pub policy: Arc<dyn BackoffPolicy>,
    pub clock: Arc<dyn Clock>,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            batch_bytes: DEFAULT_BATCH_BYTES,
            policy: default_policy(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Why the tailer ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerExit {
    /// The stop signal was raised
    Stopped,
    /// The scanned LSN reached the target
    TargetReached,
    /// A target was set but no more log appeared within the backoff policy
    GaveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailerSummary {
    pub exit: TailerExit,
    pub start_lsn: Lsn,
    pub scanned_lsn: Lsn,
    pub chunks: u64,
    pub bytes: u64,
}

pub struct LogTailer {
    source: Box<dyn LogSource>,
    ring: LogRing,
    writer: BackupLogWriter,
    start: Lsn,
    cursor: Lsn,
    ctx: Arc<BackupContext>,
    config: TailerConfig,
    chunks: u64,
    bytes: u64,
}

impl LogTailer {
    /// Opens the engine log and creates the backup log in `target_dir`.
    ///
    /// Copying starts at the engine's checkpoint LSN: everything before it
    /// is already reflected in the data files.
    pub fn open(
        log_path: &Path,
        target_dir: &Path,
        ctx: Arc<BackupContext>,
        config: TailerConfig,
    ) -> RedoResult<Self> {
        let mut source = open_source(log_path, config.transport)?;
        let header = source.read_header()?;
        if header.is_backup_copy() {
            return Err(RedoError::invalid_header(format!(
                "{} is a backup copy, not a live log",
                log_path.display()
            )));
        }

        let start = header.checkpoint_lsn;
        let writer = BackupLogWriter::create(&target_dir.join(BACKUP_LOG_NAME), start)?;
        ctx.progress.publish(start);

        Logger::info(
            "LOG_COPY_STARTED",
            &[
                ("capacity", &header.capacity.to_string()),
                ("start_lsn", &start.to_string()),
                ("transport", &config.transport.to_string()),
            ],
        );

        Ok(Self {
            source,
            ring: header.ring(),
            writer,
            start,
            cursor: start,
            ctx,
            config,
            chunks: 0,
            bytes: 0,
        })
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start
    }

    /// LSN up to which the backup log is complete
    pub fn scanned_lsn(&self) -> Lsn {
        self.cursor
    }

    /// Copies every complete chunk currently available, up to one batch.
    ///
    /// Returns the number of chunks copied; zero means the cursor is at the
    /// writer's current end.
    pub fn copy_available(&mut self) -> RedoResult<usize> {
        let mut batch: Vec<Chunk> = Vec::new();
        let mut batch_bytes = 0;
        let mut scan_at = self.cursor;

        loop {
            match scan_chunk(&mut *self.source, &self.ring, scan_at) {
                Ok(ScanOutcome::Complete(chunk)) => {
                    scan_at = chunk.end();
                    batch_bytes += chunk.len();
                    batch.push(chunk);
                    if batch_bytes >= self.config.batch_bytes {
                        break;
                    }
                }
                Ok(ScanOutcome::Incomplete) => {
                    if batch.is_empty() {
                        self.check_overrun()?;
                    }
                    break;
                }
                Err(e) if batch.is_empty() => {
                    return Err(RedoError::source_read(
                        format!("failed to read log at LSN {}", scan_at),
                        e,
                    ));
                }
                // Keep what was read; the next round retries the failing read
                Err(_) => break,
            }
        }

        if batch.is_empty() {
            return Ok(0);
        }

        let mut decoded = Vec::with_capacity(batch.len());
        for chunk in &batch {
            let records = chunk.records().map_err(|e| {
                RedoError::corruption_at(
                    chunk.start(),
                    format!("chunk passed its checksum but does not decode: {}", e),
                )
            })?;
            decoded.push(records);
        }

        let count = batch.len();
        let end = self.writer.append(&mut batch)?;
        self.cursor = end;
        self.chunks += count as u64;
        self.bytes += batch_bytes as u64;
        self.ctx.metrics.add_log_chunks(count as u64, batch_bytes as u64);

        let ctx = &self.ctx;
        ctx.progress.publish_with(end, || {
            for record in decoded.iter().flatten() {
                dispatch(ctx, record);
            }
        });

        Logger::trace(
            "LOG_CHUNKS_COPIED",
            &[("chunks", &count.to_string()), ("scanned_lsn", &end.to_string())],
        );
        Ok(count)
    }

    /// Nothing complete at the cursor and the engine's checkpoint already
    /// past it: the writer has reused the space before it was copied
    fn check_overrun(&mut self) -> RedoResult<()> {
        match self.source.read_header() {
            Ok(header) if header.checkpoint_lsn > self.cursor => {
                Err(RedoError::overrun(self.cursor, header.checkpoint_lsn))
            }
            Ok(_) => Ok(()),
            // A header caught mid-update is re-read next round
            Err(_) => Ok(()),
        }
    }

    /// Starts the copy loop on a dedicated thread
    pub fn spawn(self) -> RedoResult<TailerHandle> {
        let ctx = Arc::clone(&self.ctx);
        let thread = thread::Builder::new()
            .name("aero-log-copy".to_string())
            .spawn(move || self.run())
            .map_err(|e| RedoError::task_failed(format!("cannot start log copy thread: {}", e)))?;
        Ok(TailerHandle {
            ctx,
            thread: Some(thread),
        })
    }

    fn run(mut self) -> RedoResult<TailerSummary> {
        let result = self.run_loop();
        match &result {
            Ok(exit) => {
                self.ctx.progress.mark_stopped(None);
                Logger::info(
                    "LOG_COPY_STOPPED",
                    &[
                        ("chunks", &self.chunks.to_string()),
                        ("exit", &format!("{:?}", exit)),
                        ("scanned_lsn", &self.cursor.to_string()),
                    ],
                );
            }
            Err(e) => {
                self.ctx.progress.mark_stopped(Some(e.to_string()));
                Logger::error(
                    "LOG_COPY_FAILED",
                    &[("error", &e.to_string()), ("scanned_lsn", &self.cursor.to_string())],
                );
            }
        }
        result.map(|exit| TailerSummary {
            exit,
            start_lsn: self.start,
            scanned_lsn: self.cursor,
            chunks: self.chunks,
            bytes: self.bytes,
        })
    }

    fn run_loop(&mut self) -> RedoResult<TailerExit> {
        let policy = Arc::clone(&self.config.policy);
        let clock = Arc::clone(&self.config.clock);
        let mut idle_attempt = 0u32;
        let mut read_failures = 0u32;
        let mut target_seen = false;

        loop {
            let target = self.ctx.progress.target();
            if let Some(target) = target {
                if self.cursor >= target {
                    return Ok(TailerExit::TargetReached);
                }
                if !target_seen {
                    target_seen = true;
                    idle_attempt = 0;
                }
            }
            if self.ctx.stop.is_requested() {
                return Ok(TailerExit::Stopped);
            }

            match self.copy_available() {
                Ok(0) => {
                    read_failures = 0;
                    self.ctx.progress.mark_first_pass();
                    idle_attempt += 1;
                    let delay = match policy.delay(idle_attempt) {
                        Some(delay) => delay,
                        None if target.is_some() => return Ok(TailerExit::GaveUp),
                        None => policy.max_delay(),
                    };
                    if clock.sleep_unless(&self.ctx.stop, delay) {
                        return Ok(TailerExit::Stopped);
                    }
                }
                Ok(_) => {
                    idle_attempt = 0;
                    read_failures = 0;
                }
                Err(e) if e.is_source_read() => {
                    read_failures += 1;
                    Logger::warn(
                        "LOG_READ_RETRY",
                        &[("attempt", &read_failures.to_string()), ("error", &e.to_string())],
                    );
                    match policy.delay(read_failures + 1) {
                        Some(delay) => {
                            if clock.sleep_unless(&self.ctx.stop, delay) {
                                return Ok(TailerExit::Stopped);
                            }
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn dispatch(ctx: &BackupContext, record: &LogRecord) {
    if let Some(event) = StructuralEvent::from_record(record) {
        ctx.metrics.increment_structural_events();
        ctx.feed.on_event(&event);
    } else if let LogRecord::InitPage { page } = record {
        if page.page_no == 0 {
            ctx.feed.on_page_init(page.space);
        }
    }
}

/// Handle to a running tailer
pub struct TailerHandle {
    ctx: Arc<BackupContext>,
    thread: Option<JoinHandle<RedoResult<TailerSummary>>>,
}

impl TailerHandle {
    /// Lets the tailer copy up to `target`, then waits for it to exit
    pub fn finish(mut self, target: Lsn) -> RedoResult<TailerSummary> {
        self.ctx.progress.set_target(target);
        self.join()
    }

    /// Raises the stop signal and waits for the tailer to exit
    pub fn stop(mut self) -> RedoResult<TailerSummary> {
        self.ctx.stop.request();
        self.join()
    }

    fn join(&mut self) -> RedoResult<TailerSummary> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(RedoError::task_failed("log copy thread panicked"))),
            None => Err(RedoError::task_failed("log copy thread already joined")),
        }
    }
}

impl Drop for TailerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.ctx.stop.request();
            let _ = self.join();
        }
    }
}

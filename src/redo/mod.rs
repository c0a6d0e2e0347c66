//! Redo log copy
//!
//! The engine writes its log into a fixed-size circular file. During a
//! backup a [`LogTailer`] copies complete chunks from it into a
//! non-wrapping backup log (`aero_logfile0`) and publishes its progress
//! through [`LsnProgress`], which the orchestrator waits on.
//!
//! # Invariants
//!
//! - Only whole chunks are appended to the backup log.
//! - The published scanned LSN is non-decreasing and only moves after the
//!   chunks before it are durable in the backup log.
//! - Structural records of a chunk are delivered before its end LSN is
//!   published.

mod backup_log;
mod errors;
mod header;
mod lsn;
mod parser;
mod progress;
mod record;
mod ring;
mod tailer;
mod transport;

pub use backup_log::{
    normalize_sequence_bits, truncate_at, BackupLogReader, BackupLogWriter, BACKUP_LOG_NAME,
};
pub use errors::{RedoError, RedoErrorCode, RedoResult, Severity};
pub use header::{LogHeader, FLAG_BACKUP_COPY, LOG_MAGIC};
pub use lsn::Lsn;
pub use parser::{read_ring, scan_chunk, ScanOutcome};
pub use progress::{LsnProgress, LsnWait, WaitOutcome};
pub use record::{
    encode_chunk, frame_chunk, Chunk, LogRecord, RecordType, CHUNK_OVERHEAD, CHUNK_TRAILER_LEN,
    MAX_CHUNK_PAYLOAD,
};
pub use ring::{LogRing, RingOffset, RingSpan, LOG_BLOCK_SIZE, LOG_HEADER_SIZE};
pub use tailer::{
    LogTailer, TailerConfig, TailerExit, TailerHandle, TailerSummary, DEFAULT_BATCH_BYTES,
};
pub use transport::{open_source, BlockLogSource, LogSource, MappedLogSource, Transport};

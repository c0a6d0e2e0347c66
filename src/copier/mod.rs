//! Parallel tablespace copy
//!
//! [`FileCopier`] copies every open tablespace through a read filter, page
//! validation and a write filter into a [`Sink`]. Jobs run on a
//! [`WorkerPool`]; an optional [`IoThrottle`] caps operations per second.
//!
//! Dropped tablespaces are skipped rather than failed. Destination errors
//! always abort the run.

mod errors;
mod file_copier;
mod filters;
mod pool;
mod sink;
mod throttle;

pub use errors::{CopyError, CopyErrorCode, CopyResult, Severity};
pub use file_copier::{
    destination_name, CopiedFile, CopierOptions, CopyPass, FileCopier, FileOutcome, PassReport,
    COPY_BATCH_PAGES,
};
pub use filters::{
    decode_delta, ChangedPageBitmap, DeltaGroup, DeltaMeta, PageWriter, ReadFilter, WriteFilter,
    DELTA_GROUP_PAGES, DELTA_LAST_MAGIC, DELTA_LIST_END, DELTA_MAGIC, DELTA_SUFFIX, META_SUFFIX,
};
pub use pool::WorkerPool;
pub use sink::{DirectorySink, Lz4Sink, MemorySink, Sink, SinkFile, TarSink, LZ4_SUFFIX};
pub use throttle::IoThrottle;

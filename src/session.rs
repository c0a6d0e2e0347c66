//! State shared by every component of one backup run
//!
//! Created once per run and handed out as `Arc<BackupContext>`; there is no
//! process-wide state.

use std::sync::Arc;

use crate::backoff::StopSignal;
use crate::corrupted::CorruptedPages;
use crate::ddl::{DdlRecorder, DdlTracker, StructuralFeed};
use crate::observability::BackupMetrics;
use crate::redo::LsnProgress;

pub struct BackupContext {
    pub tracker: Arc<DdlTracker>,
    pub corrupted: CorruptedPages,
    pub progress: LsnProgress,
    /// Entry point for structural events; starts with a recorder sink
    pub feed: StructuralFeed,
    pub metrics: BackupMetrics,
    /// Raised on abort; ends log copying and every retry sleep
    pub stop: StopSignal,
}

impl BackupContext {
    pub fn new() -> Self {
        let tracker = Arc::new(DdlTracker::new());
        let feed = StructuralFeed::new(Arc::new(DdlRecorder::new(Arc::clone(&tracker))));
        Self {
            tracker,
            corrupted: CorruptedPages::new(),
            progress: LsnProgress::default(),
            feed,
            metrics: BackupMetrics::new(),
            stop: StopSignal::new(),
        }
    }
}

impl Default for BackupContext {
    fn default() -> Self {
        Self::new()
    }
}

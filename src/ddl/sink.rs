//! Destinations for structural events
//!
//! Before BlockDdl events go to a [`DdlRecorder`]; from BlockDdl onward a
//! [`DdlGuard`] replaces it. [`StructuralFeed`] is the single entry point the
//! log copy path calls and owns the currently installed sink.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::filter::{is_transient_name, NameFilter};
use crate::observability::Logger;
use crate::page::SpaceId;

use super::event::{StructuralEvent, StructuralKind};
use super::tracker::DdlTracker;

/// Receiver of structural events. Called under the log progress lock, so
/// implementations must not block.
pub trait StructuralSink: Send + Sync {
    fn on_event(&self, event: &StructuralEvent);

    fn on_page_init(&self, space_id: SpaceId);

    fn name(&self) -> &'static str;
}

/// Records every event into the tracker
pub struct DdlRecorder {
    tracker: Arc<DdlTracker>,
}

impl DdlRecorder {
    pub fn new(tracker: Arc<DdlTracker>) -> Self {
        Self { tracker }
    }
}

impl StructuralSink for DdlRecorder {
    fn on_event(&self, event: &StructuralEvent) {
        self.tracker.on_event(event);
    }

    fn on_page_init(&self, space_id: SpaceId) {
        self.tracker.on_page_init(space_id);
    }

    fn name(&self) -> &'static str {
        "recorder"
    }
}

/// Flags structural changes after the dictionary was frozen.
///
/// In fail-fast mode (runs without the DDL lock) the first offending event
/// is kept as a violation for the orchestrator to report. Otherwise the
/// lock should have made such events impossible and they are only logged.
pub struct DdlGuard {
    fail_fast: bool,
    filter: Arc<NameFilter>,
    violation: Mutex<Option<StructuralEvent>>,
}

impl DdlGuard {
    pub fn new(fail_fast: bool, filter: Arc<NameFilter>) -> Self {
        Self {
            fail_fast,
            filter,
            violation: Mutex::new(None),
        }
    }

    /// First event that should fail the backup, if any
    pub fn violation(&self) -> Option<StructuralEvent> {
        self.violation.lock().clone()
    }

    fn is_exempt(&self, event: &StructuralEvent) -> bool {
        match event.kind {
            StructuralKind::Modify => true,
            StructuralKind::Delete => {
                let name = event.name_str();
                !self.filter.is_included(&name) || is_transient_name(&name)
            }
            StructuralKind::Create | StructuralKind::Rename => false,
        }
    }
}

impl StructuralSink for DdlGuard {
    fn on_event(&self, event: &StructuralEvent) {
        if self.is_exempt(event) {
            return;
        }
        let space_id = event.space_id.to_string();
        let description = event.to_string();
        let fields = [
            ("event", description.as_str()),
            ("space_id", space_id.as_str()),
        ];
        if self.fail_fast {
            Logger::error("UNEXPECTED_DDL", &fields);
            let mut violation = self.violation.lock();
            if violation.is_none() {
                *violation = Some(event.clone());
            }
        } else {
            Logger::warn("DDL_DURING_LOCK", &fields);
        }
    }

    fn on_page_init(&self, _space_id: SpaceId) {}

    fn name(&self) -> &'static str {
        "guard"
    }
}

/// The callback the engine's log-apply path invokes
pub struct StructuralFeed {
    sink: Mutex<Arc<dyn StructuralSink>>,
}

impl StructuralFeed {
    pub fn new(sink: Arc<dyn StructuralSink>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// Swaps the sink; returns the previous one
    pub fn install(&self, sink: Arc<dyn StructuralSink>) -> Arc<dyn StructuralSink> {
        Logger::info("STRUCTURAL_SINK_INSTALLED", &[("sink", sink.name())]);
        std::mem::replace(&mut *self.sink.lock(), sink)
    }

    pub fn current(&self) -> Arc<dyn StructuralSink> {
        Arc::clone(&self.sink.lock())
    }

    pub fn on_event(&self, event: &StructuralEvent) {
        self.current().on_event(event);
    }

    pub fn on_page_init(&self, space_id: SpaceId) {
        self.current().on_page_init(space_id);
    }
}

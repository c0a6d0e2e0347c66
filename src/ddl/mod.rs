//! Structural changes (create, rename, drop) that race the file copy
//!
//! The log copy path feeds every structural record into a
//! [`StructuralFeed`]. Until BlockDdl the feed's sink is a [`DdlRecorder`]
//! that maintains the [`DdlTracker`]; at BlockDdl the orchestrator runs
//! [`reconcile`] once and swaps in a [`DdlGuard`].

mod event;
mod reconcile;
mod sink;
mod tracker;

pub use event::{StructuralEvent, StructuralKind};
pub use reconcile::{
    reconcile, FreshCopyError, ReconcileError, ReconcileReport, ReconcileSource,
    DELETE_MARKER_SUFFIX, NEW_COPY_SUFFIX, RENAME_MARKER_SUFFIX,
};
pub use sink::{DdlGuard, DdlRecorder, StructuralFeed, StructuralSink};
pub use tracker::{DdlSnapshot, DdlTracker};

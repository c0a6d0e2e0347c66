//! Final reconciliation of structural changes
//!
//! Runs once at BlockDdl, on the orchestrator thread, with the dictionary
//! frozen. Turns the tracker's view into marker files that the restore side
//! applies before log replay:
//!
//! - `<name>.del` (empty): a copied tablespace was dropped later, or its
//!   copy was superseded by one under a newer name
//! - `<old name>.ren` (new name): a copied tablespace was renamed
//! - `<name>.new`: a full fresh copy of a created or late-resolved
//!   tablespace, or of a renamed one that was never copied
//!
//! A tablespace never gets both `.del` and `.ren`.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::copier::Sink;
use crate::filter::{is_transient_name, NameFilter};
use crate::observability::Logger;
use crate::page::SpaceId;

use super::tracker::DdlSnapshot;

pub const DELETE_MARKER_SUFFIX: &str = ".del";
pub const RENAME_MARKER_SUFFIX: &str = ".ren";
pub const NEW_COPY_SUFFIX: &str = ".new";

/// Why a fresh copy could not be made
#[derive(Debug, Error)]
pub enum FreshCopyError {
    #[error("cannot open tablespace: {0}")]
    OpenFailed(String),
    #[error("copy failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("tablespace '{name}' (id {space_id}) was modified but its first page never became readable and it was not dropped")]
    UnresolvedDeferred { name: String, space_id: SpaceId },
    #[error("re-copy of tablespace '{name}' failed: {source}")]
    Recopy {
        name: String,
        #[source]
        source: FreshCopyError,
    },
    #[error("failed to write marker '{path}': {reason}")]
    Marker { path: String, reason: String },
}

/// Access to live tablespaces during reconciliation
pub trait ReconcileSource {
    /// Copies the tablespace again under `<name>.new`
    fn copy_fresh(&self, space_id: SpaceId, name: &str) -> Result<(), FreshCopyError>;

    /// Whether page 0 of the tablespace can be read and validated now
    fn probe(&self, space_id: SpaceId, name: &str) -> bool;
}

/// What reconciliation produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub deleted: Vec<String>,
    /// (old name, new name)
    pub renamed: Vec<(String, String)>,
    /// Names copied again as `.new`, with their ids
    pub recopied: Vec<(SpaceId, String)>,
    /// Re-copies skipped because the tablespace was excluded or transient
    pub skipped: Vec<String>,
}

impl ReconcileReport {
    pub fn recopied_ids(&self) -> BTreeSet<SpaceId> {
        self.recopied.iter().map(|(id, _)| *id).collect()
    }
}

pub fn reconcile(
    snapshot: &DdlSnapshot,
    source: &dyn ReconcileSource,
    sink: &dyn Sink,
    filter: &NameFilter,
) -> Result<ReconcileReport, ReconcileError> {
    let mut report = ReconcileReport::default();

    for (space_id, copied_name) in &snapshot.copied {
        if snapshot.is_dropped(*space_id) {
            write_marker(sink, &format!("{}{}", copied_name, DELETE_MARKER_SUFFIX), b"")?;
            report.deleted.push(copied_name.clone());
        } else if let Some(new_name) = snapshot.rename_target(*space_id) {
            write_marker(
                sink,
                &format!("{}{}", copied_name, RENAME_MARKER_SUFFIX),
                new_name.as_bytes(),
            )?;
            report
                .renamed
                .push((copied_name.clone(), new_name.to_string()));
        }
    }

    for name in snapshot.superseded.keys() {
        write_marker(sink, &format!("{}{}", name, DELETE_MARKER_SUFFIX), b"")?;
        report.deleted.push(name.clone());
    }

    let mut fresh: Vec<(SpaceId, String)> = snapshot
        .created
        .iter()
        .filter(|(space_id, _)| !snapshot.is_dropped(**space_id))
        .map(|(space_id, name)| (*space_id, name.clone()))
        .collect();

    // No copy exists under any name; filtered names stay out of the backup
    fresh.extend(
        snapshot
            .uncopied_renames()
            .filter(|(_, name)| filter.is_included(name) && !is_transient_name(name))
            .map(|(space_id, name)| (space_id, name.to_string())),
    );

    for (name, space_id) in &snapshot.deferred {
        if snapshot.is_dropped(*space_id) || fresh.iter().any(|(id, _)| id == space_id) {
            continue;
        }
        let resolvable = snapshot.page0_initialized.contains(space_id)
            || source.probe(*space_id, name);
        if !resolvable {
            return Err(ReconcileError::UnresolvedDeferred {
                name: name.clone(),
                space_id: *space_id,
            });
        }
        fresh.push((*space_id, name.clone()));
    }

    for (space_id, name) in fresh {
        match source.copy_fresh(space_id, &name) {
            Ok(()) => {
                Logger::info(
                    "TABLESPACE_RECOPIED",
                    &[("name", name.as_str()), ("space_id", &space_id.to_string())],
                );
                report.recopied.push((space_id, name));
            }
            // Heuristic: an unopenable excluded or transient table is
            // assumed gone. Not proven safe for every rename chain.
            Err(FreshCopyError::OpenFailed(reason))
                if !filter.is_included(&name) || is_transient_name(&name) =>
            {
                Logger::warn(
                    "TABLESPACE_RECOPY_SKIPPED",
                    &[("name", name.as_str()), ("reason", reason.as_str())],
                );
                report.skipped.push(name);
            }
            Err(source) => return Err(ReconcileError::Recopy { name, source }),
        }
    }

    Logger::info(
        "RECONCILE_COMPLETE",
        &[
            ("deleted", &report.deleted.len().to_string()),
            ("recopied", &report.recopied.len().to_string()),
            ("renamed", &report.renamed.len().to_string()),
            ("skipped", &report.skipped.len().to_string()),
        ],
    );
    Ok(report)
}

fn write_marker(sink: &dyn Sink, path: &str, contents: &[u8]) -> Result<(), ReconcileError> {
    sink.write_file(path, contents)
        .map_err(|e| ReconcileError::Marker {
            path: path.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copier::MemorySink;
    use crate::ddl::{DdlTracker, StructuralEvent};
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeSource {
        readable: HashSet<SpaceId>,
        unopenable: HashSet<SpaceId>,
        copies: Mutex<Vec<String>>,
    }

    impl ReconcileSource for FakeSource {
        fn copy_fresh(&self, space_id: SpaceId, name: &str) -> Result<(), FreshCopyError> {
            if self.unopenable.contains(&space_id) {
                return Err(FreshCopyError::OpenFailed("no such file".to_string()));
            }
            self.copies.lock().push(name.to_string());
            Ok(())
        }

        fn probe(&self, space_id: SpaceId, _name: &str) -> bool {
            self.readable.contains(&space_id)
        }
    }

    #[test]
    fn test_rename_drop_create_scenario() {
        let tracker = DdlTracker::new();
        tracker.record_copied(5, "db/t1");
        tracker.record_copied(7, "db/t2");
        tracker.on_event(&StructuralEvent::rename(5, "db/t1", "db/t1b"));
        tracker.on_event(&StructuralEvent::delete(7, "db/t2"));
        tracker.on_event(&StructuralEvent::create(9, "db/t3"));

        let sink = MemorySink::new();
        let source = FakeSource::default();
        let report = reconcile(&tracker.snapshot(), &source, &sink, &NameFilter::allow_all())
            .unwrap();

        assert_eq!(sink.file("db/t1.ren").as_deref(), Some(&b"db/t1b"[..]));
        assert_eq!(sink.file("db/t2.del").as_deref(), Some(&b""[..]));
        assert_eq!(*source.copies.lock(), vec!["db/t3".to_string()]);
        assert_eq!(report.recopied, vec![(9, "db/t3".to_string())]);
    }

    #[test]
    fn test_renamed_then_dropped_gets_only_delete_marker() {
        let tracker = DdlTracker::new();
        tracker.record_copied(5, "db/t1");
        tracker.on_event(&StructuralEvent::rename(5, "db/t1", "db/t1b"));
        tracker.on_event(&StructuralEvent::delete(5, "db/t1b"));

        let sink = MemorySink::new();
        reconcile(
            &tracker.snapshot(),
            &FakeSource::default(),
            &sink,
            &NameFilter::allow_all(),
        )
        .unwrap();
        assert!(sink.file("db/t1.del").is_some());
        assert!(sink.file("db/t1.ren").is_none());
    }

    #[test]
    fn test_rename_without_copy_gets_fresh_copy() {
        let tracker = DdlTracker::new();
        tracker.record_copied(5, "db/t1");
        // Lost the race with the initial copy
        tracker.on_event(&StructuralEvent::rename(6, "db/t2", "db/t2b"));
        // Moved out of the excluded namespace
        tracker.on_event(&StructuralEvent::rename(9, "scratch/t9", "db/t9"));
        // Moved within it
        tracker.on_event(&StructuralEvent::rename(10, "scratch/a", "scratch/b"));

        let sink = MemorySink::new();
        let source = FakeSource::default();
        let filter = NameFilter::new(&[], &["^scratch/".to_string()]).unwrap();
        let report = reconcile(&tracker.snapshot(), &source, &sink, &filter).unwrap();

        assert_eq!(
            report.recopied,
            vec![(6, "db/t2b".to_string()), (9, "db/t9".to_string())]
        );
        assert!(report.renamed.is_empty());
        assert!(sink.names().iter().all(|n| !n.ends_with(RENAME_MARKER_SUFFIX)));
    }

    #[test]
    fn test_unresolved_deferral_fails() {
        let tracker = DdlTracker::new();
        tracker.on_event(&StructuralEvent::modify(11, "db/t4"));

        let err = reconcile(
            &tracker.snapshot(),
            &FakeSource::default(),
            &MemorySink::new(),
            &NameFilter::allow_all(),
        )
        .unwrap_err();
        assert!(matches!(err, ReconcileError::UnresolvedDeferred { space_id: 11, .. }));
    }

    #[test]
    fn test_deferral_resolved_by_page_init_or_probe() {
        let tracker = DdlTracker::new();
        tracker.on_event(&StructuralEvent::modify(11, "db/t4"));
        tracker.on_event(&StructuralEvent::modify(12, "db/t5"));
        tracker.on_page_init(11);

        let source = FakeSource {
            readable: [12].into_iter().collect(),
            ..FakeSource::default()
        };
        let report = reconcile(
            &tracker.snapshot(),
            &source,
            &MemorySink::new(),
            &NameFilter::allow_all(),
        )
        .unwrap();
        assert_eq!(report.recopied_ids(), [11, 12].into_iter().collect());
    }

    #[test]
    fn test_unopenable_transient_table_is_skipped() {
        let tracker = DdlTracker::new();
        tracker.on_event(&StructuralEvent::create(20, "db/#sql-ib20"));
        tracker.on_event(&StructuralEvent::create(21, "db/t21"));

        let source = FakeSource {
            unopenable: [20, 21].into_iter().collect(),
            ..FakeSource::default()
        };
        let err = reconcile(
            &tracker.snapshot(),
            &source,
            &MemorySink::new(),
            &NameFilter::allow_all(),
        )
        .unwrap_err();
        assert!(matches!(err, ReconcileError::Recopy { ref name, .. } if name == "db/t21"));

        let source = FakeSource {
            unopenable: [20].into_iter().collect(),
            ..FakeSource::default()
        };
        let report = reconcile(
            &tracker.snapshot(),
            &source,
            &MemorySink::new(),
            &NameFilter::allow_all(),
        )
        .unwrap();
        assert_eq!(report.skipped, vec!["db/#sql-ib20".to_string()]);
    }
}

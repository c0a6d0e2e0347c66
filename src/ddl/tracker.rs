//! Structural change tracker
//!
//! Fed synchronously from the log copy path, so every handler only touches
//! in-memory maps under one short mutex.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;

use crate::page::SpaceId;

use super::event::{StructuralEvent, StructuralKind};

#[derive(Debug, Default)]
struct TrackerState {
    /// Name each tablespace had when its file was copied
    copied: HashMap<SpaceId, String>,
    /// Tablespaces created during the backup, under their current name
    created: HashMap<SpaceId, String>,
    /// Latest name of renamed tablespaces
    renamed: HashMap<SpaceId, String>,
    /// Name at drop time
    dropped: HashMap<SpaceId, String>,
    /// Modified tablespaces whose page 0 has not been validated
    deferred: HashMap<String, SpaceId>,
    page0_initialized: HashSet<SpaceId>,
    known: HashSet<String>,
    /// Earlier copies left behind when a tablespace was copied again under
    /// a new name
    superseded: HashMap<String, SpaceId>,
}

/// Frozen copy of the tracker used by reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DdlSnapshot {
    pub copied: BTreeMap<SpaceId, String>,
    pub created: BTreeMap<SpaceId, String>,
    pub renamed: BTreeMap<SpaceId, String>,
    pub dropped: BTreeMap<SpaceId, String>,
    pub deferred: BTreeMap<String, SpaceId>,
    pub page0_initialized: BTreeSet<SpaceId>,
    /// Stale copied names, excluding any name a current copy still uses
    pub superseded: BTreeMap<String, SpaceId>,
}

impl DdlSnapshot {
    pub fn is_dropped(&self, space_id: SpaceId) -> bool {
        self.dropped.contains_key(&space_id)
    }

    /// Renamed tablespaces that were never copied, under their current name.
    ///
    /// Their first copy attempt lost the race with the rename, or the old
    /// name was filtered out.
    pub fn uncopied_renames(&self) -> impl Iterator<Item = (SpaceId, &str)> + '_ {
        self.renamed
            .iter()
            .filter(|(space_id, _)| {
                !self.copied.contains_key(space_id)
                    && !self.created.contains_key(space_id)
                    && !self.is_dropped(**space_id)
            })
            .map(|(space_id, name)| (*space_id, name.as_str()))
    }

    /// Name a copied tablespace was renamed to, when it differs from the copy
    pub fn rename_target(&self, space_id: SpaceId) -> Option<&str> {
        let copied = self.copied.get(&space_id)?;
        self.renamed
            .get(&space_id)
            .filter(|new| *new != copied)
            .map(String::as_str)
    }
}

/// Thread-safe structural change tracker
#[derive(Debug, Default)]
pub struct DdlTracker {
    state: Mutex<TrackerState>,
}

impl DdlTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers names that exist before copying starts
    pub fn seed_known<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let mut state = self.state.lock();
        state.known.extend(names.into_iter().map(str::to_string));
    }

    pub fn on_event(&self, event: &StructuralEvent) {
        let name = event.name_str().into_owned();
        let mut state = self.state.lock();
        match event.kind {
            StructuralKind::Create => {
                state.deferred.remove(&name);
                state.dropped.remove(&event.space_id);
                state.known.insert(name.clone());
                state.created.insert(event.space_id, name);
            }
            StructuralKind::Rename => {
                let new_name = event
                    .new_name_str()
                    .map(|n| n.into_owned())
                    .unwrap_or_else(|| name.clone());
                if let Some(current) = state.created.get_mut(&event.space_id) {
                    *current = new_name.clone();
                }
                if let Some(space_id) = state.deferred.remove(&name) {
                    state.deferred.insert(new_name.clone(), space_id);
                }
                state.known.remove(&name);
                state.known.insert(new_name.clone());
                state.renamed.insert(event.space_id, new_name);
            }
            StructuralKind::Delete => {
                state.deferred.remove(&name);
                state.known.remove(&name);
                state.dropped.insert(event.space_id, name);
            }
            StructuralKind::Modify => {
                if !state.known.contains(&name) && !state.dropped.contains_key(&event.space_id) {
                    state.deferred.insert(name, event.space_id);
                }
            }
        }
    }

    /// Page 0 of `space_id` was formatted from scratch
    pub fn on_page_init(&self, space_id: SpaceId) {
        self.state.lock().page0_initialized.insert(space_id);
    }

    /// Records a completed copy; a validated page 0 resolves any deferral
    pub fn record_copied(&self, space_id: SpaceId, name: &str) {
        let mut state = self.state.lock();
        if let Some(previous) = state.copied.insert(space_id, name.to_string()) {
            if previous != name {
                state.superseded.insert(previous, space_id);
            }
        }
        state.superseded.remove(name);
        state.known.insert(name.to_string());
        state.deferred.retain(|_, id| *id != space_id);
    }

    pub fn is_copied(&self, space_id: SpaceId) -> bool {
        self.state.lock().copied.contains_key(&space_id)
    }

    pub fn is_dropped(&self, space_id: SpaceId) -> bool {
        self.state.lock().dropped.contains_key(&space_id)
    }

    /// Whether reconciliation owns the tablespace's final copy: a `.new`
    /// for created and never-copied renamed ones, a `.ren` for the rest
    pub fn is_created_or_renamed(&self, space_id: SpaceId) -> bool {
        let state = self.state.lock();
        state.created.contains_key(&space_id) || state.renamed.contains_key(&space_id)
    }

    /// Whether a file that vanished under the copier is explained by a
    /// drop or rename the tracker has seen
    pub fn corroborates_missing(&self, space_id: SpaceId) -> bool {
        let state = self.state.lock();
        state.dropped.contains_key(&space_id) || state.renamed.contains_key(&space_id)
    }

    pub fn deferred_count(&self) -> usize {
        self.state.lock().deferred.len()
    }

    pub fn snapshot(&self) -> DdlSnapshot {
        let state = self.state.lock();
        DdlSnapshot {
            copied: state.copied.iter().map(|(k, v)| (*k, v.clone())).collect(),
            created: state.created.iter().map(|(k, v)| (*k, v.clone())).collect(),
            renamed: state.renamed.iter().map(|(k, v)| (*k, v.clone())).collect(),
            dropped: state.dropped.iter().map(|(k, v)| (*k, v.clone())).collect(),
            deferred: state.deferred.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            page0_initialized: state.page0_initialized.iter().copied().collect(),
            superseded: state
                .superseded
                .iter()
                .filter(|(name, _)| !state.copied.values().any(|c| c == *name))
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }
}

//! Corrupted-page registry and its on-disk list
//!
//! File format, one entry per tablespace in id order:
//!
//! ```text
//! <name> <space id>
//! <page> <page> ...
//! ```
//!
//! The id is the last space-separated token of the first line, so names
//! may contain spaces. No file (or an empty one) means no corruption.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use crate::ddl::DdlSnapshot;
use crate::observability::Logger;
use crate::page::{PageId, PageNo, SpaceId};

/// File name of the list inside a backup directory
pub const CORRUPTED_PAGES_FILE: &str = "corrupted_pages";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("corrupted page list line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("corrupted page list I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    fn io(path: &Path, source: io::Error) -> Self {
        RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Corruption recorded for one tablespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceCorruption {
    pub name: String,
    pub pages: BTreeSet<PageNo>,
}

/// Thread-safe map of tablespace id to corrupted pages
#[derive(Debug, Default)]
pub struct CorruptedPages {
    spaces: Mutex<BTreeMap<SpaceId, SpaceCorruption>>,
}

impl CorruptedPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<SpaceId, SpaceCorruption>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|(_, corruption)| !corruption.pages.is_empty())
            .collect();
        Self {
            spaces: Mutex::new(entries),
        }
    }

    /// Records a page; the display name is refreshed on every call
    pub fn add(&self, name: &str, page: PageId) {
        let mut spaces = self.spaces.lock();
        let entry = spaces.entry(page.space).or_default();
        entry.name = name.to_string();
        entry.pages.insert(page.page_no);
    }

    pub fn contains(&self, page: PageId) -> bool {
        self.spaces
            .lock()
            .get(&page.space)
            .is_some_and(|entry| entry.pages.contains(&page.page_no))
    }

    /// Removes one page. Returns whether it was present.
    pub fn remove_page(&self, page: PageId) -> bool {
        let mut spaces = self.spaces.lock();
        let Some(entry) = spaces.get_mut(&page.space) else {
            return false;
        };
        let removed = entry.pages.remove(&page.page_no);
        if entry.pages.is_empty() {
            spaces.remove(&page.space);
        }
        removed
    }

    pub fn rename(&self, space_id: SpaceId, new_name: &str) {
        if let Some(entry) = self.spaces.lock().get_mut(&space_id) {
            entry.name = new_name.to_string();
        }
    }

    /// Forgets a tablespace entirely
    pub fn drop_space(&self, space_id: SpaceId) -> Option<SpaceCorruption> {
        self.spaces.lock().remove(&space_id)
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.lock().is_empty()
    }

    /// Total number of recorded pages
    pub fn page_count(&self) -> usize {
        self.spaces.lock().values().map(|e| e.pages.len()).sum()
    }

    pub fn entries(&self) -> BTreeMap<SpaceId, SpaceCorruption> {
        self.spaces.lock().clone()
    }

    pub fn serialize(&self) -> String {
        let spaces = self.spaces.lock();
        let mut out = String::new();
        for (space_id, entry) in spaces.iter() {
            out.push_str(&format!("{} {}\n", entry.name, space_id));
            let pages: Vec<String> = entry.pages.iter().map(|p| p.to_string()).collect();
            out.push_str(&pages.join(" "));
            out.push('\n');
        }
        out
    }

    pub fn deserialize(text: &str) -> Result<Self, RegistryError> {
        let mut spaces = BTreeMap::new();
        let mut lines = text.lines().enumerate().peekable();

        while let Some((index, header)) = lines.next() {
            if header.is_empty() && lines.peek().is_none() {
                break;
            }
            let (name, id) = header.rsplit_once(' ').ok_or_else(|| RegistryError::Parse {
                line: index + 1,
                reason: "expected '<name> <space id>'".to_string(),
            })?;
            let space_id: SpaceId = id.parse().map_err(|_| RegistryError::Parse {
                line: index + 1,
                reason: format!("invalid space id '{}'", id),
            })?;

            let (page_index, page_line) = lines.next().ok_or_else(|| RegistryError::Parse {
                line: index + 2,
                reason: format!("missing page list for space {}", space_id),
            })?;
            let mut pages = BTreeSet::new();
            for token in page_line.split_whitespace() {
                let page: PageNo = token.parse().map_err(|_| RegistryError::Parse {
                    line: page_index + 1,
                    reason: format!("invalid page number '{}'", token),
                })?;
                pages.insert(page);
            }
            if pages.is_empty() {
                continue;
            }

            let entry: &mut SpaceCorruption = spaces.entry(space_id).or_default();
            entry.name = name.to_string();
            entry.pages.extend(pages);
        }

        Ok(Self {
            spaces: Mutex::new(spaces),
        })
    }

    /// Persists the list under `dir`, or removes the file when empty
    pub fn write_to(&self, dir: &Path) -> Result<(), RegistryError> {
        let path = dir.join(CORRUPTED_PAGES_FILE);
        if self.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(RegistryError::io(&path, e)),
            };
        }

        let temp = dir.join(format!("{}.tmp", CORRUPTED_PAGES_FILE));
        let text = self.serialize();
        let write = || -> io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp, &path)
        };
        write().map_err(|e| RegistryError::io(&path, e))
    }

    /// Loads the list from `dir`; a missing file is an empty registry
    pub fn read_from(dir: &Path) -> Result<Self, RegistryError> {
        let path = dir.join(CORRUPTED_PAGES_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => Self::deserialize(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(RegistryError::io(&path, e)),
        }
    }

    /// Follows structural changes: entries of dropped or re-copied
    /// tablespaces go away, renamed ones take their new name
    pub fn apply_ddl(&self, snapshot: &DdlSnapshot, recopied: &BTreeSet<SpaceId>) {
        let mut spaces = self.spaces.lock();
        let ids: Vec<SpaceId> = spaces.keys().copied().collect();
        for space_id in ids {
            if snapshot.is_dropped(space_id) || recopied.contains(&space_id) {
                spaces.remove(&space_id);
                Logger::info(
                    "CORRUPTED_ENTRY_DROPPED",
                    &[("space_id", &space_id.to_string())],
                );
            } else if let Some(new_name) = snapshot.renamed.get(&space_id) {
                if let Some(entry) = spaces.get_mut(&space_id) {
                    entry.name = new_name.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::{DdlTracker, StructuralEvent};
    use tempfile::TempDir;

    #[test]
    fn test_add_and_contains() {
        let registry = CorruptedPages::new();
        registry.add("db/t1", PageId::new(5, 3));
        registry.add("db/t1", PageId::new(5, 9));
        assert!(registry.contains(PageId::new(5, 3)));
        assert!(!registry.contains(PageId::new(5, 4)));
        assert_eq!(registry.page_count(), 2);
    }

    #[test]
    fn test_serialized_format() {
        let registry = CorruptedPages::new();
        registry.add("db/t2", PageId::new(7, 12));
        registry.add("db/t1", PageId::new(5, 9));
        registry.add("db/t1", PageId::new(5, 3));
        assert_eq!(registry.serialize(), "db/t1 5\n3 9\ndb/t2 7\n12\n");
    }

    #[test]
    fn test_names_with_spaces_round_trip() {
        let registry = CorruptedPages::new();
        registry.add("db/my table", PageId::new(4, 1));
        let parsed = CorruptedPages::deserialize(&registry.serialize()).unwrap();
        assert_eq!(parsed.entries(), registry.entries());
    }

    #[test]
    fn test_parse_errors_carry_line() {
        let err = CorruptedPages::deserialize("db/t1 5\n3 x\n").unwrap_err();
        assert!(matches!(err, RegistryError::Parse { line: 2, .. }));
        let err = CorruptedPages::deserialize("db/t1 5\n").unwrap_err();
        assert!(matches!(err, RegistryError::Parse { line: 2, .. }));
        let err = CorruptedPages::deserialize("nospace\n1\n").unwrap_err();
        assert!(matches!(err, RegistryError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_remove_last_page_removes_entry() {
        let registry = CorruptedPages::new();
        registry.add("db/t1", PageId::new(5, 3));
        assert!(registry.remove_page(PageId::new(5, 3)));
        assert!(!registry.remove_page(PageId::new(5, 3)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = TempDir::new().unwrap();
        let registry = CorruptedPages::new();
        registry.add("db/t1", PageId::new(5, 3));
        registry.write_to(dir.path()).unwrap();
        assert!(dir.path().join(CORRUPTED_PAGES_FILE).exists());

        let loaded = CorruptedPages::read_from(dir.path()).unwrap();
        assert_eq!(loaded.entries(), registry.entries());

        CorruptedPages::new().write_to(dir.path()).unwrap();
        assert!(!dir.path().join(CORRUPTED_PAGES_FILE).exists());
        assert!(CorruptedPages::read_from(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_apply_ddl_housekeeping() {
        let registry = CorruptedPages::new();
        registry.add("db/t1", PageId::new(5, 3));
        registry.add("db/t2", PageId::new(7, 1));
        registry.add("db/t3", PageId::new(9, 2));

        let tracker = DdlTracker::new();
        tracker.on_event(&StructuralEvent::rename(5, "db/t1", "db/t1b"));
        tracker.on_event(&StructuralEvent::delete(7, "db/t2"));

        registry.apply_ddl(&tracker.snapshot(), &[9].into_iter().collect());

        let entries = registry.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[&5].name, "db/t1b");
    }
}

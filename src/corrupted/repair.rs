//! Restore-side repair of recorded corrupted pages
//!
//! A page torn by the copy race is harmless if the engine had already freed
//! it: zero-filling it yields a valid never-written page. A torn page that
//! is still allocated cannot be rebuilt here and stays recorded, unless log
//! replay formatted it again from scratch.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::path::Path;

use crate::engine::tablespace_file_name;
use crate::observability::Logger;
use crate::page::{read_fsp_header, read_page, verify_at, write_page, PageId, PageStatus, PAGE_SIZE};

use super::registry::{CorruptedPages, RegistryError};

/// Outcome of a repair pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Free pages overwritten with zeroes
    pub zero_filled: Vec<PageId>,
    /// Pages log replay re-initialized into valid pages
    pub rebuilt: Vec<PageId>,
    /// Allocated pages, or pages of unreadable tablespaces; still recorded
    pub unrepairable: Vec<PageId>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.unrepairable.is_empty()
    }
}

/// Repairs every page in `registry` against the data files in `target_dir`.
///
/// `reinitialized` holds the pages log replay formatted again; only those
/// count as rebuilt. Repaired pages are removed from the registry; the
/// rest remain.
pub fn repair(
    registry: &CorruptedPages,
    target_dir: &Path,
    reinitialized: &BTreeSet<PageId>,
) -> Result<RepairReport, RegistryError> {
    let mut report = RepairReport::default();

    for (space_id, entry) in registry.entries() {
        let path = target_dir.join(tablespace_file_name(&entry.name));
        let pages: Vec<PageId> = entry
            .pages
            .iter()
            .map(|page_no| PageId::new(space_id, *page_no))
            .collect();

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                Logger::error(
                    "REPAIR_TABLESPACE_MISSING",
                    &[("path", &path.display().to_string()), ("error", &e.to_string())],
                );
                report.unrepairable.extend(pages);
                continue;
            }
        };

        let fsp = match read_fsp_header(&file).map_err(|e| RegistryError::Io {
            path: path.clone(),
            source: e,
        })? {
            Some(fsp) => fsp,
            None => {
                Logger::error(
                    "REPAIR_PAGE0_UNREADABLE",
                    &[("name", entry.name.as_str())],
                );
                report.unrepairable.extend(pages);
                continue;
            }
        };

        let mut buf = vec![0u8; PAGE_SIZE];
        let zero = vec![0u8; PAGE_SIZE];
        let mut touched = false;
        for page in pages {
            let present = read_page(&file, page.page_no, &mut buf).map_err(|e| {
                RegistryError::Io {
                    path: path.clone(),
                    source: e,
                }
            })?;
            if present
                && reinitialized.contains(&page)
                && verify_at(&buf, page) == PageStatus::Valid
            {
                registry.remove_page(page);
                report.rebuilt.push(page);
                continue;
            }
            if fsp.is_allocated(page.page_no) {
                Logger::error(
                    "PAGE_UNREPAIRABLE",
                    &[("name", entry.name.as_str()), ("page", &page.to_string())],
                );
                report.unrepairable.push(page);
                continue;
            }
            write_page(&file, page.page_no, &zero).map_err(|e| RegistryError::Io {
                path: path.clone(),
                source: e,
            })?;
            touched = true;
            registry.remove_page(page);
            Logger::info(
                "PAGE_ZERO_FILLED",
                &[("name", entry.name.as_str()), ("page", &page.to_string())],
            );
            report.zero_filled.push(page);
        }

        if touched {
            file.sync_all().map_err(|e| RegistryError::Io {
                path: path.clone(),
                source: e,
            })?;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{init_page, FspHeader, PAGE_TYPE_INDEX};
    use std::fs::File;
    use tempfile::TempDir;

    fn build_tablespace(dir: &Path, name: &str, space: u32, allocated: &[u32]) {
        let mut fsp = FspHeader::new(space, 6);
        for page in allocated {
            fsp.set_allocated(*page, true);
        }
        let mut contents = vec![0u8; PAGE_SIZE * 6];
        fsp.write_to(&mut contents[..PAGE_SIZE], 10);
        for page in 1..6u32 {
            let at = page as usize * PAGE_SIZE;
            init_page(
                &mut contents[at..at + PAGE_SIZE],
                PageId::new(space, page),
                PAGE_TYPE_INDEX,
                10,
            );
            // Tear every page after formatting
            contents[at + 200] ^= 0xFF;
        }
        let path = dir.join(tablespace_file_name(name));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_free_pages_zero_filled_allocated_kept() {
        let dir = TempDir::new().unwrap();
        build_tablespace(dir.path(), "db/t1", 5, &[0, 1, 2]);

        let registry = CorruptedPages::new();
        registry.add("db/t1", PageId::new(5, 2));
        registry.add("db/t1", PageId::new(5, 4));

        let report = repair(&registry, dir.path(), &BTreeSet::new()).unwrap();
        assert_eq!(report.zero_filled, vec![PageId::new(5, 4)]);
        assert_eq!(report.unrepairable, vec![PageId::new(5, 2)]);
        assert!(registry.contains(PageId::new(5, 2)));
        assert!(!registry.contains(PageId::new(5, 4)));

        let file = File::open(dir.path().join("db/t1.ibd")).unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        read_page(&file, 4, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_missing_tablespace_is_unrepairable() {
        let dir = TempDir::new().unwrap();
        let registry = CorruptedPages::new();
        registry.add("db/gone", PageId::new(8, 1));

        let report = repair(&registry, dir.path(), &BTreeSet::new()).unwrap();
        assert!(!report.is_clean());
        assert_eq!(registry.page_count(), 1);
    }

    #[test]
    fn test_rebuilt_page_is_released() {
        let dir = TempDir::new().unwrap();
        build_tablespace(dir.path(), "db/t1", 5, &[0, 1, 2, 3]);
        let path = dir.path().join("db/t1.ibd");
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        init_page(&mut page, PageId::new(5, 3), PAGE_TYPE_INDEX, 50);
        write_page(&file, 3, &page).unwrap();

        let registry = CorruptedPages::new();
        registry.add("db/t1", PageId::new(5, 3));
        let reinitialized = BTreeSet::from([PageId::new(5, 3)]);
        let report = repair(&registry, dir.path(), &reinitialized).unwrap();
        assert_eq!(report.rebuilt, vec![PageId::new(5, 3)]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_valid_looking_allocated_page_stays_recorded() {
        let dir = TempDir::new().unwrap();
        build_tablespace(dir.path(), "db/t1", 5, &[0, 1, 2, 3]);
        let path = dir.path().join("db/t1.ibd");
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        init_page(&mut page, PageId::new(5, 3), PAGE_TYPE_INDEX, 50);
        write_page(&file, 3, &page).unwrap();

        // Checksums pass, but nothing formatted the page after the copy
        let registry = CorruptedPages::new();
        registry.add("db/t1", PageId::new(5, 3));
        let report = repair(&registry, dir.path(), &BTreeSet::new()).unwrap();
        assert!(report.rebuilt.is_empty());
        assert_eq!(report.unrepairable, vec![PageId::new(5, 3)]);
        assert!(registry.contains(PageId::new(5, 3)));
    }
}

//! Catalog built by scanning a data directory

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::observability::Logger;
use crate::page::{read_fsp_header, SpaceId};

use super::{EngineError, TablespaceCatalog, TablespaceInfo};

/// Extension of every tablespace data file
pub const DATA_FILE_SUFFIX: &str = ".ibd";

/// Relative data file path of a tablespace name
pub fn tablespace_file_name(name: &str) -> String {
    format!("{}{}", name, DATA_FILE_SUFFIX)
}

/// Treats every `*.ibd` file below `root` as an open tablespace.
///
/// The id comes from page 0; files whose page 0 cannot be validated yet
/// (still being created) are left out.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan(&self, dir: &Path, found: &mut Vec<TablespaceInfo>) -> Result<(), EngineError> {
        let entries = fs::read_dir(dir).map_err(|e| EngineError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();

        for path in paths {
            if path.is_dir() {
                self.scan(&path, found)?;
                continue;
            }
            let Some(name) = self.name_of(&path) else {
                continue;
            };
            // Files can vanish between listing and opening
            let Ok(file) = File::open(&path) else {
                continue;
            };
            match read_fsp_header(&file) {
                Ok(Some(fsp)) => found.push(TablespaceInfo::single(fsp.space_id, name, path)),
                Ok(None) => Logger::warn(
                    "CATALOG_PAGE0_UNREADABLE",
                    &[("path", &path.display().to_string())],
                ),
                Err(e) => {
                    return Err(EngineError::Io {
                        path: path.clone(),
                        source: e,
                    })
                }
            }
        }
        Ok(())
    }

    fn name_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let text = relative.to_str()?.replace(std::path::MAIN_SEPARATOR, "/");
        text.strip_suffix(DATA_FILE_SUFFIX).map(str::to_string)
    }
}

impl TablespaceCatalog for DirectoryCatalog {
    fn tablespaces(&self) -> Result<Vec<TablespaceInfo>, EngineError> {
        let mut found = Vec::new();
        self.scan(&self.root, &mut found)?;
        Ok(found)
    }

    fn locate(&self, space_id: SpaceId, name: &str) -> TablespaceInfo {
        TablespaceInfo::single(space_id, name, self.root.join(tablespace_file_name(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{FspHeader, PAGE_SIZE};
    use tempfile::TempDir;

    fn write_tablespace(root: &Path, name: &str, space: u32) {
        let mut page0 = vec![0u8; PAGE_SIZE];
        FspHeader::new(space, 1).write_to(&mut page0, 1);
        let path = root.join(tablespace_file_name(name));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, page0).unwrap();
    }

    #[test]
    fn test_scan_finds_nested_tablespaces() {
        let dir = TempDir::new().unwrap();
        write_tablespace(dir.path(), "db/t1", 5);
        write_tablespace(dir.path(), "db/t2", 7);
        write_tablespace(dir.path(), "other/t9", 9);
        fs::write(dir.path().join("db/notes.txt"), b"ignored").unwrap();

        let catalog = DirectoryCatalog::new(dir.path());
        let mut found: Vec<(u32, String)> = catalog
            .tablespaces()
            .unwrap()
            .into_iter()
            .map(|ts| (ts.id, ts.name))
            .collect();
        found.sort();
        assert_eq!(
            found,
            vec![
                (5, "db/t1".to_string()),
                (7, "db/t2".to_string()),
                (9, "other/t9".to_string())
            ]
        );
    }

    #[test]
    fn test_half_created_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        write_tablespace(dir.path(), "db/t1", 5);
        fs::write(dir.path().join("db/t3.ibd"), vec![0u8; 100]).unwrap();

        let catalog = DirectoryCatalog::new(dir.path());
        assert_eq!(catalog.tablespaces().unwrap().len(), 1);
    }

    #[test]
    fn test_locate_uses_current_name() {
        let catalog = DirectoryCatalog::new("/data");
        let ts = catalog.locate(9, "db/t3");
        assert_eq!(ts.files, vec![PathBuf::from("/data/db/t3.ibd")]);
    }
}

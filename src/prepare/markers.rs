//! Marker application
//!
//! Markers written by reconciliation are applied before log replay, in a
//! fixed order: every `.del`, then every `.ren`, then every `.new`. Renames
//! go through a staging name first so that chains and swaps (t1→t2 together
//! with t2→t1) never overwrite a file that is still to be moved.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::ddl::{DELETE_MARKER_SUFFIX, NEW_COPY_SUFFIX, RENAME_MARKER_SUFFIX};
use crate::engine::DATA_FILE_SUFFIX;
use crate::observability::Logger;

use super::errors::{PrepareError, PrepareResult};

const STAGING_SUFFIX: &str = ".aero-ren";

/// What the markers changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerReport {
    pub deleted: Vec<String>,
    /// (old name, new name)
    pub renamed: Vec<(String, String)>,
    /// Tablespaces replaced by their fresh copy
    pub replaced: Vec<String>,
}

impl MarkerReport {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.renamed.is_empty() && self.replaced.is_empty()
    }
}

/// Markers found in one directory
#[derive(Debug, Default)]
pub(crate) struct MarkerSet {
    deletes: BTreeMap<String, PathBuf>,
    renames: BTreeMap<String, PathBuf>,
    /// name → (chain index, path) of every fresh copy file
    fresh: BTreeMap<String, Vec<(usize, PathBuf)>>,
}

impl MarkerSet {
    pub(crate) fn scan(dir: &Path) -> PrepareResult<Self> {
        let mut set = MarkerSet::default();
        for path in walk_files(dir)? {
            let Some(rel) = relative_name(dir, &path) else {
                continue;
            };
            if let Some(name) = rel.strip_suffix(DELETE_MARKER_SUFFIX) {
                set.deletes.insert(name.to_string(), path);
            } else if let Some(name) = rel.strip_suffix(RENAME_MARKER_SUFFIX) {
                set.renames.insert(name.to_string(), path);
            } else if let Some((name, idx)) = fresh_copy_name(&rel) {
                set.fresh.entry(name).or_default().push((idx, path));
            }
        }
        for files in set.fresh.values_mut() {
            files.sort();
        }
        Ok(set)
    }

    pub(crate) fn len(&self) -> usize {
        self.deletes.len() + self.renames.len() + self.fresh.len()
    }
}

/// Applies the markers found under `marker_dir` to the data files under
/// `data_dir`. Fresh copies are moved from `marker_dir`; every applied
/// marker is consumed.
pub fn apply_markers(marker_dir: &Path, data_dir: &Path) -> PrepareResult<MarkerReport> {
    let set = MarkerSet::scan(marker_dir)?;
    let mut report = MarkerReport::default();

    for (name, marker) in &set.deletes {
        for (path, _) in tablespace_files(data_dir, name)? {
            fs::remove_file(&path).map_err(|e| PrepareError::io_at_path(&path, e))?;
        }
        remove_marker(marker)?;
        Logger::info("MARKER_DELETE_APPLIED", &[("name", name.as_str())]);
        report.deleted.push(name.clone());
    }

    let mut staged = Vec::new();
    for (old_name, marker) in &set.renames {
        let new_name = fs::read_to_string(marker)
            .map_err(|e| PrepareError::io_at_path(marker, e))?
            .trim()
            .to_string();
        if new_name.is_empty() || new_name == *old_name {
            return Err(PrepareError::marker(marker, "rename marker names no new tablespace"));
        }
        for (path, suffix) in tablespace_files(data_dir, old_name)? {
            let staging = PathBuf::from(format!("{}{}", path.display(), STAGING_SUFFIX));
            fs::rename(&path, &staging).map_err(|e| PrepareError::io_at_path(&path, e))?;
            staged.push((staging, data_dir.join(data_file(&new_name, &suffix))));
        }
        report.renamed.push((old_name.clone(), new_name));
    }
    for (staging, dest) in &staged {
        create_parent(dest)?;
        fs::rename(staging, dest).map_err(|e| PrepareError::io_at_path(dest, e))?;
    }
    for (old_name, new_name) in &report.renamed {
        if let Some(marker) = set.renames.get(old_name) {
            remove_marker(marker)?;
        }
        Logger::info(
            "MARKER_RENAME_APPLIED",
            &[("name", old_name.as_str()), ("new_name", new_name.as_str())],
        );
    }

    for (name, files) in &set.fresh {
        for (path, _) in tablespace_files(data_dir, name)? {
            fs::remove_file(&path).map_err(|e| PrepareError::io_at_path(&path, e))?;
        }
        for (idx, src) in files {
            let suffix = if *idx == 0 {
                String::new()
            } else {
                format!(".{}", idx)
            };
            let dest = data_dir.join(data_file(name, &suffix));
            move_file(src, &dest)?;
        }
        Logger::info(
            "MARKER_NEW_APPLIED",
            &[("files", &files.len().to_string()), ("name", name.as_str())],
        );
        report.replaced.push(name.clone());
    }

    if !report.is_empty() {
        sync_dir(data_dir)?;
    }
    Ok(report)
}

/// Every regular file below `dir`, sorted
pub(crate) fn walk_files(dir: &Path) -> PrepareResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current).map_err(|e| PrepareError::io_at_path(&current, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| PrepareError::io_at_path(&current, e))?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// `/`-separated path of `path` below `root`
pub(crate) fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?.to_str()?;
    Some(rel.replace(std::path::MAIN_SEPARATOR, "/"))
}

/// Files of tablespace `name` in `data_dir` with what follows `.ibd` in
/// their name: `""` for the first file, `".N"` for chained ones, and the
/// delta suffixes
pub(crate) fn tablespace_files(
    data_dir: &Path,
    name: &str,
) -> PrepareResult<Vec<(PathBuf, String)>> {
    let first = data_dir.join(data_file(name, ""));
    let Some(parent) = first.parent() else {
        return Ok(Vec::new());
    };
    let Some(base) = first.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
        return Ok(Vec::new());
    };
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PrepareError::io_at_path(parent, e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PrepareError::io_at_path(parent, e))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(rest) = file_name.strip_prefix(base.as_str()) else {
            continue;
        };
        if (rest.is_empty() || rest.starts_with('.')) && !rest.ends_with(STAGING_SUFFIX) {
            files.push((entry.path(), rest.to_string()));
        }
    }
    files.sort();
    Ok(files)
}

fn data_file(name: &str, suffix: &str) -> String {
    format!("{}{}{}", name, DATA_FILE_SUFFIX, suffix)
}

/// `db/t3.new` → (`db/t3`, 0); `db/t3.new.2` → (`db/t3`, 2)
fn fresh_copy_name(rel: &str) -> Option<(String, usize)> {
    if let Some(name) = rel.strip_suffix(NEW_COPY_SUFFIX) {
        return Some((name.to_string(), 0));
    }
    let (head, idx) = rel.rsplit_once('.')?;
    let idx: usize = idx.parse().ok()?;
    let name = head.strip_suffix(NEW_COPY_SUFFIX)?;
    Some((name.to_string(), idx))
}

fn remove_marker(path: &Path) -> PrepareResult<()> {
    fs::remove_file(path).map_err(|e| PrepareError::io_at_path(path, e))
}

fn create_parent(path: &Path) -> PrepareResult<()> {
    match path.parent() {
        Some(parent) => {
            fs::create_dir_all(parent).map_err(|e| PrepareError::io_at_path(parent, e))
        }
        None => Ok(()),
    }
}

/// Rename, falling back to copy and remove across filesystems
pub(crate) fn move_file(src: &Path, dest: &Path) -> PrepareResult<()> {
    create_parent(dest)?;
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest).map_err(|e| PrepareError::io_at_path(dest, e))?;
    OpenOptions::new()
        .write(true)
        .open(dest)
        .and_then(|f| f.sync_all())
        .map_err(|e| PrepareError::io_at_path(dest, e))?;
    fs::remove_file(src).map_err(|e| PrepareError::io_at_path(src, e))
}

pub(crate) fn sync_dir(dir: &Path) -> PrepareResult<()> {
    OpenOptions::new()
        .read(true)
        .open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| PrepareError::io_at_path(dir, e))
}

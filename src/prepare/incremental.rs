//! Delta application onto a base backup

use std::fs::{self, File, OpenOptions};
use std::path::Path;

use crate::copier::{decode_delta, DeltaMeta, DELTA_SUFFIX, META_SUFFIX};
use crate::engine::DATA_FILE_SUFFIX;
use crate::observability::Logger;
use crate::page::{read_fsp_header, write_page, PAGE_SIZE};

use super::errors::{PrepareError, PrepareResult};
use super::markers::{relative_name, walk_files};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaReport {
    pub files: usize,
    pub pages: u64,
    /// Deltas for files the base did not have
    pub created: usize,
}

/// Writes the pages of every `.delta` under `inc_dir` into the matching
/// file under `base_dir`
pub fn apply_deltas(inc_dir: &Path, base_dir: &Path) -> PrepareResult<DeltaReport> {
    let mut report = DeltaReport::default();
    for delta_path in walk_files(inc_dir)? {
        let Some(rel) = relative_name(inc_dir, &delta_path) else {
            continue;
        };
        let Some(dest_rel) = rel.strip_suffix(DELTA_SUFFIX) else {
            continue;
        };

        let meta_path = inc_dir.join(format!("{}{}", dest_rel, META_SUFFIX));
        let meta_text = fs::read_to_string(&meta_path)
            .map_err(|e| PrepareError::io_at_path(&meta_path, e))?;
        let meta = DeltaMeta::parse(&meta_text).ok_or_else(|| {
            PrepareError::incremental(format!("{} is not a delta description", meta_path.display()))
        })?;
        if meta.page_size as usize != PAGE_SIZE {
            return Err(PrepareError::incremental(format!(
                "{} uses page size {}, expected {}",
                dest_rel, meta.page_size, PAGE_SIZE
            )));
        }

        let data = fs::read(&delta_path).map_err(|e| PrepareError::io_at_path(&delta_path, e))?;
        let groups = decode_delta(&data).ok_or_else(|| {
            PrepareError::incremental(format!("{} is malformed", delta_path.display()))
        })?;

        let dest = base_dir.join(dest_rel);
        let existed = dest.exists();
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| PrepareError::io_at_path(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&dest)
            .map_err(|e| PrepareError::io_at_path(&dest, e))?;
        if existed && dest_rel.ends_with(DATA_FILE_SUFFIX) {
            check_space_id(&file, &dest, meta.space_id)?;
        }

        let mut pages = 0u64;
        for group in &groups {
            for (page_no, page) in &group.pages {
                write_page(&file, *page_no, page).map_err(|e| PrepareError::io_at_path(&dest, e))?;
                pages += 1;
            }
        }
        file.sync_all()
            .map_err(|e| PrepareError::io_at_path(&dest, e))?;

        Logger::info(
            "DELTA_APPLIED",
            &[
                ("created", &(!existed).to_string()),
                ("file", dest_rel),
                ("pages", &pages.to_string()),
            ],
        );
        report.files += 1;
        report.pages += pages;
        if !existed {
            report.created += 1;
        }
    }
    Ok(report)
}

fn check_space_id(file: &File, path: &Path, expected: u32) -> PrepareResult<()> {
    match read_fsp_header(file).map_err(|e| PrepareError::io_at_path(path, e))? {
        Some(fsp) if fsp.space_id != expected => Err(PrepareError::incremental(format!(
            "{} belongs to tablespace {} but its delta to {}",
            path.display(),
            fsp.space_id,
            expected
        ))),
        _ => Ok(()),
    }
}

//! Redo replay onto copied data files
//!
//! The backup log is replayed chunk by chunk up to exactly `to_lsn`. A page
//! change applies only when the page is older than the chunk that carries
//! it, so replay is idempotent and tolerates pages copied after the change.
//! Pages listed as corrupted accept nothing but a re-initialization; once
//! re-initialized they take later changes like any other page.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::corrupted::CorruptedPages;
use crate::engine::{DirectoryCatalog, TablespaceCatalog, DATA_FILE_SUFFIX};
use crate::observability::Logger;
use crate::page::{
    apply_write, init_page, page_lsn, read_page, verify_at, write_page, PageId, PageNo,
    PageStatus, SpaceId, PAGE_SIZE, PAGE_TYPE_FSP_HDR, PAGE_TYPE_INDEX,
};
use crate::redo::{BackupLogReader, LogRecord, Lsn};

use super::errors::{PrepareError, PrepareResult};

/// What a replay did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub chunks: u64,
    pub records: u64,
    /// Page changes written
    pub pages_applied: u64,
    /// Page changes the page already contained
    pub pages_current: u64,
    /// Changes to tablespaces that are not in the backup
    pub pages_unknown: u64,
    /// Changes refused because the page is listed as corrupted
    pub pages_corrupted: u64,
    /// Listed pages formatted from scratch by the log
    pub reinitialized: BTreeSet<PageId>,
    pub end_lsn: Lsn,
}

/// Open data files of one tablespace; chained files follow the first
struct SpaceFiles {
    name: String,
    files: Vec<(PathBuf, File, u64)>,
}

impl SpaceFiles {
    fn open(data_dir: &Path, name: &str, first: PathBuf) -> PrepareResult<Self> {
        let mut files = Vec::new();
        let mut path = first;
        loop {
            if !path.exists() {
                break;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| PrepareError::io_at_path(&path, e))?;
            let len = file
                .metadata()
                .map_err(|e| PrepareError::io_at_path(&path, e))?
                .len();
            files.push((path, file, len / PAGE_SIZE as u64));
            path = data_dir.join(format!("{}{}.{}", name, DATA_FILE_SUFFIX, files.len()));
        }
        Ok(Self {
            name: name.to_string(),
            files,
        })
    }

    /// File index and local page number; pages past the end extend the
    /// last file
    fn locate(&self, page_no: PageNo) -> (usize, PageNo) {
        let mut before = 0u64;
        let last = self.files.len().saturating_sub(1);
        for (idx, (_, _, pages)) in self.files.iter().enumerate() {
            if idx == last || (page_no as u64) < before + pages {
                return (idx, (page_no as u64 - before) as PageNo);
            }
            before += pages;
        }
        (0, page_no)
    }

    /// Reads a page; a page past the end reads as zeroes
    fn read(&self, page_no: PageNo, buf: &mut [u8]) -> PrepareResult<()> {
        let (idx, local) = self.locate(page_no);
        let (path, file, _) = &self.files[idx];
        let present = read_page(file, local, buf).map_err(|e| PrepareError::io_at_path(path, e))?;
        if !present {
            buf[..PAGE_SIZE].fill(0);
        }
        Ok(())
    }

    fn write(&mut self, page_no: PageNo, buf: &[u8]) -> PrepareResult<()> {
        let (idx, local) = self.locate(page_no);
        let (path, file, pages) = &mut self.files[idx];
        write_page(file, local, buf).map_err(|e| PrepareError::io_at_path(path, e))?;
        *pages = (*pages).max(local as u64 + 1);
        Ok(())
    }

    fn sync(&self) -> PrepareResult<()> {
        for (path, file, _) in &self.files {
            file.sync_all()
                .map_err(|e| PrepareError::io_at_path(path, e))?;
        }
        Ok(())
    }
}

/// Replays the backup log at `log_path` onto the tablespaces in `data_dir`
/// until `to_lsn`, which must be the end of a chunk.
pub fn replay_log(
    log_path: &Path,
    data_dir: &Path,
    to_lsn: Lsn,
    corrupted: &CorruptedPages,
) -> PrepareResult<ReplayReport> {
    let catalog = DirectoryCatalog::new(data_dir);
    let mut spaces: BTreeMap<SpaceId, SpaceFiles> = BTreeMap::new();
    for ts in catalog
        .tablespaces()
        .map_err(|e| PrepareError::replay(format!("cannot list tablespaces: {}", e)))?
    {
        let Some(first) = ts.files.first().cloned() else {
            continue;
        };
        spaces.insert(ts.id, SpaceFiles::open(data_dir, &ts.name, first)?);
    }

    let mut reader = BackupLogReader::open(log_path).map_err(PrepareError::replay_log)?;
    let first_lsn = reader.header().first_lsn;
    if first_lsn > to_lsn {
        return Err(PrepareError::replay(format!(
            "backup log starts at {} after to_lsn {}",
            first_lsn, to_lsn
        )));
    }
    Logger::info(
        "REPLAY_STARTED",
        &[
            ("first_lsn", &first_lsn.to_string()),
            ("tablespaces", &spaces.len().to_string()),
            ("to_lsn", &to_lsn.to_string()),
        ],
    );

    let mut report = ReplayReport {
        end_lsn: first_lsn,
        ..ReplayReport::default()
    };
    let mut buf = vec![0u8; PAGE_SIZE];
    while reader.position() < to_lsn {
        let chunk = reader
            .next_chunk()
            .map_err(PrepareError::replay_log)?
            .ok_or_else(|| {
                PrepareError::replay(format!(
                    "backup log ends at {} before to_lsn {}",
                    reader.position(),
                    to_lsn
                ))
            })?;
        let end = chunk.end();
        if end > to_lsn {
            return Err(PrepareError::replay(format!(
                "chunk {}..{} crosses to_lsn {}",
                chunk.start(),
                end,
                to_lsn
            )));
        }
        let records = chunk.records().map_err(|e| {
            PrepareError::replay(format!("undecodable chunk at {}: {}", chunk.start(), e))
        })?;
        for record in &records {
            apply_record(record, end, &mut spaces, corrupted, &mut buf, &mut report)?;
        }
        report.chunks += 1;
        report.records += records.len() as u64;
        report.end_lsn = end;
    }

    if reader
        .next_chunk()
        .map_err(PrepareError::replay_log)?
        .is_some()
    {
        return Err(PrepareError::replay(format!(
            "backup log continues past to_lsn {}",
            to_lsn
        )));
    }

    for files in spaces.values() {
        files.sync()?;
    }
    Logger::info(
        "REPLAY_COMPLETE",
        &[
            ("chunks", &report.chunks.to_string()),
            ("end_lsn", &report.end_lsn.to_string()),
            ("pages_applied", &report.pages_applied.to_string()),
            ("pages_corrupted", &report.pages_corrupted.to_string()),
            ("pages_unknown", &report.pages_unknown.to_string()),
        ],
    );
    Ok(report)
}

fn apply_record(
    record: &LogRecord,
    end: Lsn,
    spaces: &mut BTreeMap<SpaceId, SpaceFiles>,
    corrupted: &CorruptedPages,
    buf: &mut [u8],
    report: &mut ReplayReport,
) -> PrepareResult<()> {
    let (page, write) = match record {
        LogRecord::PageWrite { page, offset, data } => (*page, Some((*offset as usize, data))),
        LogRecord::InitPage { page } => (*page, None),
        // Structural records were resolved through markers
        _ => return Ok(()),
    };
    let Some(files) = spaces.get_mut(&page.space) else {
        report.pages_unknown += 1;
        return Ok(());
    };

    files.read(page.page_no, buf)?;
    // The copy of a listed page was zero-filled or torn, whatever it reads as
    let damaged = corrupted.contains(page) && !report.reinitialized.contains(&page);
    if damaged {
        if write.is_some() {
            report.pages_corrupted += 1;
            return Ok(());
        }
    } else {
        match verify_at(buf, page) {
            PageStatus::Corrupted => {
                return Err(PrepareError::replay(format!(
                    "page {} of '{}' is corrupted but not listed as such",
                    page, files.name
                )))
            }
            _ if page_lsn(buf) >= end.get() => {
                report.pages_current += 1;
                return Ok(());
            }
            _ => {}
        }
    }

    match write {
        Some((offset, data)) => {
            if !apply_write(buf, page, offset, data, end.get()) {
                return Err(PrepareError::replay(format!(
                    "change at {} writes outside the body of page {}",
                    end, page
                )));
            }
        }
        None => {
            init_page(buf, page, init_page_type(page), end.get());
            if damaged {
                report.reinitialized.insert(page);
            }
        }
    }
    files.write(page.page_no, buf)?;
    report.pages_applied += 1;
    Ok(())
}

fn init_page_type(page: PageId) -> u16 {
    if page.page_no == 0 {
        PAGE_TYPE_FSP_HDR
    } else {
        PAGE_TYPE_INDEX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::FspHeader;
    use crate::redo::{encode_chunk, BackupLogWriter, Chunk, BACKUP_LOG_NAME};
    use std::fs;
    use tempfile::TempDir;

    const SPACE: SpaceId = 5;

    fn build_tablespace(dir: &Path, pages: u32, lsn: u64) {
        let mut data = vec![0u8; PAGE_SIZE * pages as usize];
        FspHeader::new(SPACE, pages).write_to(&mut data[..PAGE_SIZE], lsn);
        for page_no in 1..pages {
            let at = page_no as usize * PAGE_SIZE;
            init_page(
                &mut data[at..at + PAGE_SIZE],
                PageId::new(SPACE, page_no),
                PAGE_TYPE_INDEX,
                lsn,
            );
        }
        fs::create_dir_all(dir.join("db")).unwrap();
        fs::write(dir.join("db/t1.ibd"), data).unwrap();
    }

    fn write_log(dir: &Path, start: Lsn, batches: &[Vec<LogRecord>]) -> Vec<Lsn> {
        let mut writer = BackupLogWriter::create(&dir.join(BACKUP_LOG_NAME), start).unwrap();
        let mut ends = Vec::new();
        let mut lsn = start;
        for records in batches {
            let chunk = Chunk::new(lsn, encode_chunk(records, 1));
            lsn = chunk.end();
            ends.push(lsn);
            writer.append(&mut [chunk]).unwrap();
        }
        ends
    }

    fn page(dir: &Path, page_no: u32) -> Vec<u8> {
        let data = fs::read(dir.join("db/t1.ibd")).unwrap();
        let at = page_no as usize * PAGE_SIZE;
        data[at..at + PAGE_SIZE].to_vec()
    }

    fn body_write(page_no: u32, byte: u8) -> LogRecord {
        LogRecord::PageWrite {
            page: PageId::new(SPACE, page_no),
            offset: 200,
            data: vec![byte; 16],
        }
    }

    #[test]
    fn test_replay_applies_newer_changes_only() {
        let dir = TempDir::new().unwrap();
        build_tablespace(dir.path(), 3, 1);
        let ends = write_log(
            dir.path(),
            Lsn::new(50),
            &[vec![body_write(1, 0xAA)], vec![body_write(2, 0xBB)]],
        );
        // Page 2 was copied after the second change already
        let mut data = fs::read(dir.path().join("db/t1.ibd")).unwrap();
        init_page(
            &mut data[2 * PAGE_SIZE..3 * PAGE_SIZE],
            PageId::new(SPACE, 2),
            PAGE_TYPE_INDEX,
            ends[1].get(),
        );
        fs::write(dir.path().join("db/t1.ibd"), data).unwrap();

        let report = replay_log(
            &dir.path().join(BACKUP_LOG_NAME),
            dir.path(),
            ends[1],
            &CorruptedPages::new(),
        )
        .unwrap();
        assert_eq!(report.chunks, 2);
        assert_eq!(report.end_lsn, ends[1]);

        let p1 = page(dir.path(), 1);
        assert_eq!(&p1[200..216], &[0xAA; 16]);
        assert_eq!(page_lsn(&p1), ends[0].get());
        assert_eq!(verify_at(&p1, PageId::new(SPACE, 1)), PageStatus::Valid);
        let p2 = page(dir.path(), 2);
        assert_eq!(&p2[200..216], &[0u8; 16]);
        assert_eq!(report.pages_current, 1);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let dir = TempDir::new().unwrap();
        build_tablespace(dir.path(), 2, 1);
        let ends = write_log(dir.path(), Lsn::new(10), &[vec![body_write(1, 0x11)]]);
        let log = dir.path().join(BACKUP_LOG_NAME);

        replay_log(&log, dir.path(), ends[0], &CorruptedPages::new()).unwrap();
        let once = fs::read(dir.path().join("db/t1.ibd")).unwrap();
        let second = replay_log(&log, dir.path(), ends[0], &CorruptedPages::new()).unwrap();
        assert_eq!(second.pages_applied, 0);
        assert_eq!(fs::read(dir.path().join("db/t1.ibd")).unwrap(), once);
    }

    #[test]
    fn test_corrupted_page_only_accepts_init() {
        let dir = TempDir::new().unwrap();
        build_tablespace(dir.path(), 3, 1);
        let mut data = fs::read(dir.path().join("db/t1.ibd")).unwrap();
        data[PAGE_SIZE + 300] ^= 0xFF;
        data[2 * PAGE_SIZE + 300] ^= 0xFF;
        fs::write(dir.path().join("db/t1.ibd"), data).unwrap();

        let corrupted = CorruptedPages::new();
        corrupted.add("db/t1", PageId::new(SPACE, 1));
        corrupted.add("db/t1", PageId::new(SPACE, 2));
        let ends = write_log(
            dir.path(),
            Lsn::new(10),
            &[
                vec![body_write(1, 0x22)],
                vec![LogRecord::InitPage {
                    page: PageId::new(SPACE, 2),
                }],
                vec![body_write(2, 0x33)],
            ],
        );

        let report = replay_log(&dir.path().join(BACKUP_LOG_NAME), dir.path(), ends[2], &corrupted)
            .unwrap();
        assert_eq!(report.pages_corrupted, 1);
        assert_eq!(
            verify_at(&page(dir.path(), 1), PageId::new(SPACE, 1)),
            PageStatus::Corrupted
        );
        let p2 = page(dir.path(), 2);
        assert_eq!(verify_at(&p2, PageId::new(SPACE, 2)), PageStatus::Valid);
        assert_eq!(&p2[200..216], &[0x33; 16]);
        assert_eq!(
            report.reinitialized.into_iter().collect::<Vec<_>>(),
            vec![PageId::new(SPACE, 2)]
        );
    }

    #[test]
    fn test_zero_filled_listed_page_refuses_writes() {
        let dir = TempDir::new().unwrap();
        build_tablespace(dir.path(), 3, 1);
        let mut data = fs::read(dir.path().join("db/t1.ibd")).unwrap();
        data[2 * PAGE_SIZE..3 * PAGE_SIZE].fill(0);
        fs::write(dir.path().join("db/t1.ibd"), data).unwrap();

        let corrupted = CorruptedPages::new();
        corrupted.add("db/t1", PageId::new(SPACE, 2));
        let ends = write_log(dir.path(), Lsn::new(10), &[vec![body_write(2, 0x66)]]);

        let report = replay_log(&dir.path().join(BACKUP_LOG_NAME), dir.path(), ends[0], &corrupted)
            .unwrap();
        assert_eq!(report.pages_corrupted, 1);
        assert_eq!(report.pages_applied, 0);
        assert!(report.reinitialized.is_empty());
        assert!(page(dir.path(), 2).iter().all(|b| *b == 0));
    }

    #[test]
    fn test_unlisted_corruption_fails() {
        let dir = TempDir::new().unwrap();
        build_tablespace(dir.path(), 2, 1);
        let mut data = fs::read(dir.path().join("db/t1.ibd")).unwrap();
        data[PAGE_SIZE + 300] ^= 0xFF;
        fs::write(dir.path().join("db/t1.ibd"), data).unwrap();
        let ends = write_log(dir.path(), Lsn::new(10), &[vec![body_write(1, 0x44)]]);

        let err = replay_log(
            &dir.path().join(BACKUP_LOG_NAME),
            dir.path(),
            ends[0],
            &CorruptedPages::new(),
        )
        .unwrap_err();
        assert_eq!(err.code(), crate::prepare::PrepareErrorCode::AeroPrepareReplay);
    }

    #[test]
    fn test_to_lsn_must_be_reached_exactly() {
        let dir = TempDir::new().unwrap();
        build_tablespace(dir.path(), 2, 1);
        let ends = write_log(
            dir.path(),
            Lsn::new(10),
            &[vec![body_write(1, 1)], vec![body_write(1, 2)]],
        );
        let log = dir.path().join(BACKUP_LOG_NAME);

        // Log continues past the point
        assert!(replay_log(&log, dir.path(), ends[0], &CorruptedPages::new()).is_err());
        // Point lies beyond the log
        assert!(replay_log(&log, dir.path(), ends[1].advance(1), &CorruptedPages::new()).is_err());
    }

    #[test]
    fn test_changes_to_unknown_tablespaces_are_counted() {
        let dir = TempDir::new().unwrap();
        build_tablespace(dir.path(), 2, 1);
        let ends = write_log(
            dir.path(),
            Lsn::new(10),
            &[vec![LogRecord::PageWrite {
                page: PageId::new(99, 1),
                offset: 100,
                data: vec![1; 4],
            }]],
        );
        let report = replay_log(
            &dir.path().join(BACKUP_LOG_NAME),
            dir.path(),
            ends[0],
            &CorruptedPages::new(),
        )
        .unwrap();
        assert_eq!(report.pages_unknown, 1);
        assert_eq!(report.pages_applied, 0);
    }

    #[test]
    fn test_writes_past_the_end_extend_the_file() {
        let dir = TempDir::new().unwrap();
        build_tablespace(dir.path(), 2, 1);
        let ends = write_log(
            dir.path(),
            Lsn::new(10),
            &[
                vec![LogRecord::InitPage {
                    page: PageId::new(SPACE, 3),
                }],
                vec![body_write(3, 0x55)],
            ],
        );
        replay_log(
            &dir.path().join(BACKUP_LOG_NAME),
            dir.path(),
            ends[1],
            &CorruptedPages::new(),
        )
        .unwrap();
        let len = fs::metadata(dir.path().join("db/t1.ibd")).unwrap().len();
        assert_eq!(len, 4 * PAGE_SIZE as u64);
        assert_eq!(&page(dir.path(), 3)[200..216], &[0x55; 16]);
    }
}

//! Simulated engine for end-to-end backup tests
//!
//! The engine keeps its tablespaces as `*.ibd` files under a data directory
//! and logs every change into a circular log before applying it, the same
//! order a real engine follows. Stage RPCs can run scripted hooks so tests
//! can change the engine while a backup is in flight.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use aerobackup::backoff::{BackoffPolicy, FixedBackoff};
use aerobackup::config::BackupConfig;
use aerobackup::engine::{
    tablespace_file_name, DirectoryCatalog, EngineError, EngineSession, TablespaceCatalog,
};
use aerobackup::page::{
    apply_write, init_page, read_page, write_page, FspHeader, PageId, PageNo, SpaceId,
    PAGE_SIZE, PAGE_TYPE_INDEX,
};
use aerobackup::redo::{encode_chunk, LogHeader, LogRecord, LogRing, Lsn, LOG_HEADER_SIZE};

pub const LOG_CAPACITY: u64 = 1 << 20;

pub struct SimEngine {
    root: TempDir,
    ring: LogRing,
    end: Lsn,
    spaces: BTreeMap<SpaceId, String>,
    /// Overrides the LSN reported to the backup
    pub reported_lsn: Option<Lsn>,
}

impl SimEngine {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("data")).unwrap();
        let first = Lsn::new(0);
        let mut contents = LogHeader::circular(first, LOG_CAPACITY, first).encode();
        contents.resize((LOG_HEADER_SIZE + LOG_CAPACITY) as usize, 0);
        fs::write(root.path().join("aero_redo"), contents).unwrap();
        Self {
            root,
            ring: LogRing::new(first, LOG_CAPACITY),
            end: first,
            spaces: BTreeMap::new(),
            reported_lsn: None,
        }
    }

    pub fn datadir(&self) -> PathBuf {
        self.root.path().join("data")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.path().join("aero_redo")
    }

    /// A fresh directory next to the engine for backup output
    pub fn target(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    pub fn end(&self) -> Lsn {
        self.end
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.datadir().join(tablespace_file_name(name))
    }

    pub fn config(&self, target: &str) -> BackupConfig {
        let mut config = BackupConfig::new(self.datadir(), self.log_path(), self.target(target));
        config.parallel = 2;
        config
    }

    /// Writes one chunk into the ring and returns its end LSN
    pub fn append(&mut self, records: &[LogRecord]) -> Lsn {
        let mut frame = encode_chunk(records, 1);
        let seq_at = frame.len() - 5;
        frame[seq_at] = self.ring.sequence_bit(self.end.advance(seq_at as u64));
        let mut file = OpenOptions::new().write(true).open(self.log_path()).unwrap();
        for (i, byte) in frame.iter().enumerate() {
            let at = self.ring.offset_of(self.end.advance(i as u64)).get();
            file.seek(SeekFrom::Start(at)).unwrap();
            file.write_all(&[*byte]).unwrap();
        }
        self.end = self.end.advance(frame.len() as u64);
        self.end
    }

    /// Moves the log checkpoint to the current end
    pub fn checkpoint(&mut self) {
        let header = LogHeader::circular(self.ring.first_lsn(), self.ring.capacity(), self.end)
            .encode();
        let mut file = OpenOptions::new().write(true).open(self.log_path()).unwrap();
        file.write_all(&header).unwrap();
        file.sync_all().unwrap();
    }

    pub fn create_tablespace(&mut self, name: &str, space: SpaceId, pages: PageNo) {
        let created = self.append(&[
            LogRecord::FileCreate {
                space,
                name: name.as_bytes().to_vec(),
            },
            LogRecord::InitPage {
                page: PageId::new(space, 0),
            },
        ]);
        let inits: Vec<LogRecord> = (1..pages)
            .map(|page_no| LogRecord::InitPage {
                page: PageId::new(space, page_no),
            })
            .collect();
        let formatted = self.append(&inits);

        let mut contents = vec![0u8; PAGE_SIZE * pages as usize];
        let mut fsp = FspHeader::new(space, pages);
        for page_no in 0..pages {
            fsp.set_allocated(page_no, true);
        }
        fsp.write_to(&mut contents[..PAGE_SIZE], created.get());
        for page_no in 1..pages {
            let at = page_no as usize * PAGE_SIZE;
            init_page(
                &mut contents[at..at + PAGE_SIZE],
                PageId::new(space, page_no),
                PAGE_TYPE_INDEX,
                formatted.get(),
            );
        }
        let path = self.file_path(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        self.spaces.insert(space, name.to_string());
    }

    /// Logs and applies a body write filled with `fill`
    pub fn write(&mut self, space: SpaceId, page_no: PageNo, fill: u8) -> Lsn {
        let page = PageId::new(space, page_no);
        let data = vec![fill; 64];
        let offset = 200 + (fill as u16 % 16) * 64;
        let lsn = self.append(&[LogRecord::PageWrite {
            page,
            offset,
            data: data.clone(),
        }]);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file_path(&self.spaces[&space]))
            .unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(read_page(&file, page_no, &mut buf).unwrap());
        assert!(apply_write(&mut buf, page, offset as usize, &data, lsn.get()));
        write_page(&file, page_no, &buf).unwrap();
        lsn
    }

    pub fn rename(&mut self, space: SpaceId, new_name: &str) {
        let old_name = self.spaces[&space].clone();
        self.append(&[LogRecord::FileRename {
            space,
            name: old_name.as_bytes().to_vec(),
            new_name: new_name.as_bytes().to_vec(),
        }]);
        let to = self.file_path(new_name);
        fs::create_dir_all(to.parent().unwrap()).unwrap();
        fs::rename(self.file_path(&old_name), to).unwrap();
        self.spaces.insert(space, new_name.to_string());
    }

    pub fn drop_tablespace(&mut self, space: SpaceId) {
        let name = self.spaces.remove(&space).unwrap();
        self.append(&[LogRecord::FileDelete {
            space,
            name: name.as_bytes().to_vec(),
        }]);
        fs::remove_file(self.file_path(&name)).unwrap();
    }

    /// Damages a page on disk without logging it, like a torn write
    pub fn tear(&mut self, space: SpaceId, page_no: PageNo) {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file_path(&self.spaces[&space]))
            .unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(read_page(&file, page_no, &mut buf).unwrap());
        buf[300] ^= 0xFF;
        write_page(&file, page_no, &buf).unwrap();
    }

    /// Marks a page free in the allocation map on page 0
    pub fn free_page(&mut self, space: SpaceId, page_no: PageNo) {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file_path(&self.spaces[&space]))
            .unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(read_page(&file, 0, &mut buf).unwrap());
        let mut fsp = FspHeader::parse(&buf).unwrap();
        fsp.set_allocated(page_no, false);
        fsp.write_to(&mut buf, self.end.get());
        write_page(&file, 0, &buf).unwrap();
    }

    /// Names of the live tablespaces
    pub fn tablespace_names(&self) -> Vec<String> {
        self.spaces.values().cloned().collect()
    }
}

type Hook = Box<dyn FnMut(&mut SimEngine) + Send>;

/// `EngineSession` over a shared [`SimEngine`]
pub struct SimSession {
    engine: Arc<Mutex<SimEngine>>,
    hooks: Mutex<HashMap<&'static str, Hook>>,
    failing: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<&'static str>>,
}

impl SimSession {
    pub fn new(engine: Arc<Mutex<SimEngine>>) -> Self {
        Self {
            engine,
            hooks: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Runs `hook` every time `rpc` is called, before it returns
    pub fn on(&self, rpc: &'static str, hook: impl FnMut(&mut SimEngine) + Send + 'static) {
        self.hooks.lock().insert(rpc, Box::new(hook));
    }

    pub fn fail(&self, rpc: &'static str) {
        self.failing.lock().insert(rpc);
    }

    /// Lock RPCs received so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn rpc(&self, rpc: &'static str) -> Result<(), EngineError> {
        self.calls.lock().push(rpc);
        self.run_hook(rpc);
        if self.failing.lock().contains(rpc) {
            return Err(EngineError::Rpc {
                rpc,
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    fn run_hook(&self, rpc: &'static str) {
        let mut hooks = self.hooks.lock();
        if let Some(hook) = hooks.get_mut(rpc) {
            let mut engine = self.engine.lock();
            hook(&mut *engine);
        }
    }
}

impl EngineSession for SimSession {
    fn stage_start(&self) -> Result<(), EngineError> {
        self.rpc("stage_start")
    }

    fn stage_flush(&self) -> Result<(), EngineError> {
        self.rpc("stage_flush")
    }

    fn stage_block_ddl(&self) -> Result<(), EngineError> {
        self.rpc("stage_block_ddl")
    }

    fn stage_block_commit(&self) -> Result<(), EngineError> {
        self.rpc("stage_block_commit")
    }

    fn unlock_all(&self) -> Result<(), EngineError> {
        self.rpc("unlock_all")
    }

    fn current_lsn(&self) -> Result<Lsn, EngineError> {
        self.run_hook("current_lsn");
        let engine = self.engine.lock();
        Ok(engine.reported_lsn.unwrap_or(engine.end))
    }
}

/// Engine with `db/t1` (id 5) and `db/t2` (id 7), checkpointed
pub fn two_table_engine() -> Arc<Mutex<SimEngine>> {
    let mut engine = SimEngine::new();
    engine.create_tablespace("db/t1", 5, 4);
    engine.create_tablespace("db/t2", 7, 4);
    engine.write(5, 1, 0x11);
    engine.checkpoint();
    Arc::new(Mutex::new(engine))
}

pub fn catalog(engine: &Arc<Mutex<SimEngine>>) -> Arc<dyn TablespaceCatalog> {
    Arc::new(DirectoryCatalog::new(engine.lock().datadir()))
}

/// Millisecond retries so stalls surface quickly
pub fn fast_policy() -> Arc<dyn BackoffPolicy> {
    Arc::new(FixedBackoff {
        interval: Duration::from_millis(1),
        max_attempts: 5,
    })
}

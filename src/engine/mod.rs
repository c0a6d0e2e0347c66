//! Interfaces to the live engine
//!
//! The engine is an external collaborator: the backup only issues the
//! stage RPCs, asks for the current LSN, and lists the tablespace files
//! that are open.

mod catalog;

pub use catalog::{tablespace_file_name, DirectoryCatalog, DATA_FILE_SUFFIX};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::page::SpaceId;
use crate::redo::Lsn;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine RPC {rpc} failed: {reason}")]
    Rpc { rpc: &'static str, reason: String },
    #[error("tablespace catalog error: {0}")]
    Catalog(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Blocking lock/stage RPCs of the live engine
pub trait EngineSession: Send + Sync {
    /// Acquires the initial backup lock
    fn stage_start(&self) -> Result<(), EngineError>;

    /// Asks the engine to flush dirty pages and make the log durable
    fn stage_flush(&self) -> Result<(), EngineError>;

    /// Blocks DDL
    fn stage_block_ddl(&self) -> Result<(), EngineError>;

    /// Blocks commits
    fn stage_block_commit(&self) -> Result<(), EngineError>;

    /// Releases every lock taken by the stage RPCs
    fn unlock_all(&self) -> Result<(), EngineError>;

    /// Current checkpoint/commit LSN
    fn current_lsn(&self) -> Result<Lsn, EngineError>;
}

/// A tablespace and the files that hold its pages, in page order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablespaceInfo {
    pub id: SpaceId,
    /// Engine-relative name, e.g. `shop/orders`
    pub name: String,
    pub files: Vec<PathBuf>,
}

impl TablespaceInfo {
    /// A single-file tablespace
    pub fn single(id: SpaceId, name: impl Into<String>, file: PathBuf) -> Self {
        Self {
            id,
            name: name.into(),
            files: vec![file],
        }
    }
}

/// The engine's registry of open tablespace files
pub trait TablespaceCatalog: Send + Sync {
    fn tablespaces(&self) -> Result<Vec<TablespaceInfo>, EngineError>;

    /// Where the tablespace named `name` lives right now
    fn locate(&self, space_id: SpaceId, name: &str) -> TablespaceInfo;
}

//! Backup stages and their one-way order

use std::fmt;

use super::errors::{BackupError, BackupResult};

/// Stages of a run, in the only order they may be entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BackupStage {
    Start,
    Flush,
    BlockDdl,
    BlockCommit,
    End,
}

impl BackupStage {
    pub const ALL: [BackupStage; 5] = [
        BackupStage::Start,
        BackupStage::Flush,
        BackupStage::BlockDdl,
        BackupStage::BlockCommit,
        BackupStage::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStage::Start => "start",
            BackupStage::Flush => "flush",
            BackupStage::BlockDdl => "block_ddl",
            BackupStage::BlockCommit => "block_commit",
            BackupStage::End => "end",
        }
    }

    pub fn next(&self) -> Option<BackupStage> {
        match self {
            BackupStage::Start => Some(BackupStage::Flush),
            BackupStage::Flush => Some(BackupStage::BlockDdl),
            BackupStage::BlockDdl => Some(BackupStage::BlockCommit),
            BackupStage::BlockCommit => Some(BackupStage::End),
            BackupStage::End => None,
        }
    }
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current stage; only the immediate successor can be entered
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageCursor {
    current: Option<BackupStage>,
}

impl StageCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<BackupStage> {
        self.current
    }

    pub fn advance(&mut self, to: BackupStage) -> BackupResult<()> {
        let expected = match self.current {
            None => Some(BackupStage::Start),
            Some(stage) => stage.next(),
        };
        if expected != Some(to) {
            return Err(BackupError::stage_order(self.current, to));
        }
        self.current = Some(to);
        Ok(())
    }
}

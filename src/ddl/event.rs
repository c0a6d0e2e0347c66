//! Structural events raised on the engine's log-apply path

use std::borrow::Cow;
use std::fmt;

use crate::page::SpaceId;
use crate::redo::LogRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructuralKind {
    Create,
    Rename,
    Delete,
    /// First modification of a tablespace since the last checkpoint
    Modify,
}

impl fmt::Display for StructuralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StructuralKind::Create => "create",
            StructuralKind::Rename => "rename",
            StructuralKind::Delete => "delete",
            StructuralKind::Modify => "modify",
        };
        write!(f, "{}", s)
    }
}

/// One structural change; names are raw bytes with explicit length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralEvent {
    pub kind: StructuralKind,
    pub space_id: SpaceId,
    pub name: Vec<u8>,
    /// Only set for renames
    pub new_name: Option<Vec<u8>>,
}

impl StructuralEvent {
    pub fn create(space_id: SpaceId, name: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: StructuralKind::Create,
            space_id,
            name: name.into(),
            new_name: None,
        }
    }

    pub fn rename(space_id: SpaceId, name: impl Into<Vec<u8>>, new_name: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: StructuralKind::Rename,
            space_id,
            name: name.into(),
            new_name: Some(new_name.into()),
        }
    }

    pub fn delete(space_id: SpaceId, name: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: StructuralKind::Delete,
            space_id,
            name: name.into(),
            new_name: None,
        }
    }

    pub fn modify(space_id: SpaceId, name: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: StructuralKind::Modify,
            space_id,
            name: name.into(),
            new_name: None,
        }
    }

    /// The structural event carried by a log record, if it is one
    pub fn from_record(record: &LogRecord) -> Option<Self> {
        match record {
            LogRecord::FileCreate { space, name } => Some(Self::create(*space, name.clone())),
            LogRecord::FileRename {
                space,
                name,
                new_name,
            } => Some(Self::rename(*space, name.clone(), new_name.clone())),
            LogRecord::FileDelete { space, name } => Some(Self::delete(*space, name.clone())),
            LogRecord::FileModify { space, name } => Some(Self::modify(*space, name.clone())),
            _ => None,
        }
    }

    pub fn name_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    pub fn new_name_str(&self) -> Option<Cow<'_, str>> {
        self.new_name.as_deref().map(String::from_utf8_lossy)
    }
}

impl fmt::Display for StructuralEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of tablespace {} '{}'", self.kind, self.space_id, self.name_str())?;
        if let Some(new_name) = self.new_name_str() {
            write!(f, " to '{}'", new_name)?;
        }
        Ok(())
    }
}

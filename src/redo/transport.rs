//! Physical access to the engine's log file
//!
//! Two transports satisfy the same [`LogSource`] contract: a shared memory
//! mapping, and positioned reads of whole 512-byte blocks. Neither caches
//! data; every call observes the file as the engine currently has it.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use super::errors::{RedoError, RedoResult};
use super::header::LogHeader;
use super::ring::{RingOffset, LOG_BLOCK_SIZE, LOG_HEADER_SIZE};

/// Transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Mmap,
    Block,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Mmap => write!(f, "mmap"),
            Transport::Block => write!(f, "block"),
        }
    }
}

/// Random access to the bytes of a log file
pub trait LogSource: Send {
    /// Fills `buf` with the bytes at `offset`
    fn read_at(&mut self, offset: RingOffset, buf: &mut [u8]) -> io::Result<()>;

    fn transport(&self) -> Transport;

    /// Reads and validates the header block
    fn read_header(&mut self) -> RedoResult<LogHeader> {
        let mut buf = vec![0u8; LOG_HEADER_SIZE as usize];
        self.read_at(RingOffset::HEADER, &mut buf)
            .map_err(|e| RedoError::source_read("failed to read log header", e))?;
        LogHeader::decode(&buf)
    }
}

/// Opens `path` with the requested transport
pub fn open_source(path: &Path, transport: Transport) -> RedoResult<Box<dyn LogSource>> {
    match transport {
        Transport::Mmap => Ok(Box::new(MappedLogSource::open(path)?)),
        Transport::Block => Ok(Box::new(BlockLogSource::open(path)?)),
    }
}

fn open_file(path: &Path) -> RedoResult<File> {
    File::open(path).map_err(|e| {
        RedoError::source_read(format!("failed to open log file {}", path.display()), e)
    })
}

/// Memory-mapped transport
pub struct MappedLogSource {
    path: PathBuf,
    map: Mmap,
}

impl MappedLogSource {
    pub fn open(path: &Path) -> RedoResult<Self> {
        let file = open_file(path)?;
        // SAFETY: the engine rewrites log bytes in place but never shrinks
        // the file; torn bytes are rejected by the chunk CRC.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| {
            RedoError::source_read(format!("failed to map log file {}", path.display()), e)
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            map,
        })
    }
}

impl LogSource for MappedLogSource {
    fn read_at(&mut self, offset: RingOffset, buf: &mut [u8]) -> io::Result<()> {
        let start = offset.get() as usize;
        let end = start + buf.len();
        if end > self.map.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {}..{} past end of mapped log {} ({} bytes)",
                    start,
                    end,
                    self.path.display(),
                    self.map.len()
                ),
            ));
        }
        buf.copy_from_slice(&self.map[start..end]);
        Ok(())
    }

    fn transport(&self) -> Transport {
        Transport::Mmap
    }
}

/// Block-read transport: every read covers whole aligned blocks
pub struct BlockLogSource {
    file: File,
    scratch: Vec<u8>,
}

impl BlockLogSource {
    pub fn open(path: &Path) -> RedoResult<Self> {
        Ok(Self {
            file: open_file(path)?,
            scratch: Vec::new(),
        })
    }
}

impl LogSource for BlockLogSource {
    fn read_at(&mut self, offset: RingOffset, buf: &mut [u8]) -> io::Result<()> {
        let offset = offset.get();
        let block_start = offset - offset % LOG_BLOCK_SIZE;
        let wanted_end = offset + buf.len() as u64;
        let block_end = wanted_end.div_ceil(LOG_BLOCK_SIZE) * LOG_BLOCK_SIZE;

        self.scratch.resize((block_end - block_start) as usize, 0);
        self.file.seek(SeekFrom::Start(block_start))?;
        self.file.read_exact(&mut self.scratch)?;

        let skip = (offset - block_start) as usize;
        buf.copy_from_slice(&self.scratch[skip..skip + buf.len()]);
        Ok(())
    }

    fn transport(&self) -> Transport {
        Transport::Block
    }
}

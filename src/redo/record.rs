//! Log records and chunk framing
//!
//! A chunk is the unit the engine writes atomically (one mini-transaction):
//!
//! ```text
//! [payload_len u32][payload][seq u8][crc32 u32 over len + payload]
//! ```
//!
//! The payload is a sequence of sub-records `[type u8][body_len u32][body]`.
//! Names inside bodies are u16-length-prefixed byte strings. All integers
//! are little endian.

use std::io::{self, Cursor, Read};

use crate::checksum::compute_checksum;
use crate::page::{PageId, PageNo, SpaceId};

use super::lsn::Lsn;

/// Bytes before the payload
pub const CHUNK_HEADER_LEN: usize = 4;

/// Sequence byte plus CRC after the payload
pub const CHUNK_TRAILER_LEN: usize = 5;

pub const CHUNK_OVERHEAD: usize = CHUNK_HEADER_LEN + CHUNK_TRAILER_LEN;

/// Largest payload the engine ever frames
pub const MAX_CHUNK_PAYLOAD: usize = 1 << 20;

/// Sub-record type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    PageWrite = 1,
    FileCreate = 2,
    FileRename = 3,
    FileDelete = 4,
    FileModify = 5,
    InitPage = 6,
    Checkpoint = 7,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::PageWrite),
            2 => Some(RecordType::FileCreate),
            3 => Some(RecordType::FileRename),
            4 => Some(RecordType::FileDelete),
            5 => Some(RecordType::FileModify),
            6 => Some(RecordType::InitPage),
            7 => Some(RecordType::Checkpoint),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One decoded sub-record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Bytes written into a page body at `offset`
    PageWrite {
        page: PageId,
        offset: u16,
        data: Vec<u8>,
    },
    FileCreate {
        space: SpaceId,
        name: Vec<u8>,
    },
    FileRename {
        space: SpaceId,
        name: Vec<u8>,
        new_name: Vec<u8>,
    },
    FileDelete {
        space: SpaceId,
        name: Vec<u8>,
    },
    /// First change to a tablespace since the last checkpoint
    FileModify {
        space: SpaceId,
        name: Vec<u8>,
    },
    /// A page was (re)formatted from scratch
    InitPage { page: PageId },
    Checkpoint { lsn: Lsn },
}

impl LogRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecord::PageWrite { .. } => RecordType::PageWrite,
            LogRecord::FileCreate { .. } => RecordType::FileCreate,
            LogRecord::FileRename { .. } => RecordType::FileRename,
            LogRecord::FileDelete { .. } => RecordType::FileDelete,
            LogRecord::FileModify { .. } => RecordType::FileModify,
            LogRecord::InitPage { .. } => RecordType::InitPage,
            LogRecord::Checkpoint { .. } => RecordType::Checkpoint,
        }
    }

    /// Tablespace the record refers to, if any
    pub fn space_id(&self) -> Option<SpaceId> {
        match self {
            LogRecord::PageWrite { page, .. } | LogRecord::InitPage { page } => Some(page.space),
            LogRecord::FileCreate { space, .. }
            | LogRecord::FileRename { space, .. }
            | LogRecord::FileDelete { space, .. }
            | LogRecord::FileModify { space, .. } => Some(*space),
            LogRecord::Checkpoint { .. } => None,
        }
    }

    /// Appends the encoded sub-record to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.record_type().as_u8());
        let len_at = out.len();
        out.extend_from_slice(&[0u8; 4]);

        match self {
            LogRecord::PageWrite { page, offset, data } => {
                out.extend_from_slice(&page.space.to_le_bytes());
                out.extend_from_slice(&page.page_no.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(data);
            }
            LogRecord::FileCreate { space, name }
            | LogRecord::FileDelete { space, name }
            | LogRecord::FileModify { space, name } => {
                out.extend_from_slice(&space.to_le_bytes());
                put_name(out, name);
            }
            LogRecord::FileRename {
                space,
                name,
                new_name,
            } => {
                out.extend_from_slice(&space.to_le_bytes());
                put_name(out, name);
                put_name(out, new_name);
            }
            LogRecord::InitPage { page } => {
                out.extend_from_slice(&page.space.to_le_bytes());
                out.extend_from_slice(&page.page_no.to_le_bytes());
            }
            LogRecord::Checkpoint { lsn } => {
                out.extend_from_slice(&lsn.get().to_le_bytes());
            }
        }

        let body_len = (out.len() - len_at - 4) as u32;
        out[len_at..len_at + 4].copy_from_slice(&body_len.to_le_bytes());
    }

    /// Decodes every sub-record of a chunk payload
    pub fn decode_all(payload: &[u8]) -> io::Result<Vec<LogRecord>> {
        let mut cursor = Cursor::new(payload);
        let mut records = Vec::new();
        while (cursor.position() as usize) < payload.len() {
            let type_byte = read_u8(&mut cursor)?;
            let record_type = RecordType::from_u8(type_byte).ok_or_else(|| {
                invalid(format!("unknown log record type {}", type_byte))
            })?;
            let body_len = read_u32(&mut cursor)? as usize;
            let mut body = vec![0u8; body_len];
            cursor.read_exact(&mut body)?;
            records.push(Self::decode_body(record_type, &body)?);
        }
        Ok(records)
    }

    fn decode_body(record_type: RecordType, body: &[u8]) -> io::Result<LogRecord> {
        let mut cursor = Cursor::new(body);
        let record = match record_type {
            RecordType::PageWrite => {
                let space = read_u32(&mut cursor)?;
                let page_no: PageNo = read_u32(&mut cursor)?;
                let offset = read_u16(&mut cursor)?;
                let data = body[cursor.position() as usize..].to_vec();
                cursor.set_position(body.len() as u64);
                LogRecord::PageWrite {
                    page: PageId::new(space, page_no),
                    offset,
                    data,
                }
            }
            RecordType::FileCreate => LogRecord::FileCreate {
                space: read_u32(&mut cursor)?,
                name: read_name(&mut cursor)?,
            },
            RecordType::FileDelete => LogRecord::FileDelete {
                space: read_u32(&mut cursor)?,
                name: read_name(&mut cursor)?,
            },
            RecordType::FileModify => LogRecord::FileModify {
                space: read_u32(&mut cursor)?,
                name: read_name(&mut cursor)?,
            },
            RecordType::FileRename => LogRecord::FileRename {
                space: read_u32(&mut cursor)?,
                name: read_name(&mut cursor)?,
                new_name: read_name(&mut cursor)?,
            },
            RecordType::InitPage => {
                let space = read_u32(&mut cursor)?;
                let page_no = read_u32(&mut cursor)?;
                LogRecord::InitPage {
                    page: PageId::new(space, page_no),
                }
            }
            RecordType::Checkpoint => {
                let mut raw = [0u8; 8];
                cursor.read_exact(&mut raw)?;
                LogRecord::Checkpoint {
                    lsn: Lsn::new(u64::from_le_bytes(raw)),
                }
            }
        };
        if (cursor.position() as usize) != body.len() {
            return Err(invalid(format!(
                "{:?} record has {} trailing bytes",
                record_type,
                body.len() - cursor.position() as usize
            )));
        }
        Ok(record)
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn put_name(out: &mut Vec<u8>, name: &[u8]) {
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name);
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> io::Result<u8> {
    let mut raw = [0u8; 1];
    cursor.read_exact(&mut raw)?;
    Ok(raw[0])
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> io::Result<u16> {
    let mut raw = [0u8; 2];
    cursor.read_exact(&mut raw)?;
    Ok(u16::from_le_bytes(raw))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> io::Result<u32> {
    let mut raw = [0u8; 4];
    cursor.read_exact(&mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

fn read_name(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = read_u16(cursor)? as usize;
    let mut name = vec![0u8; len];
    cursor.read_exact(&mut name)?;
    Ok(name)
}

/// Frames a payload with the given sequence bit
pub fn frame_chunk(payload: &[u8], seq_bit: u8) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + CHUNK_OVERHEAD);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    let crc = compute_checksum(&frame);
    frame.push(seq_bit);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Encodes and frames a group of records as one chunk
pub fn encode_chunk(records: &[LogRecord], seq_bit: u8) -> Vec<u8> {
    let mut payload = Vec::new();
    for record in records {
        record.encode_into(&mut payload);
    }
    frame_chunk(&payload, seq_bit)
}

/// Whether the CRC of a complete frame matches its length and payload
pub fn frame_crc_ok(frame: &[u8]) -> bool {
    if frame.len() < CHUNK_OVERHEAD {
        return false;
    }
    let body_end = frame.len() - CHUNK_TRAILER_LEN;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&frame[frame.len() - 4..]);
    u32::from_le_bytes(raw) == compute_checksum(&frame[..body_end])
}

/// A complete chunk together with the LSN of its first byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    start: Lsn,
    frame: Vec<u8>,
}

impl Chunk {
    pub fn new(start: Lsn, frame: Vec<u8>) -> Self {
        Self { start, frame }
    }

    pub fn start(&self) -> Lsn {
        self.start
    }

    /// LSN just past the chunk
    pub fn end(&self) -> Lsn {
        self.start.advance(self.frame.len() as u64)
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn payload(&self) -> &[u8] {
        &self.frame[CHUNK_HEADER_LEN..self.frame.len() - CHUNK_TRAILER_LEN]
    }

    /// LSN of the sequence byte
    pub fn seq_lsn(&self) -> Lsn {
        self.start
            .advance((self.frame.len() - CHUNK_TRAILER_LEN) as u64)
    }

    pub fn seq_byte(&self) -> u8 {
        self.frame[self.frame.len() - CHUNK_TRAILER_LEN]
    }

    /// Forces the sequence byte to 1. Returns `true` if it changed.
    pub fn normalize_sequence_bit(&mut self) -> bool {
        let at = self.frame.len() - CHUNK_TRAILER_LEN;
        let changed = self.frame[at] != 1;
        self.frame[at] = 1;
        changed
    }

    pub fn records(&self) -> io::Result<Vec<LogRecord>> {
        LogRecord::decode_all(self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> Vec<LogRecord> {
        vec![
            LogRecord::FileModify {
                space: 5,
                name: b"db/t1".to_vec(),
            },
            LogRecord::PageWrite {
                page: PageId::new(5, 3),
                offset: 120,
                data: vec![1, 2, 3, 4],
            },
            LogRecord::FileRename {
                space: 5,
                name: b"db/t1".to_vec(),
                new_name: b"db/t1b".to_vec(),
            },
            LogRecord::InitPage {
                page: PageId::new(9, 0),
            },
            LogRecord::Checkpoint { lsn: Lsn::new(777) },
        ]
    }

    #[test]
    fn test_chunk_decodes_all_record_kinds() {
        let records = sample_records();
        let frame = encode_chunk(&records, 1);
        assert!(frame_crc_ok(&frame));

        let chunk = Chunk::new(Lsn::new(1000), frame);
        assert_eq!(chunk.records().unwrap(), records);
        assert_eq!(chunk.end(), Lsn::new(1000 + chunk.len() as u64));
    }

    #[test]
    fn test_sequence_byte_not_covered_by_crc() {
        let mut chunk = Chunk::new(Lsn::new(0), encode_chunk(&sample_records(), 0));
        assert_eq!(chunk.seq_byte(), 0);
        assert!(chunk.normalize_sequence_bit());
        assert!(!chunk.normalize_sequence_bit());
        assert_eq!(chunk.seq_byte(), 1);
        assert!(frame_crc_ok(chunk.frame()));
    }

    #[test]
    fn test_unknown_record_type_is_rejected() {
        let payload = [42u8, 0, 0, 0, 0];
        let err = LogRecord::decode_all(&payload).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let mut payload = Vec::new();
        LogRecord::FileCreate {
            space: 1,
            name: b"db/x".to_vec(),
        }
        .encode_into(&mut payload);
        payload.truncate(payload.len() - 1);
        assert!(LogRecord::decode_all(&payload).is_err());
    }

    #[test]
    fn test_space_id_of_records() {
        let records = sample_records();
        assert_eq!(records[0].space_id(), Some(5));
        assert_eq!(records[3].space_id(), Some(9));
        assert_eq!(records[4].space_id(), None);
    }
}

//! The backup's own copy of the log
//!
//! The copy is a header followed by chunks laid end to end; it never wraps,
//! so every sequence byte is stored as 1. Appends are whole chunks followed
//! by `sync_data`, so a crash can leave at most a torn final chunk.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::errors::{RedoError, RedoResult};
use super::header::LogHeader;
use super::lsn::Lsn;
use super::record::{frame_crc_ok, Chunk, CHUNK_HEADER_LEN, CHUNK_TRAILER_LEN, MAX_CHUNK_PAYLOAD};
use super::ring::LOG_HEADER_SIZE;

/// File name of the backup log inside the target directory
pub const BACKUP_LOG_NAME: &str = "aero_logfile0";

/// Appends chunks to a backup log
pub struct BackupLogWriter {
    path: PathBuf,
    file: File,
    end: Lsn,
}

impl BackupLogWriter {
    /// Creates (or replaces) the backup log; its first chunk will start at `start`
    pub fn create(path: &Path, start: Lsn) -> RedoResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                RedoError::destination_write(
                    format!("failed to create backup log {}", path.display()),
                    e,
                )
            })?;

        file.write_all(&LogHeader::backup_copy(start).encode())
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                RedoError::destination_write(
                    format!("failed to write backup log header {}", path.display()),
                    e,
                )
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            end: start,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// LSN the next appended chunk must start at
    pub fn end(&self) -> Lsn {
        self.end
    }

    /// Appends a contiguous run of chunks and syncs. Returns the new end.
    pub fn append(&mut self, chunks: &mut [Chunk]) -> RedoResult<Lsn> {
        let mut expected = self.end;
        let mut buf = Vec::with_capacity(chunks.iter().map(Chunk::len).sum());
        for chunk in chunks.iter_mut() {
            if chunk.start() != expected {
                return Err(RedoError::corruption_at(
                    chunk.start(),
                    format!("chunk is not contiguous with backup log end {}", expected),
                ));
            }
            chunk.normalize_sequence_bit();
            buf.extend_from_slice(chunk.frame());
            expected = chunk.end();
        }

        self.file
            .write_all(&buf)
            .and_then(|_| self.file.sync_data())
            .map_err(|e| {
                RedoError::destination_write(
                    format!("failed to append to backup log {}", self.path.display()),
                    e,
                )
            })?;
        self.end = expected;
        Ok(expected)
    }
}

/// Sequential reader over a backup log
pub struct BackupLogReader {
    reader: BufReader<File>,
    header: LogHeader,
    position: Lsn,
}

impl BackupLogReader {
    pub fn open(path: &Path) -> RedoResult<Self> {
        let file = File::open(path).map_err(|e| {
            RedoError::source_read(format!("failed to open backup log {}", path.display()), e)
        })?;
        let mut reader = BufReader::new(file);
        let mut raw = vec![0u8; LOG_HEADER_SIZE as usize];
        reader
            .read_exact(&mut raw)
            .map_err(|e| RedoError::source_read("failed to read backup log header", e))?;
        let header = LogHeader::decode(&raw)?;
        if !header.is_backup_copy() {
            return Err(RedoError::invalid_header(format!(
                "{} is not a backup log copy",
                path.display()
            )));
        }
        Ok(Self {
            reader,
            position: header.first_lsn,
            header,
        })
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// LSN of the next chunk
    pub fn position(&self) -> Lsn {
        self.position
    }

    /// Next chunk, or `None` at a clean end of file
    pub fn next_chunk(&mut self) -> RedoResult<Option<Chunk>> {
        let mut len_buf = [0u8; CHUNK_HEADER_LEN];
        let got = read_fully(&mut self.reader, &mut len_buf)
            .map_err(|e| RedoError::source_read("failed to read backup log", e))?;
        if got == 0 {
            return Ok(None);
        }
        if got < CHUNK_HEADER_LEN {
            return Err(RedoError::corruption_at(self.position, "truncated chunk length"));
        }

        let payload_len = u32::from_le_bytes(len_buf) as usize;
        if payload_len == 0 || payload_len > MAX_CHUNK_PAYLOAD {
            return Err(RedoError::corruption_at(
                self.position,
                format!("implausible chunk length {}", payload_len),
            ));
        }

        let mut frame = vec![0u8; CHUNK_HEADER_LEN + payload_len + CHUNK_TRAILER_LEN];
        frame[..CHUNK_HEADER_LEN].copy_from_slice(&len_buf);
        let got = read_fully(&mut self.reader, &mut frame[CHUNK_HEADER_LEN..])
            .map_err(|e| RedoError::source_read("failed to read backup log", e))?;
        if got < frame.len() - CHUNK_HEADER_LEN {
            return Err(RedoError::corruption_at(self.position, "truncated chunk"));
        }
        if !frame_crc_ok(&frame) {
            return Err(RedoError::corruption_at(self.position, "chunk checksum mismatch"));
        }

        let chunk = Chunk::new(self.position, frame);
        self.position = chunk.end();
        Ok(Some(chunk))
    }
}

fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn file_offset(header: &LogHeader, lsn: Lsn) -> u64 {
    LOG_HEADER_SIZE + lsn.distance_from(header.first_lsn)
}

/// Cuts the backup log so that it ends exactly at `lsn`.
///
/// `lsn` must be a chunk boundary at or before the current end.
pub fn truncate_at(path: &Path, lsn: Lsn) -> RedoResult<()> {
    let mut reader = BackupLogReader::open(path)?;
    let header = *reader.header();
    if lsn < header.first_lsn {
        return Err(RedoError::not_boundary(
            lsn,
            format!("backup log starts at {}", header.first_lsn),
        ));
    }
    while reader.position() < lsn {
        match reader.next_chunk()? {
            Some(_) => {}
            None => {
                return Err(RedoError::not_boundary(
                    lsn,
                    format!("backup log ends at {}", reader.position()),
                ))
            }
        }
    }
    if reader.position() != lsn {
        return Err(RedoError::not_boundary(
            lsn,
            format!("falls inside the chunk ending at {}", reader.position()),
        ));
    }
    drop(reader);

    let file = OpenOptions::new().write(true).open(path).map_err(|e| {
        RedoError::destination_write(format!("failed to open {}", path.display()), e)
    })?;
    file.set_len(file_offset(&header, lsn))
        .and_then(|_| file.sync_all())
        .map_err(|e| {
            RedoError::destination_write(format!("failed to truncate {}", path.display()), e)
        })
}

/// Rewrites every sequence byte of a backup log to 1.
///
/// Returns how many bytes changed; a second run returns 0.
pub fn normalize_sequence_bits(path: &Path) -> RedoResult<u64> {
    let mut reader = BackupLogReader::open(path)?;
    let header = *reader.header();
    let mut stale = Vec::new();
    while let Some(chunk) = reader.next_chunk()? {
        if chunk.seq_byte() != 1 {
            stale.push(file_offset(&header, chunk.seq_lsn()));
        }
    }
    drop(reader);

    if stale.is_empty() {
        return Ok(0);
    }

    let mut file = OpenOptions::new().write(true).open(path).map_err(|e| {
        RedoError::destination_write(format!("failed to open {}", path.display()), e)
    })?;
    for offset in &stale {
        file.seek(SeekFrom::Start(*offset))
            .and_then(|_| file.write_all(&[1]))
            .map_err(|e| {
                RedoError::destination_write(
                    format!("failed to normalize sequence byte at offset {}", offset),
                    e,
                )
            })?;
    }
    file.sync_all().map_err(|e| {
        RedoError::destination_write(format!("failed to sync {}", path.display()), e)
    })?;
    Ok(stale.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageId;
    use crate::redo::record::{encode_chunk, LogRecord};
    use tempfile::TempDir;

    fn chunks_from(start: Lsn, count: u32, seq_bit: u8) -> Vec<Chunk> {
        let mut lsn = start;
        (0..count)
            .map(|i| {
                let frame = encode_chunk(
                    &[LogRecord::PageWrite {
                        page: PageId::new(1, i),
                        offset: 100,
                        data: vec![i as u8; 8 + i as usize],
                    }],
                    seq_bit,
                );
                let chunk = Chunk::new(lsn, frame);
                lsn = chunk.end();
                chunk
            })
            .collect()
    }

    #[test]
    fn test_append_then_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BACKUP_LOG_NAME);
        let mut writer = BackupLogWriter::create(&path, Lsn::new(1000)).unwrap();
        let mut chunks = chunks_from(Lsn::new(1000), 4, 0);
        let end = writer.append(&mut chunks).unwrap();
        assert_eq!(end, chunks[3].end());

        let mut reader = BackupLogReader::open(&path).unwrap();
        let mut seen = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            assert_eq!(chunk.seq_byte(), 1);
            seen.push(chunk.start());
        }
        assert_eq!(seen, chunks.iter().map(Chunk::start).collect::<Vec<_>>());
        assert_eq!(reader.position(), end);
    }

    #[test]
    fn test_append_rejects_gap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BACKUP_LOG_NAME);
        let mut writer = BackupLogWriter::create(&path, Lsn::new(0)).unwrap();
        let mut chunks = chunks_from(Lsn::new(10), 1, 1);
        assert!(writer.append(&mut chunks).is_err());
        assert_eq!(writer.end(), Lsn::new(0));
    }

    #[test]
    fn test_truncate_at_boundary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BACKUP_LOG_NAME);
        let mut writer = BackupLogWriter::create(&path, Lsn::new(0)).unwrap();
        let mut chunks = chunks_from(Lsn::new(0), 5, 1);
        writer.append(&mut chunks).unwrap();

        let cut = chunks[2].end();
        truncate_at(&path, cut).unwrap();

        let mut reader = BackupLogReader::open(&path).unwrap();
        let mut count = 0;
        while reader.next_chunk().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(reader.position(), cut);
    }

    #[test]
    fn test_truncate_inside_chunk_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BACKUP_LOG_NAME);
        let mut writer = BackupLogWriter::create(&path, Lsn::new(0)).unwrap();
        let mut chunks = chunks_from(Lsn::new(0), 2, 1);
        writer.append(&mut chunks).unwrap();

        let err = truncate_at(&path, chunks[0].end().advance(3)).unwrap_err();
        assert_eq!(err.code(), crate::redo::errors::RedoErrorCode::AeroRedoNotBoundary);
        let err = truncate_at(&path, chunks[1].end().advance(100)).unwrap_err();
        assert!(err.message().contains("ends at"));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BACKUP_LOG_NAME);
        BackupLogWriter::create(&path, Lsn::new(0)).unwrap();

        // Raw generation-1 bytes appended without going through the writer
        let chunks = chunks_from(Lsn::new(0), 3, 0);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        for chunk in &chunks {
            file.write_all(chunk.frame()).unwrap();
        }
        drop(file);

        assert_eq!(normalize_sequence_bits(&path).unwrap(), 3);
        let after_first = std::fs::read(&path).unwrap();
        assert_eq!(normalize_sequence_bits(&path).unwrap(), 0);
        assert_eq!(std::fs::read(&path).unwrap(), after_first);
    }

    #[test]
    fn test_torn_tail_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BACKUP_LOG_NAME);
        let mut writer = BackupLogWriter::create(&path, Lsn::new(0)).unwrap();
        let mut chunks = chunks_from(Lsn::new(0), 2, 1);
        writer.append(&mut chunks).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 2)
            .unwrap();

        let mut reader = BackupLogReader::open(&path).unwrap();
        assert!(reader.next_chunk().unwrap().is_some());
        assert!(reader.next_chunk().is_err());
    }
}

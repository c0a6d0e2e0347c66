//! Log file header
//!
//! ```text
//! offset  size  field
//! 0       8     magic "AEROLOG1"
//! 8       8     first_lsn (LSN stored at data offset 0)
//! 16      8     capacity of the data area
//! 24      4     flags (bit 0: non-wrapping backup copy)
//! 28      8     checkpoint_lsn
//! 36      4     CRC32 over bytes [0..36)
//! ```
//!
//! The rest of the 4 KiB header block is zero.

use crate::checksum::compute_checksum;

use super::errors::{RedoError, RedoResult};
use super::lsn::Lsn;
use super::ring::{LogRing, LOG_BLOCK_SIZE, LOG_HEADER_SIZE};

pub const LOG_MAGIC: &[u8; 8] = b"AEROLOG1";

/// Header flag: the file is a backup copy and never wraps
pub const FLAG_BACKUP_COPY: u32 = 1;

const HEADER_CRC_OFFSET: usize = 36;
const HEADER_ENCODED_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub first_lsn: Lsn,
    pub capacity: u64,
    pub flags: u32,
    /// Everything before this LSN may already have been overwritten
    pub checkpoint_lsn: Lsn,
}

impl LogHeader {
    /// Header of an engine's circular log
    pub fn circular(first_lsn: Lsn, capacity: u64, checkpoint_lsn: Lsn) -> Self {
        Self {
            first_lsn,
            capacity,
            flags: 0,
            checkpoint_lsn,
        }
    }

    /// Header of a backup copy whose first byte is `start`
    pub fn backup_copy(start: Lsn) -> Self {
        Self {
            first_lsn: start,
            capacity: u64::MAX,
            flags: FLAG_BACKUP_COPY,
            checkpoint_lsn: start,
        }
    }

    pub fn is_backup_copy(&self) -> bool {
        self.flags & FLAG_BACKUP_COPY != 0
    }

    pub fn ring(&self) -> LogRing {
        if self.is_backup_copy() {
            LogRing::linear(self.first_lsn)
        } else {
            LogRing::new(self.first_lsn, self.capacity)
        }
    }

    /// Encodes the full header block
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; LOG_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(LOG_MAGIC);
        buf[8..16].copy_from_slice(&self.first_lsn.get().to_le_bytes());
        buf[16..24].copy_from_slice(&self.capacity.to_le_bytes());
        buf[24..28].copy_from_slice(&self.flags.to_le_bytes());
        buf[28..36].copy_from_slice(&self.checkpoint_lsn.get().to_le_bytes());
        let crc = compute_checksum(&buf[..HEADER_CRC_OFFSET]);
        buf[HEADER_CRC_OFFSET..HEADER_ENCODED_LEN].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> RedoResult<Self> {
        if buf.len() < HEADER_ENCODED_LEN {
            return Err(RedoError::invalid_header(format!(
                "log header too short: {} bytes",
                buf.len()
            )));
        }
        if &buf[0..8] != LOG_MAGIC {
            return Err(RedoError::invalid_header("bad log magic"));
        }
        let stored_crc = u32::from_le_bytes([buf[36], buf[37], buf[38], buf[39]]);
        if stored_crc != compute_checksum(&buf[..HEADER_CRC_OFFSET]) {
            return Err(RedoError::invalid_header("log header checksum mismatch"));
        }

        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let header = Self {
            first_lsn: Lsn::new(u64_at(8)),
            capacity: u64_at(16),
            flags: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            checkpoint_lsn: Lsn::new(u64_at(28)),
        };

        if !header.is_backup_copy() {
            if header.capacity == 0 || header.capacity % LOG_BLOCK_SIZE != 0 {
                return Err(RedoError::invalid_header(format!(
                    "log capacity {} is not a positive multiple of {}",
                    header.capacity, LOG_BLOCK_SIZE
                )));
            }
            if header.checkpoint_lsn < header.first_lsn {
                return Err(RedoError::invalid_header(format!(
                    "checkpoint LSN {} precedes first LSN {}",
                    header.checkpoint_lsn, header.first_lsn
                )));
            }
        }
        Ok(header)
    }
}

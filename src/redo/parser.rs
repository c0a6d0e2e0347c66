//! Chunk scanning over a circular log

use std::io;

use super::lsn::Lsn;
use super::record::{frame_crc_ok, Chunk, CHUNK_OVERHEAD, CHUNK_TRAILER_LEN, MAX_CHUNK_PAYLOAD};
use super::ring::LogRing;
use super::transport::LogSource;

/// Result of looking for a chunk at one LSN
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Complete(Chunk),
    /// Nothing complete at this LSN yet: the writer has not finished it,
    /// or the bytes belong to an older generation
    Incomplete,
}

/// Reads `buf.len()` logical bytes starting at `lsn`, following the wrap
pub fn read_ring(
    source: &mut dyn LogSource,
    ring: &LogRing,
    lsn: Lsn,
    buf: &mut [u8],
) -> io::Result<()> {
    let (first, second) = ring.spans(lsn, buf.len());
    source.read_at(first.offset, &mut buf[..first.len])?;
    if let Some(second) = second {
        source.read_at(second.offset, &mut buf[first.len..])?;
    }
    Ok(())
}

/// Tries to read one complete chunk starting at `lsn`.
///
/// A chunk is complete only when its length is plausible, its sequence
/// byte carries the bit of the generation that byte's own LSN falls in,
/// and the CRC matches. Anything else is [`ScanOutcome::Incomplete`].
pub fn scan_chunk(
    source: &mut dyn LogSource,
    ring: &LogRing,
    lsn: Lsn,
) -> io::Result<ScanOutcome> {
    let mut len_buf = [0u8; 4];
    read_ring(source, ring, lsn, &mut len_buf)?;
    let payload_len = u32::from_le_bytes(len_buf) as usize;
    if payload_len == 0 || payload_len > MAX_CHUNK_PAYLOAD {
        return Ok(ScanOutcome::Incomplete);
    }

    let total = payload_len + CHUNK_OVERHEAD;
    if total as u64 > ring.capacity() {
        return Ok(ScanOutcome::Incomplete);
    }

    let mut frame = vec![0u8; total];
    read_ring(source, ring, lsn, &mut frame)?;

    let seq_at = total - CHUNK_TRAILER_LEN;
    let seq_lsn = lsn.advance(seq_at as u64);
    if frame[seq_at] != ring.sequence_bit(seq_lsn) {
        return Ok(ScanOutcome::Incomplete);
    }
    if !frame_crc_ok(&frame) {
        return Ok(ScanOutcome::Incomplete);
    }
    Ok(ScanOutcome::Complete(Chunk::new(lsn, frame)))
}

//! Circular log geometry
//!
//! The engine's log file is a 4 KiB header followed by a data area of
//! `capacity` bytes that is reused in generations:
//!
//! ```text
//! physical offset = LOG_HEADER_SIZE + (lsn - first_lsn) % capacity
//! generation      = (lsn - first_lsn) / capacity
//! sequence bit    = 1 for even generations, 0 for odd ones
//! ```
//!
//! Every chunk ends with a byte holding the sequence bit of the generation
//! it was written in, so stale bytes left by the previous generation are
//! told apart from fresh ones. The backup copy is the same layout with an
//! unbounded capacity: it never wraps and every sequence byte is 1.

use super::lsn::Lsn;

/// Bytes reserved for the log header
pub const LOG_HEADER_SIZE: u64 = 4096;

/// I/O granularity of the block-read transport
pub const LOG_BLOCK_SIZE: u64 = 512;

/// Physical byte offset inside the log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingOffset(u64);

impl RingOffset {
    /// Offset of the log header
    pub const HEADER: RingOffset = RingOffset(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

/// A contiguous physical range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSpan {
    pub offset: RingOffset,
    pub len: usize,
}

/// Mapping between LSNs and physical offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRing {
    first_lsn: Lsn,
    capacity: u64,
}

impl LogRing {
    /// A circular data area of `capacity` bytes starting at `first_lsn`
    pub fn new(first_lsn: Lsn, capacity: u64) -> Self {
        debug_assert!(capacity > 0);
        Self {
            first_lsn,
            capacity: capacity.max(1),
        }
    }

    /// A data area that never wraps (the backup copy)
    pub fn linear(first_lsn: Lsn) -> Self {
        Self {
            first_lsn,
            capacity: u64::MAX - LOG_HEADER_SIZE,
        }
    }

    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_linear(&self) -> bool {
        self.capacity == u64::MAX - LOG_HEADER_SIZE
    }

    fn relative(&self, lsn: Lsn) -> u64 {
        lsn.distance_from(self.first_lsn)
    }

    /// How many times the data area has been reused before `lsn`
    pub fn generation(&self, lsn: Lsn) -> u64 {
        self.relative(lsn) / self.capacity
    }

    /// Sequence bit a chunk byte at `lsn` must carry in the current generation
    pub fn sequence_bit(&self, lsn: Lsn) -> u8 {
        if self.generation(lsn) % 2 == 0 {
            1
        } else {
            0
        }
    }

    pub fn offset_of(&self, lsn: Lsn) -> RingOffset {
        RingOffset(LOG_HEADER_SIZE + self.relative(lsn) % self.capacity)
    }

    /// Physical ranges holding `len` bytes from `lsn`, split at the wrap point.
    ///
    /// `len` must not exceed the capacity.
    pub fn spans(&self, lsn: Lsn, len: usize) -> (RingSpan, Option<RingSpan>) {
        let pos = self.relative(lsn) % self.capacity;
        let until_wrap = self.capacity - pos;
        if len as u64 <= until_wrap {
            (
                RingSpan {
                    offset: RingOffset(LOG_HEADER_SIZE + pos),
                    len,
                },
                None,
            )
        } else {
            let head = until_wrap as usize;
            (
                RingSpan {
                    offset: RingOffset(LOG_HEADER_SIZE + pos),
                    len: head,
                },
                Some(RingSpan {
                    offset: RingOffset(LOG_HEADER_SIZE),
                    len: len - head,
                }),
            )
        }
    }

    /// Total file length for a circular ring
    pub fn file_len(&self) -> u64 {
        LOG_HEADER_SIZE + self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_wrap_around() {
        let ring = LogRing::new(Lsn::new(1000), 512);
        assert_eq!(ring.offset_of(Lsn::new(1000)).get(), LOG_HEADER_SIZE);
        assert_eq!(ring.offset_of(Lsn::new(1511)).get(), LOG_HEADER_SIZE + 511);
        assert_eq!(ring.offset_of(Lsn::new(1512)).get(), LOG_HEADER_SIZE);
        assert_eq!(ring.offset_of(Lsn::new(1600)).get(), LOG_HEADER_SIZE + 88);
    }

    #[test]
    fn test_sequence_bit_alternates_per_generation() {
        let ring = LogRing::new(Lsn::new(0), 100);
        assert_eq!(ring.sequence_bit(Lsn::new(0)), 1);
        assert_eq!(ring.sequence_bit(Lsn::new(99)), 1);
        assert_eq!(ring.sequence_bit(Lsn::new(100)), 0);
        assert_eq!(ring.sequence_bit(Lsn::new(250)), 1);
        assert_eq!(ring.generation(Lsn::new(250)), 2);
    }

    #[test]
    fn test_spans_split_at_wrap() {
        let ring = LogRing::new(Lsn::new(0), 100);
        let (first, second) = ring.spans(Lsn::new(90), 25);
        assert_eq!(first.offset.get(), LOG_HEADER_SIZE + 90);
        assert_eq!(first.len, 10);
        let second = second.unwrap();
        assert_eq!(second.offset.get(), LOG_HEADER_SIZE);
        assert_eq!(second.len, 15);
    }

    #[test]
    fn test_spans_exactly_to_end_do_not_split() {
        let ring = LogRing::new(Lsn::new(0), 100);
        let (first, second) = ring.spans(Lsn::new(60), 40);
        assert_eq!(first.len, 40);
        assert!(second.is_none());
    }

    #[test]
    fn test_linear_ring_never_flips() {
        let ring = LogRing::linear(Lsn::new(5000));
        assert!(ring.is_linear());
        assert_eq!(ring.sequence_bit(Lsn::new(5000 + (1 << 40))), 1);
        assert_eq!(ring.offset_of(Lsn::new(5010)).get(), LOG_HEADER_SIZE + 10);
    }
}

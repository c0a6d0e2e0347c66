//! Log sequence numbers

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic logical byte offset into the redo log
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The LSN `bytes` further along the log
    pub fn advance(self, bytes: u64) -> Lsn {
        Lsn(self.0.saturating_add(bytes))
    }

    /// Bytes between `earlier` and `self`, zero if `earlier` is ahead
    pub fn distance_from(self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_and_distance() {
        let start = Lsn::new(100);
        let end = start.advance(28);
        assert_eq!(end, Lsn::new(128));
        assert_eq!(end.distance_from(start), 28);
        assert_eq!(start.distance_from(end), 0);
    }

    #[test]
    fn test_serializes_as_plain_number() {
        assert_eq!(serde_json::to_string(&Lsn::new(42)).unwrap(), "42");
    }
}

//! CRC32 checksums shared by the page and log formats
//!
//! - Every page body and every log chunk carries a CRC32 (IEEE polynomial)
//! - A mismatch is never repaired in place; callers decide what it means

use crc32fast::Hasher;

/// Computes a CRC32 checksum over the provided data.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verifies that the computed checksum matches the expected checksum.
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    compute_checksum(data) == expected
}

//! Page format of the AeroDB page store
//!
//! Every tablespace file is an array of fixed-size pages. The backup never
//! interprets page bodies; it only needs enough of the format to detect a
//! page torn by a concurrent writer and to ask page 0 which pages are in use.
//!
//! # Layout
//!
//! ```text
//! offset        size  field
//! 0             4     CRC32 over [4 .. PAGE_SIZE-8)
//! 4             4     page number
//! 8             8     page LSN
//! 16            4     space id
//! 20            2     page type
//! 38            ..    body (page 0: free-space header, see fsp.rs)
//! PAGE_SIZE-8   8     copy of the page LSN
//! ```
//!
//! All integers are little endian. An all-zero page is a valid, never
//! written page.

mod fsp;

pub use fsp::{read_fsp_header, FspHeader, FSP_BITMAP_PAGES, FSP_HEADER_OFFSET};

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::checksum::compute_checksum;

/// Size of every page in bytes
pub const PAGE_SIZE: usize = 16 * 1024;

/// Bytes reserved for the page header
pub const FIL_HEADER_SIZE: usize = 38;

/// Bytes reserved for the page trailer
pub const FIL_TRAILER_SIZE: usize = 8;

/// Freshly allocated page
pub const PAGE_TYPE_ALLOCATED: u16 = 0;
/// Page 0: free-space header
pub const PAGE_TYPE_FSP_HDR: u16 = 8;
/// B-tree page
pub const PAGE_TYPE_INDEX: u16 = 17855;

const OFFSET_CHECKSUM: usize = 0;
const OFFSET_PAGE_NO: usize = 4;
const OFFSET_LSN: usize = 8;
const OFFSET_SPACE_ID: usize = 16;
const OFFSET_PAGE_TYPE: usize = 20;
const OFFSET_TRAILER: usize = PAGE_SIZE - FIL_TRAILER_SIZE;

/// Tablespace identifier
pub type SpaceId = u32;

/// Page number within a tablespace
pub type PageNo = u32;

/// Globally unique page address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub space: SpaceId,
    pub page_no: PageNo,
}

impl PageId {
    pub fn new(space: SpaceId, page_no: PageNo) -> Self {
        Self { space, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.space, self.page_no)
    }
}

/// Result of validating one page image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Never written
    Zero,
    /// Checksum and trailer agree with the header
    Valid,
    /// Torn or damaged
    Corrupted,
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_le_bytes(raw)
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Checksum of a page image, excluding the stored checksum and the trailer
pub fn page_checksum(page: &[u8]) -> u32 {
    compute_checksum(&page[OFFSET_PAGE_NO..OFFSET_TRAILER])
}

pub fn page_no(page: &[u8]) -> PageNo {
    read_u32(page, OFFSET_PAGE_NO)
}

pub fn page_lsn(page: &[u8]) -> u64 {
    read_u64(page, OFFSET_LSN)
}

pub fn space_id(page: &[u8]) -> SpaceId {
    read_u32(page, OFFSET_SPACE_ID)
}

pub fn page_type(page: &[u8]) -> u16 {
    read_u16(page, OFFSET_PAGE_TYPE)
}

/// Recomputes the trailer and checksum after the page was modified
pub fn stamp(page: &mut [u8]) {
    let lsn = page_lsn(page);
    page[OFFSET_TRAILER..PAGE_SIZE].copy_from_slice(&lsn.to_le_bytes());
    let checksum = page_checksum(page);
    page[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());
}

/// Formats `page` as an empty page of the given type
pub fn init_page(page: &mut [u8], id: PageId, page_type: u16, lsn: u64) {
    page.fill(0);
    page[OFFSET_PAGE_NO..OFFSET_PAGE_NO + 4].copy_from_slice(&id.page_no.to_le_bytes());
    page[OFFSET_LSN..OFFSET_LSN + 8].copy_from_slice(&lsn.to_le_bytes());
    page[OFFSET_SPACE_ID..OFFSET_SPACE_ID + 4].copy_from_slice(&id.space.to_le_bytes());
    page[OFFSET_PAGE_TYPE..OFFSET_PAGE_TYPE + 2].copy_from_slice(&page_type.to_le_bytes());
    stamp(page);
}

/// Applies a body write and moves the page to `lsn`.
///
/// Returns `false` without touching the page when the write would overlap
/// the header or trailer.
pub fn apply_write(page: &mut [u8], id: PageId, offset: usize, data: &[u8], lsn: u64) -> bool {
    if offset < FIL_HEADER_SIZE || offset + data.len() > OFFSET_TRAILER {
        return false;
    }
    page[OFFSET_PAGE_NO..OFFSET_PAGE_NO + 4].copy_from_slice(&id.page_no.to_le_bytes());
    page[OFFSET_SPACE_ID..OFFSET_SPACE_ID + 4].copy_from_slice(&id.space.to_le_bytes());
    page[offset..offset + data.len()].copy_from_slice(data);
    page[OFFSET_LSN..OFFSET_LSN + 8].copy_from_slice(&lsn.to_le_bytes());
    stamp(page);
    true
}

/// Validates a page image in isolation
pub fn verify(page: &[u8]) -> PageStatus {
    if page.iter().all(|b| *b == 0) {
        return PageStatus::Zero;
    }
    if read_u32(page, OFFSET_CHECKSUM) != page_checksum(page) {
        return PageStatus::Corrupted;
    }
    if read_u64(page, OFFSET_TRAILER) != page_lsn(page) {
        return PageStatus::Corrupted;
    }
    PageStatus::Valid
}

/// Validates a page image read from a known address.
///
/// A page that is internally consistent but carries another page's number
/// was read from the wrong place (or half-extended) and counts as corrupted.
pub fn verify_at(page: &[u8], expected: PageId) -> PageStatus {
    match verify(page) {
        PageStatus::Valid if page_no(page) != expected.page_no => PageStatus::Corrupted,
        PageStatus::Valid if space_id(page) != expected.space => PageStatus::Corrupted,
        status => status,
    }
}

/// Reads up to `buf.len() / PAGE_SIZE` pages starting at `first`.
///
/// Returns the number of whole pages read; a trailing partial page (a file
/// being extended) is not counted.
pub fn read_pages(file: &File, first: PageNo, buf: &mut [u8]) -> io::Result<usize> {
    let mut reader = file;
    reader.seek(SeekFrom::Start(first as u64 * PAGE_SIZE as u64))?;

    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled / PAGE_SIZE)
}

/// Reads one page; `Ok(false)` when the file ends before it
pub fn read_page(file: &File, page_no: PageNo, buf: &mut [u8]) -> io::Result<bool> {
    Ok(read_pages(file, page_no, &mut buf[..PAGE_SIZE])? == 1)
}

/// Writes one page in place, extending the file when needed
pub fn write_page(file: &File, page_no: PageNo, buf: &[u8]) -> io::Result<()> {
    let mut writer = file;
    writer.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))?;
    writer.write_all(&buf[..PAGE_SIZE])
}

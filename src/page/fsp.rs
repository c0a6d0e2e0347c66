//! Free-space header on page 0
//!
//! ```text
//! offset (from 38)  size  field
//! 0                 4     space id
//! 4                 4     flags
//! 8                 4     size in pages
//! 12                ..    allocation bitmap, bit i set = page i in use
//! ```
//!
//! Pages past the end of the bitmap cannot be proven free and are reported
//! as allocated.

use std::fs::File;
use std::io;

use super::{
    init_page, page_no, read_page, read_u32, space_id, stamp, verify, PageId, PageNo,
    PageStatus, SpaceId, FIL_HEADER_SIZE, FIL_TRAILER_SIZE, PAGE_SIZE, PAGE_TYPE_FSP_HDR,
};

/// Offset of the free-space header inside page 0
pub const FSP_HEADER_OFFSET: usize = FIL_HEADER_SIZE;

const FSP_SPACE_ID: usize = 0;
const FSP_FLAGS: usize = 4;
const FSP_SIZE: usize = 8;
const FSP_BITMAP: usize = 12;

const FSP_BITMAP_BYTES: usize = PAGE_SIZE - FSP_HEADER_OFFSET - FSP_BITMAP - FIL_TRAILER_SIZE;

/// Number of pages whose allocation state page 0 can describe
pub const FSP_BITMAP_PAGES: u64 = FSP_BITMAP_BYTES as u64 * 8;

/// Parsed free-space header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FspHeader {
    pub space_id: SpaceId,
    pub flags: u32,
    pub size: u32,
    bitmap: Vec<u8>,
}

impl FspHeader {
    /// A header with no page marked allocated
    pub fn new(space_id: SpaceId, size: u32) -> Self {
        Self {
            space_id,
            flags: 0,
            size,
            bitmap: vec![0; FSP_BITMAP_BYTES],
        }
    }

    /// Parses page 0; `None` unless the page is valid and self-consistent
    pub fn parse(page0: &[u8]) -> Option<Self> {
        if verify(page0) != PageStatus::Valid || page_no(page0) != 0 {
            return None;
        }
        let base = FSP_HEADER_OFFSET;
        let header = Self {
            space_id: read_u32(page0, base + FSP_SPACE_ID),
            flags: read_u32(page0, base + FSP_FLAGS),
            size: read_u32(page0, base + FSP_SIZE),
            bitmap: page0[base + FSP_BITMAP..base + FSP_BITMAP + FSP_BITMAP_BYTES].to_vec(),
        };
        if header.space_id != space_id(page0) {
            return None;
        }
        Some(header)
    }

    pub fn is_allocated(&self, page: PageNo) -> bool {
        let byte = page as usize / 8;
        match self.bitmap.get(byte) {
            Some(bits) => bits & (1 << (page % 8)) != 0,
            None => true,
        }
    }

    pub fn set_allocated(&mut self, page: PageNo, allocated: bool) {
        let byte = page as usize / 8;
        if let Some(bits) = self.bitmap.get_mut(byte) {
            if allocated {
                *bits |= 1 << (page % 8);
            } else {
                *bits &= !(1 << (page % 8));
            }
        }
    }

    /// Formats `page0` with this header at `lsn`
    pub fn write_to(&self, page0: &mut [u8], lsn: u64) {
        init_page(page0, PageId::new(self.space_id, 0), PAGE_TYPE_FSP_HDR, lsn);
        let base = FSP_HEADER_OFFSET;
        page0[base + FSP_SPACE_ID..base + FSP_SPACE_ID + 4]
            .copy_from_slice(&self.space_id.to_le_bytes());
        page0[base + FSP_FLAGS..base + FSP_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
        page0[base + FSP_SIZE..base + FSP_SIZE + 4].copy_from_slice(&self.size.to_le_bytes());
        page0[base + FSP_BITMAP..base + FSP_BITMAP + FSP_BITMAP_BYTES].copy_from_slice(&self.bitmap);
        stamp(page0);
    }
}

/// Reads and parses page 0 of an open tablespace file
pub fn read_fsp_header(file: &File) -> io::Result<Option<FspHeader>> {
    let mut page0 = vec![0u8; PAGE_SIZE];
    if !read_page(file, 0, &mut page0)? {
        return Ok(None);
    }
    Ok(FspHeader::parse(&page0))
}

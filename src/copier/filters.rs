//! Read and write filters
//!
//! A read filter decides which page ranges of a tablespace are read; a
//! write filter decides what is written for the pages that were read.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::ops::Range;
use std::path::Path;

use crate::page::{page_lsn, PageNo, SpaceId, PAGE_SIZE};
use crate::redo::Lsn;

use super::errors::{CopyError, CopyResult};
use super::sink::{Sink, SinkFile};

/// Magic of a delta group header page that more groups follow
pub const DELTA_MAGIC: &[u8; 4] = b"xtra";
/// Magic of the last delta group header page
pub const DELTA_LAST_MAGIC: &[u8; 4] = b"XTRA";
/// Terminates a group's page list when it has fewer than the maximum
pub const DELTA_LIST_END: u32 = 0xFFFF_FFFF;
/// Pages per delta group
pub const DELTA_GROUP_PAGES: usize = 64;
pub const DELTA_SUFFIX: &str = ".delta";
pub const META_SUFFIX: &str = ".meta";

/// Pages changed since the incremental base, per tablespace
///
/// File format: one line per tablespace, `<space id> <page> <page> ...`.
/// Blank lines and lines starting with `#` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedPageBitmap {
    spaces: BTreeMap<SpaceId, BTreeSet<PageNo>>,
}

impl ChangedPageBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> CopyResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| CopyError::bitmap_io(path, e))?;
        Self::parse(&text).map_err(|reason| CopyError::bitmap(path, reason))
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let mut bitmap = Self::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let space = fields
                .next()
                .and_then(|f| f.parse::<SpaceId>().ok())
                .ok_or_else(|| format!("line {}: missing space id", idx + 1))?;
            let pages = bitmap.spaces.entry(space).or_default();
            for field in fields {
                let page = field
                    .parse::<PageNo>()
                    .map_err(|_| format!("line {}: bad page number '{}'", idx + 1, field))?;
                pages.insert(page);
            }
        }
        Ok(bitmap)
    }

    pub fn mark(&mut self, space: SpaceId, page: PageNo) {
        self.spaces.entry(space).or_default().insert(page);
    }

    pub fn pages(&self, space: SpaceId) -> Option<&BTreeSet<PageNo>> {
        self.spaces.get(&space)
    }
}

#[derive(Debug, Clone, Default)]
pub enum ReadFilter {
    #[default]
    FullScan,
    /// Only pages listed in the bitmap, plus page 0
    ChangedPages(ChangedPageBitmap),
}

impl ReadFilter {
    /// Page ranges to read, or `None` to read until the end of the file
    pub fn ranges(&self, space: SpaceId, page_count: PageNo) -> Option<Vec<Range<PageNo>>> {
        match self {
            ReadFilter::FullScan => None,
            ReadFilter::ChangedPages(bitmap) => {
                let mut ranges: Vec<Range<PageNo>> = Vec::new();
                let listed = bitmap.pages(space).into_iter().flatten().copied();
                for page in std::iter::once(0).chain(listed) {
                    if page >= page_count {
                        break;
                    }
                    match ranges.last_mut() {
                        Some(last) if last.end == page => last.end += 1,
                        Some(last) if last.end > page => {}
                        _ => ranges.push(page..page + 1),
                    }
                }
                Some(ranges)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteFilter {
    #[default]
    Identity,
    /// Pages whose LSN is above `base_lsn`, delta encoded
    Delta { base_lsn: Lsn },
}

impl WriteFilter {
    /// Opens the writer for the copy of one file.
    ///
    /// `dest` is the relative destination name of the full file.
    pub fn open(
        &self,
        sink: &dyn Sink,
        dest: &str,
        space: SpaceId,
    ) -> CopyResult<Box<dyn PageWriter>> {
        match *self {
            WriteFilter::Identity => Ok(Box::new(IdentityWriter {
                name: dest.to_string(),
                file: sink.create(dest)?,
                next: 0,
                written: 0,
            })),
            WriteFilter::Delta { base_lsn } => {
                sink.write_file(
                    &format!("{}{}", dest, META_SUFFIX),
                    DeltaMeta {
                        page_size: PAGE_SIZE as u32,
                        space_id: space,
                    }
                    .render()
                    .as_bytes(),
                )?;
                Ok(Box::new(DeltaWriter {
                    file: sink.create(&format!("{}{}", dest, DELTA_SUFFIX))?,
                    base_lsn,
                    group: Vec::new(),
                    written: 0,
                }))
            }
        }
    }
}

/// Receives validated pages of one file in ascending page order
pub trait PageWriter: Send {
    fn write_pages(&mut self, first: PageNo, pages: &[u8]) -> CopyResult<()>;

    /// Completes the file and returns the number of pages written
    fn finish(self: Box<Self>) -> CopyResult<u64>;
}

struct IdentityWriter {
    name: String,
    file: Box<dyn SinkFile>,
    next: PageNo,
    written: u64,
}

impl PageWriter for IdentityWriter {
    fn write_pages(&mut self, first: PageNo, pages: &[u8]) -> CopyResult<()> {
        if first != self.next {
            return Err(CopyError::aborted(format!(
                "full copy of '{}' expected page {} but got {}",
                self.name, self.next, first
            )));
        }
        self.file.write_all(pages)?;
        let count = (pages.len() / PAGE_SIZE) as u64;
        self.next += count as PageNo;
        self.written += count;
        Ok(())
    }

    fn finish(self: Box<Self>) -> CopyResult<u64> {
        let written = self.written;
        self.file.finish()?;
        Ok(written)
    }
}

struct DeltaWriter {
    file: Box<dyn SinkFile>,
    base_lsn: Lsn,
    group: Vec<(PageNo, Vec<u8>)>,
    written: u64,
}

impl DeltaWriter {
    fn flush_group(&mut self, magic: &[u8; 4]) -> CopyResult<()> {
        let mut header = vec![0u8; PAGE_SIZE];
        header[..4].copy_from_slice(magic);
        for (idx, (page_no, _)) in self.group.iter().enumerate() {
            let at = 4 + idx * 4;
            header[at..at + 4].copy_from_slice(&page_no.to_be_bytes());
        }
        if self.group.len() < DELTA_GROUP_PAGES {
            let at = 4 + self.group.len() * 4;
            header[at..at + 4].copy_from_slice(&DELTA_LIST_END.to_be_bytes());
        }
        self.file.write_all(&header)?;
        for (_, page) in self.group.drain(..) {
            self.file.write_all(&page)?;
        }
        Ok(())
    }
}

impl PageWriter for DeltaWriter {
    fn write_pages(&mut self, first: PageNo, pages: &[u8]) -> CopyResult<()> {
        for (idx, page) in pages.chunks_exact(PAGE_SIZE).enumerate() {
            if page_lsn(page) <= self.base_lsn.get() {
                continue;
            }
            if self.group.len() == DELTA_GROUP_PAGES {
                self.flush_group(DELTA_MAGIC)?;
            }
            self.group.push((first + idx as PageNo, page.to_vec()));
            self.written += 1;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> CopyResult<u64> {
        self.flush_group(DELTA_LAST_MAGIC)?;
        let written = self.written;
        self.file.finish()?;
        Ok(written)
    }
}

/// Contents of a `.meta` file next to a delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaMeta {
    pub page_size: u32,
    pub space_id: SpaceId,
}

impl DeltaMeta {
    pub fn render(&self) -> String {
        format!(
            "page_size = {}\nspace_id = {}\n",
            self.page_size, self.space_id
        )
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut page_size = None;
        let mut space_id = None;
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "page_size" => page_size = value.trim().parse().ok(),
                "space_id" => space_id = value.trim().parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            page_size: page_size?,
            space_id: space_id?,
        })
    }
}

/// One decoded delta group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaGroup {
    pub pages: Vec<(PageNo, Vec<u8>)>,
    pub last: bool,
}

/// Splits a `.delta` file into its groups; `None` when the data is malformed
pub fn decode_delta(data: &[u8]) -> Option<Vec<DeltaGroup>> {
    let mut groups = Vec::new();
    let mut pos = 0;
    loop {
        let header = data.get(pos..pos + PAGE_SIZE)?;
        let last = match &header[..4] {
            m if m == DELTA_LAST_MAGIC => true,
            m if m == DELTA_MAGIC => false,
            _ => return None,
        };
        pos += PAGE_SIZE;

        let mut pages = Vec::new();
        for idx in 0..DELTA_GROUP_PAGES {
            let at = 4 + idx * 4;
            let page_no = u32::from_be_bytes([
                header[at],
                header[at + 1],
                header[at + 2],
                header[at + 3],
            ]);
            if page_no == DELTA_LIST_END {
                break;
            }
            let body = data.get(pos..pos + PAGE_SIZE)?;
            pages.push((page_no, body.to_vec()));
            pos += PAGE_SIZE;
        }
        groups.push(DeltaGroup { pages, last });
        if last {
            break;
        }
    }
    if pos != data.len() {
        return None;
    }
    Some(groups)
}

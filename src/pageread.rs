//! Uniform access to pagemap metadata and page content
//!
//! The fault loop sources pages through the `PageRead` trait and never
//! learns where the bytes come from. The local reader serves content from
//! the pages image by precomputed record offsets; the remote reader keeps
//! the pagemap lookup local and fetches only page content from a page
//! server over a stream socket.

use crate::images::{open_pages, page_size, PagemapEntry, PagemapImage};
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::Path;

// Read hints. The remote backend may batch plain reads; ASAP requests
// immediate submission for a faulting task.
pub const RF_ASYNC: u32 = 0x1;
pub const RF_ASAP: u32 = 0x2;

pub trait PageRead {
    /// Step to the next pagemap record; `None` at end
    fn advance(&mut self) -> Option<PagemapEntry>;

    /// Rewind to before the first record
    fn reset(&mut self);

    /// Position at the record covering `addr`, if any
    fn seek_pagemap(&mut self, addr: u64) -> Option<PagemapEntry>;

    /// Advance the read position within the current record without
    /// consuming content
    fn skip_pages(&mut self, bytes: u64);

    /// Read `nr` pages of content starting at `addr` into `buf`.
    /// Returns the number of pages read; completion is synchronous for
    /// both backends, so the caller installs right after this returns.
    fn read_pages(&mut self, addr: u64, nr: usize, buf: &mut [u8], flags: u32) -> Result<usize>;
}

/// Shared pagemap positioning for both backends
struct PagemapCursor {
    entries: Vec<PagemapEntry>,
    cur: Option<usize>,
    /// Byte offset of the read position into the current record
    skip: u64,
}

impl PagemapCursor {
    fn new(entries: Vec<PagemapEntry>) -> Self {
        Self {
            entries,
            cur: None,
            skip: 0,
        }
    }

    fn advance(&mut self) -> Option<PagemapEntry> {
        let next = match self.cur {
            None => 0,
            Some(i) => i + 1,
        };
        if next >= self.entries.len() {
            return None;
        }
        self.cur = Some(next);
        self.skip = 0;
        Some(self.entries[next])
    }

    fn reset(&mut self) {
        self.cur = None;
        self.skip = 0;
    }

    fn seek_pagemap(&mut self, addr: u64) -> Option<PagemapEntry> {
        // Records are sorted by vaddr; find the first one ending past addr
        let idx = self.entries.partition_point(|pe| pe.end() <= addr);
        if idx < self.entries.len() && self.entries[idx].covers(addr) {
            self.cur = Some(idx);
            self.skip = 0;
            return Some(self.entries[idx]);
        }
        None
    }

    fn skip_pages(&mut self, bytes: u64) {
        self.skip += bytes;
    }

    fn index(&self) -> Option<usize> {
        self.cur
    }

    fn current(&self) -> Option<PagemapEntry> {
        self.cur.map(|i| self.entries[i])
    }

    /// The record covering the requested range, or an error when the
    /// reader is mispositioned
    fn record_for(&self, addr: u64, nr: usize) -> Result<(usize, PagemapEntry)> {
        let Some(idx) = self.index() else {
            bail!("page read at {:#x} with no current pagemap record", addr);
        };
        let pe = self.entries[idx];
        let len = nr as u64 * page_size();
        ensure!(
            addr >= pe.vaddr && addr + len <= pe.end(),
            "page read beyond pagemap record: {:#x}/{} pages",
            addr,
            nr
        );
        ensure!(
            !pe.is_zero(),
            "page read from a zero record at {:#x}",
            addr
        );
        debug_assert_eq!(pe.vaddr + self.skip, addr);
        Ok((idx, pe))
    }
}

// =============================================================================
// Local Backend
// =============================================================================

pub struct LocalPageReader {
    cursor: PagemapCursor,
    /// Byte offset of each record's content in the pages file; zero
    /// records occupy no bytes there
    offsets: Vec<u64>,
    pages: File,
}

impl LocalPageReader {
    pub fn open(dir: &Path, pid: i32) -> Result<Self> {
        let pagemap = PagemapImage::load(dir, pid)?;

        let mut offsets = Vec::with_capacity(pagemap.entries.len());
        let mut off = 0u64;
        for pe in &pagemap.entries {
            offsets.push(off);
            if !pe.is_zero() {
                off += pe.len();
            }
        }

        let pages = open_pages(dir, pid)?;
        Ok(Self {
            cursor: PagemapCursor::new(pagemap.entries),
            offsets,
            pages,
        })
    }
}

impl PageRead for LocalPageReader {
    fn advance(&mut self) -> Option<PagemapEntry> {
        self.cursor.advance()
    }

    fn reset(&mut self) {
        self.cursor.reset();
    }

    fn seek_pagemap(&mut self, addr: u64) -> Option<PagemapEntry> {
        self.cursor.seek_pagemap(addr)
    }

    fn skip_pages(&mut self, bytes: u64) {
        self.cursor.skip_pages(bytes);
    }

    fn read_pages(&mut self, addr: u64, nr: usize, buf: &mut [u8], _flags: u32) -> Result<usize> {
        let (idx, pe) = self.cursor.record_for(addr, nr)?;
        let len = (nr as u64 * page_size()) as usize;

        let off = self.offsets[idx] + (addr - pe.vaddr);
        self.pages.seek(SeekFrom::Start(off))?;
        self.pages
            .read_exact(&mut buf[..len])
            .with_context(|| format!("Short pages image at offset {}", off))?;
        Ok(nr)
    }
}

// =============================================================================
// Remote Backend
// =============================================================================

/// Content request sent to a remote page server, length-prefixed bincode.
/// The reply is the raw page bytes, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub pid: i32,
    pub vaddr: u64,
    pub nr_pages: u32,
    pub flags: u32,
}

pub struct RemotePageReader {
    cursor: PagemapCursor,
    sock: TcpStream,
    pid: i32,
}

impl RemotePageReader {
    /// Pagemap metadata still comes from the local image; only page
    /// content crosses the wire.
    pub fn connect(dir: &Path, pid: i32, addr: &str) -> Result<Self> {
        let pagemap = PagemapImage::load(dir, pid)?;
        let sock = TcpStream::connect(addr)
            .with_context(|| format!("connect to page server {} failed", addr))?;
        eprintln!("[pageread] {}: connected to page server {}", pid, addr);
        Ok(Self {
            cursor: PagemapCursor::new(pagemap.entries),
            sock,
            pid,
        })
    }
}

impl PageRead for RemotePageReader {
    fn advance(&mut self) -> Option<PagemapEntry> {
        self.cursor.advance()
    }

    fn reset(&mut self) {
        self.cursor.reset();
    }

    fn seek_pagemap(&mut self, addr: u64) -> Option<PagemapEntry> {
        self.cursor.seek_pagemap(addr)
    }

    fn skip_pages(&mut self, bytes: u64) {
        self.cursor.skip_pages(bytes);
    }

    fn read_pages(&mut self, addr: u64, nr: usize, buf: &mut [u8], flags: u32) -> Result<usize> {
        self.cursor.record_for(addr, nr)?;
        let len = (nr as u64 * page_size()) as usize;

        let req = PageRequest {
            pid: self.pid,
            vaddr: addr,
            nr_pages: nr as u32,
            flags,
        };
        let payload = bincode::serialize(&req)?;
        self.sock.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.sock.write_all(&payload)?;

        self.sock
            .read_exact(&mut buf[..len])
            .with_context(|| format!("{}: page server reply short at {:#x}", self.pid, addr))?;
        Ok(nr)
    }
}

/// Open the page source selected by the configuration
pub fn open_page_read(
    dir: &Path,
    pid: i32,
    page_server: Option<&str>,
) -> Result<Box<dyn PageRead>> {
    match page_server {
        Some(addr) => Ok(Box::new(RemotePageReader::connect(dir, pid, addr)?)),
        None => Ok(Box::new(LocalPageReader::open(dir, pid)?)),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::PE_LAZY;

    fn entries() -> Vec<PagemapEntry> {
        let ps = page_size();
        vec![
            PagemapEntry {
                vaddr: ps,
                nr_pages: 2,
                flags: PE_LAZY,
            },
            PagemapEntry {
                vaddr: 8 * ps,
                nr_pages: 1,
                flags: PE_LAZY,
            },
        ]
    }

    #[test]
    fn test_cursor_advance_and_reset() {
        let mut cursor = PagemapCursor::new(entries());
        assert_eq!(cursor.advance().unwrap().vaddr, page_size());
        assert_eq!(cursor.advance().unwrap().vaddr, 8 * page_size());
        assert!(cursor.advance().is_none());

        cursor.reset();
        assert_eq!(cursor.advance().unwrap().vaddr, page_size());
    }

    #[test]
    fn test_cursor_seek_hit_and_miss() {
        let ps = page_size();
        let mut cursor = PagemapCursor::new(entries());

        // Second page of the first record
        let pe = cursor.seek_pagemap(2 * ps).unwrap();
        assert_eq!(pe.vaddr, ps);

        // The gap between the records has no coverage
        assert!(cursor.seek_pagemap(5 * ps).is_none());
        assert!(cursor.seek_pagemap(0).is_none());
        assert!(cursor.seek_pagemap(9 * ps).is_none());
    }

    #[test]
    fn test_cursor_skip_tracks_read_position() {
        let ps = page_size();
        let mut cursor = PagemapCursor::new(entries());

        cursor.seek_pagemap(2 * ps).unwrap();
        cursor.skip_pages(ps);
        let (idx, pe) = cursor.record_for(2 * ps, 1).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(pe.vaddr, ps);
    }

    #[test]
    fn test_record_for_rejects_out_of_range_reads() {
        let ps = page_size();
        let mut cursor = PagemapCursor::new(entries());

        // No current record yet
        assert!(cursor.record_for(ps, 1).is_err());

        cursor.seek_pagemap(ps).unwrap();
        // Two pages fit, three spill past the record
        assert!(cursor.record_for(ps, 2).is_ok());
        assert!(cursor.record_for(ps, 3).is_err());
    }

    #[test]
    fn test_seek_resets_skip() {
        let ps = page_size();
        let mut cursor = PagemapCursor::new(entries());

        cursor.seek_pagemap(ps).unwrap();
        cursor.skip_pages(ps);
        cursor.seek_pagemap(8 * ps).unwrap();
        assert_eq!(cursor.current().unwrap().vaddr, 8 * ps);
        // record_for validates skip against the requested address
        assert!(cursor.record_for(8 * ps, 1).is_ok());
    }
}

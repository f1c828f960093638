//! Checkpoint image files consumed by the lazy-pages server
//!
//! Every image is a 4-byte little-endian magic followed by a bincode
//! payload. Page contents live in a separate raw file so they can be
//! read with plain offset arithmetic.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Host page size, read once via sysconf
pub fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    // SAFETY: sysconf(_SC_PAGESIZE) has no failure mode on Linux
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64)
}

// Image magics
pub const INVENTORY_MAGIC: u32 = 0x4c50_0001;
pub const MM_MAGIC: u32 = 0x4c50_0002;
pub const PAGEMAP_MAGIC: u32 = 0x4c50_0003;

// Pagemap entry flags
pub const PE_LAZY: u32 = 0x1;
pub const PE_ZERO: u32 = 0x2;

/// Restore-wide task list; its length is the number of handoff frames
/// the server expects on the rendezvous socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryImage {
    pub tasks: Vec<i32>,
}

/// One VMA of the checkpointed address space, `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmaEntry {
    pub start: u64,
    pub end: u64,
}

/// One pagemap record: `nr_pages` pages starting at `vaddr`.
/// A record carries stored content in the pages file iff it is not zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagemapEntry {
    pub vaddr: u64,
    pub nr_pages: u32,
    pub flags: u32,
}

impl PagemapEntry {
    /// Content is delivered on demand rather than at restore time
    pub fn is_lazy(&self) -> bool {
        self.flags & PE_LAZY != 0
    }

    /// Pages are all-zero and have no stored content
    pub fn is_zero(&self) -> bool {
        self.flags & PE_ZERO != 0
    }

    pub fn len(&self) -> u64 {
        self.nr_pages as u64 * page_size()
    }

    pub fn is_empty(&self) -> bool {
        self.nr_pages == 0
    }

    pub fn end(&self) -> u64 {
        self.vaddr + self.len()
    }

    pub fn covers(&self, addr: u64) -> bool {
        addr >= self.vaddr && addr < self.end()
    }
}

/// VMA list of one task, sorted by start address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmImage {
    pub vmas: Vec<VmaEntry>,
}

/// Pagemap of one task, sorted by vaddr
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagemapImage {
    pub entries: Vec<PagemapEntry>,
}

pub fn inventory_path(dir: &Path) -> PathBuf {
    dir.join("inventory.img")
}

pub fn mm_path(dir: &Path, pid: i32) -> PathBuf {
    dir.join(format!("mm-{}.img", pid))
}

pub fn pagemap_path(dir: &Path, pid: i32) -> PathBuf {
    dir.join(format!("pagemap-{}.img", pid))
}

pub fn pages_path(dir: &Path, pid: i32) -> PathBuf {
    dir.join(format!("pages-{}.img", pid))
}

fn load_image<T: for<'de> Deserialize<'de>>(path: &Path, magic: u32) -> Result<T> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open image {}", path.display()))?;

    let mut magic_buf = [0u8; 4];
    file.read_exact(&mut magic_buf)
        .with_context(|| format!("Short image {}", path.display()))?;
    if u32::from_le_bytes(magic_buf) != magic {
        bail!("Bad magic in {}", path.display());
    }

    let mut payload = Vec::new();
    file.read_to_end(&mut payload)?;
    bincode::deserialize(&payload).with_context(|| format!("Corrupt image {}", path.display()))
}

fn save_image<T: Serialize>(path: &Path, magic: u32, value: &T) -> Result<()> {
    let payload = bincode::serialize(value)?;
    let mut file =
        File::create(path).with_context(|| format!("Failed to create image {}", path.display()))?;
    file.write_all(&magic.to_le_bytes())?;
    file.write_all(&payload)?;
    Ok(())
}

impl InventoryImage {
    pub fn load(dir: &Path) -> Result<Self> {
        load_image(&inventory_path(dir), INVENTORY_MAGIC)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        save_image(&inventory_path(dir), INVENTORY_MAGIC, self)
    }
}

impl MmImage {
    pub fn load(dir: &Path, pid: i32) -> Result<Self> {
        let mm: Self = load_image(&mm_path(dir, pid), MM_MAGIC)?;
        eprintln!("[images] Found {} VMAs in image", mm.vmas.len());
        Ok(mm)
    }

    pub fn save(&self, dir: &Path, pid: i32) -> Result<()> {
        save_image(&mm_path(dir, pid), MM_MAGIC, self)
    }
}

impl PagemapImage {
    pub fn load(dir: &Path, pid: i32) -> Result<Self> {
        load_image(&pagemap_path(dir, pid), PAGEMAP_MAGIC)
    }

    pub fn save(&self, dir: &Path, pid: i32) -> Result<()> {
        save_image(&pagemap_path(dir, pid), PAGEMAP_MAGIC, self)
    }
}

/// Write the raw page contents for one task, concatenated in pagemap
/// order for records with content. Always creates the file, even empty.
pub fn write_pages(dir: &Path, pid: i32, data: &[u8]) -> Result<()> {
    let path = pages_path(dir, pid);
    fs::write(&path, data).with_context(|| format!("Failed to write {}", path.display()))
}

pub fn open_pages(dir: &Path, pid: i32) -> Result<File> {
    let path = pages_path(dir, pid);
    File::open(&path).with_context(|| format!("Failed to open {}", path.display()))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_a_power_of_two() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert_eq!(ps & (ps - 1), 0);
    }

    #[test]
    fn test_pagemap_entry_flags() {
        let pe = PagemapEntry {
            vaddr: 0x1000,
            nr_pages: 2,
            flags: PE_LAZY,
        };
        assert!(pe.is_lazy());
        assert!(!pe.is_zero());

        let zero = PagemapEntry {
            vaddr: 0x4000,
            nr_pages: 1,
            flags: PE_LAZY | PE_ZERO,
        };
        assert!(zero.is_lazy());
        assert!(zero.is_zero());
    }

    #[test]
    fn test_pagemap_entry_geometry() {
        let ps = page_size();
        let pe = PagemapEntry {
            vaddr: 2 * ps,
            nr_pages: 3,
            flags: PE_LAZY,
        };
        assert_eq!(pe.len(), 3 * ps);
        assert_eq!(pe.end(), 5 * ps);
        assert!(pe.covers(2 * ps));
        assert!(pe.covers(5 * ps - 1));
        assert!(!pe.covers(5 * ps));
        assert!(!pe.covers(2 * ps - 1));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = InventoryImage { tasks: vec![1] };
        inventory.save(dir.path()).unwrap();

        // An inventory payload is not a valid mm image
        let err = load_image::<MmImage>(&inventory_path(dir.path()), MM_MAGIC);
        assert!(err.is_err());
    }
}

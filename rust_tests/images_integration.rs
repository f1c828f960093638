//! Image round-trip and local page reader behavior
//!
//! These tests build a small checkpoint image in a tempdir and verify
//! that the local reader classifies and serves pages the way the fault
//! path expects.

use lazy_pages::images::{
    page_size, InventoryImage, MmImage, PagemapEntry, PagemapImage, VmaEntry, PE_LAZY, PE_ZERO,
};
use lazy_pages::pageread::{LocalPageReader, PageRead};
use std::path::Path;
use tempfile::TempDir;

fn page(byte: u8) -> Vec<u8> {
    vec![byte; page_size() as usize]
}

/// A task with a zero record wedged between two content records:
///   [ps, 1 page]     content 0xA1
///   [2*ps, 2 pages]  zero
///   [4*ps, 1 page]   content 0xB2
fn write_task_images(dir: &Path, pid: i32) {
    let ps = page_size();

    MmImage {
        vmas: vec![VmaEntry {
            start: ps,
            end: 5 * ps,
        }],
    }
    .save(dir, pid)
    .unwrap();

    PagemapImage {
        entries: vec![
            PagemapEntry {
                vaddr: ps,
                nr_pages: 1,
                flags: PE_LAZY,
            },
            PagemapEntry {
                vaddr: 2 * ps,
                nr_pages: 2,
                flags: PE_LAZY | PE_ZERO,
            },
            PagemapEntry {
                vaddr: 4 * ps,
                nr_pages: 1,
                flags: PE_LAZY,
            },
        ],
    }
    .save(dir, pid)
    .unwrap();

    let mut pages = page(0xA1);
    pages.extend(page(0xB2));
    lazy_pages::images::write_pages(dir, pid, &pages).unwrap();
}

#[test]
fn test_inventory_round_trip() {
    let dir = TempDir::new().unwrap();

    let inventory = InventoryImage {
        tasks: vec![100, 101, 4242],
    };
    inventory.save(dir.path()).unwrap();

    let loaded = InventoryImage::load(dir.path()).unwrap();
    assert_eq!(loaded.tasks, vec![100, 101, 4242]);
}

#[test]
fn test_missing_inventory_fails() {
    let dir = TempDir::new().unwrap();
    assert!(InventoryImage::load(dir.path()).is_err());
}

#[test]
fn test_local_reader_iterates_records() {
    let dir = TempDir::new().unwrap();
    write_task_images(dir.path(), 100);

    let mut pr = LocalPageReader::open(dir.path(), 100).unwrap();

    let first = pr.advance().unwrap();
    assert_eq!(first.vaddr, page_size());
    assert!(pr.advance().is_some());
    assert!(pr.advance().is_some());
    assert!(pr.advance().is_none());

    pr.reset();
    assert_eq!(pr.advance().unwrap().vaddr, page_size());
}

#[test]
fn test_seek_miss_means_fresh_anonymous_page() {
    let dir = TempDir::new().unwrap();
    write_task_images(dir.path(), 100);

    let mut pr = LocalPageReader::open(dir.path(), 100).unwrap();

    // Below, above and before the mapped records
    assert!(pr.seek_pagemap(0).is_none());
    assert!(pr.seek_pagemap(8 * page_size()).is_none());
}

#[test]
fn test_zero_record_classification() {
    let ps = page_size();
    let dir = TempDir::new().unwrap();
    write_task_images(dir.path(), 100);

    let mut pr = LocalPageReader::open(dir.path(), 100).unwrap();

    let pe = pr.seek_pagemap(2 * ps).unwrap();
    assert!(pe.is_zero());

    // Second page of the same zero record
    let pe = pr.seek_pagemap(3 * ps).unwrap();
    assert!(pe.is_zero());
    assert_eq!(pe.vaddr, 2 * ps);
}

#[test]
fn test_read_skips_zero_records_in_the_pages_file() {
    let ps = page_size();
    let dir = TempDir::new().unwrap();
    write_task_images(dir.path(), 100);

    let mut pr = LocalPageReader::open(dir.path(), 100).unwrap();
    let mut buf = vec![0u8; ps as usize];

    // First content record
    let pe = pr.seek_pagemap(ps).unwrap();
    pr.skip_pages(ps - pe.vaddr);
    pr.read_pages(ps, 1, &mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0xA1));

    // The record after the zero gap starts right where the first one
    // ended in the pages file
    let pe = pr.seek_pagemap(4 * ps).unwrap();
    pr.skip_pages(4 * ps - pe.vaddr);
    pr.read_pages(4 * ps, 1, &mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0xB2));
}

#[test]
fn test_read_mid_record() {
    let ps = page_size();
    let dir = TempDir::new().unwrap();

    MmImage {
        vmas: vec![VmaEntry {
            start: ps,
            end: 3 * ps,
        }],
    }
    .save(dir.path(), 200)
    .unwrap();
    PagemapImage {
        entries: vec![PagemapEntry {
            vaddr: ps,
            nr_pages: 2,
            flags: PE_LAZY,
        }],
    }
    .save(dir.path(), 200)
    .unwrap();
    let mut pages = page(0x11);
    pages.extend(page(0x22));
    lazy_pages::images::write_pages(dir.path(), 200, &pages).unwrap();

    let mut pr = LocalPageReader::open(dir.path(), 200).unwrap();
    let mut buf = vec![0u8; ps as usize];

    let pe = pr.seek_pagemap(2 * ps).unwrap();
    assert_eq!(pe.vaddr, ps);
    pr.skip_pages(2 * ps - pe.vaddr);
    pr.read_pages(2 * ps, 1, &mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0x22));
}

#[test]
fn test_read_beyond_record_is_rejected() {
    let ps = page_size();
    let dir = TempDir::new().unwrap();
    write_task_images(dir.path(), 100);

    let mut pr = LocalPageReader::open(dir.path(), 100).unwrap();
    let mut buf = vec![0u8; 2 * ps as usize];

    pr.seek_pagemap(ps).unwrap();
    assert!(pr.read_pages(ps, 2, &mut buf, 0).is_err());
}

#[test]
fn test_reader_requires_the_pages_image() {
    let ps = page_size();
    let dir = TempDir::new().unwrap();

    PagemapImage {
        entries: vec![PagemapEntry {
            vaddr: ps,
            nr_pages: 1,
            flags: PE_LAZY,
        }],
    }
    .save(dir.path(), 300)
    .unwrap();

    assert!(LocalPageReader::open(dir.path(), 300).is_err());
}

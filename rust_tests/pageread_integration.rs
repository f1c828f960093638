//! Remote page reader against an in-process page server
//!
//! The pagemap lookup stays local; only page content crosses the wire.
//! A thread plays the page server and answers content requests with a
//! per-page fill pattern derived from the requested address.

use lazy_pages::images::{page_size, PagemapEntry, PagemapImage, PE_LAZY};
use lazy_pages::pageread::{PageRead, PageRequest, RemotePageReader, RF_ASAP, RF_ASYNC};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use tempfile::TempDir;

fn fill_for(vaddr: u64) -> u8 {
    (vaddr / page_size()) as u8
}

/// Accept one reader and serve content requests until it hangs up
fn spawn_page_server(listener: TcpListener) -> thread::JoinHandle<usize> {
    thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut served = 0;

        loop {
            let mut len_buf = [0u8; 4];
            if sock.read_exact(&mut len_buf).is_err() {
                break; // reader hung up
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            sock.read_exact(&mut payload).unwrap();
            let req: PageRequest = bincode::deserialize(&payload).unwrap();

            let ps = page_size();
            let mut reply = Vec::with_capacity((req.nr_pages as u64 * ps) as usize);
            for k in 0..req.nr_pages as u64 {
                reply.extend(vec![fill_for(req.vaddr + k * ps); ps as usize]);
            }
            sock.write_all(&reply).unwrap();
            served += 1;
        }
        served
    })
}

fn write_pagemap(dir: &TempDir, pid: i32) {
    let ps = page_size();
    PagemapImage {
        entries: vec![
            PagemapEntry {
                vaddr: ps,
                nr_pages: 2,
                flags: PE_LAZY,
            },
            PagemapEntry {
                vaddr: 16 * ps,
                nr_pages: 1,
                flags: PE_LAZY,
            },
        ],
    }
    .save(dir.path(), pid)
    .unwrap();
}

#[test]
fn test_remote_reader_fetches_content() {
    let ps = page_size();
    let dir = TempDir::new().unwrap();
    write_pagemap(&dir, 7);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = spawn_page_server(listener);

    {
        let mut pr = RemotePageReader::connect(dir.path(), 7, &addr).unwrap();
        let mut buf = vec![0u8; 2 * ps as usize];

        // Both pages of the first record in one request
        let pe = pr.seek_pagemap(ps).unwrap();
        pr.skip_pages(ps - pe.vaddr);
        assert_eq!(pr.read_pages(ps, 2, &mut buf, RF_ASYNC | RF_ASAP).unwrap(), 2);
        assert!(buf[..ps as usize].iter().all(|&b| b == fill_for(ps)));
        assert!(buf[ps as usize..].iter().all(|&b| b == fill_for(2 * ps)));

        // Seek elsewhere, ask again
        let pe = pr.seek_pagemap(16 * ps).unwrap();
        pr.skip_pages(16 * ps - pe.vaddr);
        assert_eq!(pr.read_pages(16 * ps, 1, &mut buf[..ps as usize], 0).unwrap(), 1);
        assert!(buf[..ps as usize].iter().all(|&b| b == fill_for(16 * ps)));
    }

    assert_eq!(server.join().unwrap(), 2);
}

#[test]
fn test_remote_reader_validates_before_asking_the_server() {
    let ps = page_size();
    let dir = TempDir::new().unwrap();
    write_pagemap(&dir, 7);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = spawn_page_server(listener);

    {
        let mut pr = RemotePageReader::connect(dir.path(), 7, &addr).unwrap();
        let mut buf = vec![0u8; 4 * ps as usize];

        // The gap between records has no coverage
        assert!(pr.seek_pagemap(8 * ps).is_none());

        // A read spilling past the current record never hits the wire
        pr.seek_pagemap(ps).unwrap();
        assert!(pr.read_pages(ps, 3, &mut buf, 0).is_err());
    }

    // The server saw no requests at all
    assert_eq!(server.join().unwrap(), 0);
}

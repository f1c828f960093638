//! Handoff frame transfer over a socketpair
//!
//! The restorer side of the crate sends `{pid, fd}` frames; these tests
//! decode them with the server-side helpers and check the frames stay
//! whole when several senders share the socket.

use lazy_pages::handoff::{recv_uffd, send_uffd, TaskHandoff};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::thread;

#[test]
fn test_live_task_frame_carries_fd() {
    let (tx, mut rx) = UnixStream::pair().unwrap();

    let mut marker = tempfile::tempfile().unwrap();
    marker.write_all(b"uffd stand-in").unwrap();

    let sender = thread::spawn(move || {
        send_uffd(&tx, 100, Some(marker.as_raw_fd())).unwrap();
        // Keep the fd alive until the frame is on the wire
        marker
    });

    let frame = recv_uffd(&mut rx).unwrap();
    let TaskHandoff::Task { pid, uffd } = frame else {
        panic!("expected a live task frame");
    };
    assert_eq!(pid, 100);

    // The received descriptor refers to the sender's open file
    let mut received = File::from(uffd);
    received.seek(SeekFrom::Start(0)).unwrap();
    let mut contents = String::new();
    received.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "uffd stand-in");

    sender.join().unwrap();
}

#[test]
fn test_zombie_frame_has_no_fd() {
    let (tx, mut rx) = UnixStream::pair().unwrap();

    let mut marker = tempfile::tempfile().unwrap();
    marker.write_all(b"x").unwrap();

    let sender = thread::spawn(move || {
        send_uffd(&tx, -42, None).unwrap();
        // The stream must stay aligned for the next frame
        send_uffd(&tx, 43, Some(marker.as_raw_fd())).unwrap();
        marker
    });

    match recv_uffd(&mut rx).unwrap() {
        TaskHandoff::Zombie { pid } => assert_eq!(pid, -42),
        other => panic!("expected a zombie frame, got {:?}", other),
    }
    match recv_uffd(&mut rx).unwrap() {
        TaskHandoff::Task { pid, .. } => assert_eq!(pid, 43),
        other => panic!("expected a live frame, got {:?}", other),
    }

    sender.join().unwrap();
}

#[test]
fn test_concurrent_senders_do_not_interleave_frames() {
    const SENDERS: i32 = 4;
    const FRAMES: i32 = 8;

    let (tx, mut rx) = UnixStream::pair().unwrap();

    let mut senders = Vec::new();
    for t in 0..SENDERS {
        let sock = tx.try_clone().unwrap();
        senders.push(thread::spawn(move || {
            let mut marker = tempfile::tempfile().unwrap();
            marker.write_all(&[t as u8]).unwrap();

            for i in 0..FRAMES {
                let pid = t * 1000 + i + 1;
                if i % 4 == 3 {
                    // A zombie in the mix must not desync the stream
                    send_uffd(&sock, -pid, None).unwrap();
                } else {
                    send_uffd(&sock, pid, Some(marker.as_raw_fd())).unwrap();
                }
            }
        }));
    }
    drop(tx);

    // Every frame must decode whole: a pid from the expected set, with a
    // descriptor exactly when the pid is non-negative
    let mut seen: HashMap<i32, i32> = HashMap::new();
    for _ in 0..SENDERS * FRAMES {
        let (pid, had_fd) = match recv_uffd(&mut rx).unwrap() {
            TaskHandoff::Task { pid, uffd } => {
                drop(uffd);
                (pid, true)
            }
            TaskHandoff::Zombie { pid } => (-pid, false),
        };

        let t = (pid - 1) / 1000;
        let i = (pid - 1) % 1000;
        assert!((0..SENDERS).contains(&t), "pid {} from nowhere", pid);
        assert!((0..FRAMES).contains(&i), "pid {} from nowhere", pid);
        assert_eq!(had_fd, i % 4 != 3);

        // Frames from one sender arrive in the order it sent them
        let last = seen.entry(t).or_insert(-1);
        assert!(i > *last, "sender {} frames reordered", t);
        *last = i;
    }

    for sender in senders {
        sender.join().unwrap();
    }
    assert!(seen.values().all(|&last| last == FRAMES - 1));
}

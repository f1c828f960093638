//! Per-task lazy restore state and page installation
//!
//! A `LazyTask` exists for every live restored task whose descriptor
//! arrived on the handoff socket. It owns the descriptor, the page
//! source and the undelivered interval set, and it performs the copy /
//! zero-fill installs for both the fault-driven phase and the drain.

use crate::images::{page_size, MmImage};
use crate::intervals::LazyIntervals;
use crate::pageread::{PageRead, RF_ASAP, RF_ASYNC};
use anyhow::{bail, ensure, Context, Result};
use nix_uffd::errno::Errno;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use userfaultfd::{Error as UffdError, Event, Uffd};

/// Outcome of servicing one readable userfault descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    /// A fault was handled, or nothing was pending
    Handled,
    /// The restored task exited; the descriptor reached end-of-stream
    Exited,
}

pub struct LazyTask {
    pid: i32,
    uffd: Uffd,
    pr: Box<dyn PageRead>,
    iovs: LazyIntervals,
    /// Scratch buffer sized to the longest interval; source of every
    /// UFFDIO_COPY
    buf: Vec<u8>,
    total_pages: u64,
    copied_pages: u64,
    draining: bool,
}

impl LazyTask {
    /// Bind a received descriptor to its image-backed state
    pub fn new(pid: i32, uffd: OwnedFd, mut pr: Box<dyn PageRead>, mm: &MmImage) -> Result<Self> {
        let (iovs, total_pages) = LazyIntervals::collect(pr.as_mut(), &mm.vmas);
        eprintln!(
            "[server] {}: found {} pages to be handled by userfault",
            pid, total_pages
        );

        let buf = vec![0u8; iovs.max_len() as usize];
        // SAFETY: the restorer completed the API handshake on this
        // descriptor before shipping it; we take exclusive ownership
        let uffd = unsafe { Uffd::from_raw_fd(uffd.into_raw_fd()) };

        Ok(Self {
            pid,
            uffd,
            pr,
            iovs,
            buf,
            total_pages,
            copied_pages: 0,
            draining: false,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn raw_fd(&self) -> RawFd {
        self.uffd.as_raw_fd()
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    pub fn copied_pages(&self) -> u64 {
        self.copied_pages
    }

    pub fn intervals(&self) -> &LazyIntervals {
        &self.iovs
    }

    /// Service one message from the userfault descriptor
    pub fn handle_user_fault(&mut self) -> Result<FaultStatus> {
        let event = match self.uffd.read_event() {
            Ok(Some(event)) => event,
            // Nothing pending on the non-blocking descriptor
            Ok(None) => return Ok(FaultStatus::Handled),
            // The task exited, possibly with faults still pending
            Err(UffdError::ReadEof) => return Ok(FaultStatus::Exited),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("{}: can't read userfaultfd message", self.pid))
            }
        };

        // Only pagefault events are valid on a lazy-restore descriptor
        let addr = match event {
            Event::Pagefault { addr, .. } => addr.addr() as u64,
            other => bail!("{}: unexpected userfault event {:?}", self.pid, other),
        };

        let addr = addr & !(page_size() - 1);
        eprintln!("[server] {}: #PF at {:#x}", self.pid, addr);

        self.handle_pages(addr, 1, RF_ASYNC | RF_ASAP)
            .with_context(|| format!("{}: error during page fault service", self.pid))?;
        Ok(FaultStatus::Handled)
    }

    /// Common delivery entry for the fault loop and the drain walk:
    /// classify the address, fetch content if any, install, account
    pub fn handle_pages(&mut self, addr: u64, nr: usize, flags: u32) -> Result<()> {
        self.pr.reset();

        // An address missing from the pagemap is a freshly-demanded
        // anonymous page; zero records carry no stored content either way
        let pe = match self.pr.seek_pagemap(addr) {
            None => return self.zero_pages(addr, nr),
            Some(pe) if pe.is_zero() => return self.zero_pages(addr, nr),
            Some(pe) => pe,
        };

        self.pr.skip_pages(addr - pe.vaddr);

        let len = (nr as u64 * page_size()) as usize;
        ensure!(
            len <= self.buf.len(),
            "{}: delivery of {:#x}/{} overruns the scratch buffer",
            self.pid,
            addr,
            nr
        );
        let read = self
            .pr
            .read_pages(addr, nr, &mut self.buf[..len], flags)
            .with_context(|| format!("{}: failed reading pages at {:#x}", self.pid, addr))?;
        ensure!(
            read == nr,
            "{}: short page read at {:#x}: {}/{}",
            self.pid,
            addr,
            read,
            nr
        );

        // Both backends complete synchronously, so install right away
        self.complete_page_fault(addr, nr)
    }

    fn complete_page_fault(&mut self, addr: u64, nr: usize) -> Result<()> {
        self.uffd_copy(addr, nr)?;
        self.deliver(addr, nr);
        Ok(())
    }

    fn zero_pages(&mut self, addr: u64, nr: usize) -> Result<()> {
        self.uffd_zero(addr, nr)?;
        self.copied_pages += nr as u64;
        self.deliver(addr, nr);
        Ok(())
    }

    /// The drain walk holds stable positions in the interval list, so
    /// bookkeeping is suspended while draining
    fn deliver(&mut self, addr: u64, nr: usize) {
        if !self.draining {
            self.iovs.deliver(addr, nr as u64 * page_size());
        }
    }

    fn uffd_copy(&mut self, addr: u64, nr: usize) -> Result<()> {
        let len = (nr as u64 * page_size()) as usize;
        eprintln!("[server] {}: uffd copy {:#x}/{}", self.pid, addr, len);

        // SAFETY: buf holds at least len bytes of source content; the
        // kernel validates the destination against the registered ranges
        let res = unsafe {
            self.uffd.copy(
                self.buf.as_ptr() as *const libc::c_void,
                addr as *mut libc::c_void,
                len,
                true,
            )
        };
        match res {
            Ok(copied) if copied == len => {}
            Ok(copied) => bail!(
                "{}: UFFDIO_COPY unexpected size {}/{}",
                self.pid,
                copied,
                len
            ),
            // Another fault raced us and the page is already in place
            Err(UffdError::CopyFailed(Errno::EEXIST)) => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("{}: UFFDIO_COPY failed at {:#x}", self.pid, addr))
            }
        }

        // Submissions are counted, including ones that lost the race
        self.copied_pages += nr as u64;
        Ok(())
    }

    fn uffd_zero(&mut self, addr: u64, nr: usize) -> Result<()> {
        let len = (nr as u64 * page_size()) as usize;
        eprintln!("[server] {}: zero page at {:#x}", self.pid, addr);

        // SAFETY: the kernel validates the range against the registered
        // ranges; no source buffer is involved
        unsafe { self.uffd.zeropage(addr as *mut libc::c_void, len, true) }
            .with_context(|| format!("{}: UFFDIO_ZEROPAGE failed at {:#x}", self.pid, addr))?;
        Ok(())
    }

    /// Drain: proactively deliver every interval still outstanding,
    /// head to tail, without waiting for faults
    pub fn handle_remaining(&mut self) -> Result<()> {
        self.draining = true;
        self.pr.reset();

        for i in 0..self.iovs.len() {
            let Some(iov) = self.iovs.get(i) else { break };
            let nr = (iov.len / page_size()) as usize;
            self.handle_pages(iov.base, nr, 0)
                .with_context(|| format!("{}: error during remaining page copy", self.pid))?;
        }
        Ok(())
    }

    /// Per-task completion report; true when pages went undelivered
    pub fn summary(&self) -> bool {
        eprintln!(
            "[server] {}: with userfault transferred pages: ({}/{})",
            self.pid, self.copied_pages, self.total_pages
        );

        if self.copied_pages != self.total_pages && self.total_pages > 0 {
            eprintln!(
                "[server] {}: WARN: only {} of {} pages transferred",
                self.pid, self.copied_pages, self.total_pages
            );
            eprintln!("[server] Something probably went wrong.");
            return true;
        }
        false
    }
}

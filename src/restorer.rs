//! Restorer-side userfault setup
//!
//! One restorer runs per restored task. The restore driver connects the
//! handoff socket once and shares it across forked restorers; each call
//! here sends a single frame under the cross-restorer lock.

use crate::handoff;
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use userfaultfd::{Uffd, UffdBuilder};

/// Runtime detection that this kernel can service userfault descriptors
pub fn check_for_uffd() -> Result<()> {
    // A bare failure is probably enough to rule out lazy restore;
    // checking for ENOSYS makes sure it is actually not implemented
    let fd = unsafe { libc::syscall(libc::SYS_userfaultfd, 0) };
    if fd == -1 && Errno::last() == Errno::ENOSYS {
        eprintln!("[restorer] Runtime detection of userfaultfd failed on this system.");
        eprintln!("[restorer] Processes cannot be lazy-restored on this system.");
        bail!("userfaultfd is not implemented by this kernel");
    }
    if fd >= 0 {
        // SAFETY: closing the probe descriptor we just opened
        unsafe { libc::close(fd as i32) };
    }
    Ok(())
}

/// Open a userfault descriptor for one restored task and ship it to the
/// page server. The returned descriptor stays with the restorer blob,
/// which arms the lazy ranges with UFFDIO_REGISTER before jumping into
/// the task; the page server only consumes fault events and installs
/// pages.
pub fn setup_uffd(sock: &UnixStream, pid: i32) -> Result<Uffd> {
    check_for_uffd()?;

    // The builder issues the UFFDIO_API handshake with zero requested
    // features and fails when the kernel disagrees on the version
    let uffd = UffdBuilder::new()
        .close_on_exec(true)
        .non_blocking(true)
        .create()
        .context("Unable to open an userfaultfd descriptor")?;

    handoff::send_uffd(sock, pid, Some(uffd.as_raw_fd()))?;
    Ok(uffd)
}

/// Zombies have no memory to restore; announce them so the server's
/// frame count still adds up
pub fn setup_zombie(sock: &UnixStream, pid: i32) -> Result<()> {
    handoff::send_uffd(sock, -pid, None)
}

//! Unix-socket rendezvous and `{pid, fd}` handoff
//!
//! The restorer side ships every task's userfault descriptor to the page
//! server over one shared stream connection. The transfer protocol is
//! first the pid as a native-endian int and then the descriptor via
//! SCM_RIGHTS; a zombie is announced with a negated pid and carries no
//! descriptor. Restorer processes do not share a heap, so frame
//! atomicity on the shared socket is enforced with a file lock next to
//! the socket.

use anyhow::{anyhow, bail, Context, Result};
use nix::fcntl::{Flock, FlockArg};
use nix::sys::socket::{
    accept, bind, listen, send, sendmsg, socket, AddressFamily, Backlog, ControlMessage, MsgFlags,
    SockFlag, SockType, UnixAddr,
};
use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Fixed rendezvous name, resolved in the working directory of both
/// endpoints
pub const LAZY_PAGES_SOCK_NAME: &str = "lazy-pages.socket";

/// Lock file serializing restorer frames on the shared socket
pub const LAZY_PAGES_LOCK_NAME: &str = "lazy-pages.lock";

/// One task frame as decoded by the server
#[derive(Debug)]
pub enum TaskHandoff {
    /// Restored task: pid plus its userfault descriptor
    Task { pid: i32, uffd: OwnedFd },
    /// Zombie, announced with a negated pid; no task state is created
    Zombie { pid: i32 },
}

/// Bind and listen on the rendezvous socket, removing any stale file
/// left by a previous run
pub fn server_listen() -> Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("Failed to create handoff socket")?;

    let _ = std::fs::remove_file(LAZY_PAGES_SOCK_NAME);
    let addr = UnixAddr::new(LAZY_PAGES_SOCK_NAME)?;
    bind(fd.as_raw_fd(), &addr)
        .with_context(|| format!("Failed to bind {}", LAZY_PAGES_SOCK_NAME))?;
    listen(&fd, Backlog::new(10)?).context("Handoff listen failed")?;

    Ok(fd)
}

/// Accept the single client connection carrying all task frames
pub fn server_accept(listener: &OwnedFd) -> Result<UnixStream> {
    let client = accept(listener.as_raw_fd()).context("Handoff accept failed")?;
    // SAFETY: accept returned a fresh descriptor we now own
    Ok(unsafe { UnixStream::from_raw_fd(client) })
}

/// Connect the restorer side to the page server
pub fn connect() -> Result<UnixStream> {
    UnixStream::connect(LAZY_PAGES_SOCK_NAME)
        .with_context(|| format!("connect to {} failed", LAZY_PAGES_SOCK_NAME))
}

fn lock_handoff() -> Result<Flock<File>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(LAZY_PAGES_LOCK_NAME)
        .with_context(|| format!("Failed to open {}", LAZY_PAGES_LOCK_NAME))?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| anyhow!("Failed to lock {}: {}", LAZY_PAGES_LOCK_NAME, errno))
}

/// Send one task frame. The two-step frame is protected by the handoff
/// lock so concurrent restorers never interleave on the shared socket.
pub fn send_uffd(sock: &UnixStream, pid: i32, uffd: Option<RawFd>) -> Result<()> {
    let _lock = lock_handoff()?;

    eprintln!("[handoff] Sending pid {}", pid);
    send(sock.as_raw_fd(), &pid.to_ne_bytes(), MsgFlags::empty()).context("pid send error")?;

    // Zombies carry no descriptor
    if pid < 0 {
        return Ok(());
    }

    let fd = uffd.ok_or_else(|| anyhow!("Missing userfault descriptor for pid {}", pid))?;

    // Stream sockets only deliver ancillary data alongside in-band
    // bytes, so the descriptor rides on a single carrier byte
    let carrier = [0u8; 1];
    let iov = [IoSlice::new(&carrier)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .context("Failed to send userfault descriptor via SCM_RIGHTS")?;

    Ok(())
}

/// Receive one task frame: the pid, then (for live tasks) the descriptor
pub fn recv_uffd(sock: &mut UnixStream) -> Result<TaskHandoff> {
    let mut pid_buf = [0u8; 4];
    sock.read_exact(&mut pid_buf).context("pid recv error")?;
    let pid = i32::from_ne_bytes(pid_buf);

    if pid < 0 {
        eprintln!("[handoff] Zombie pid: {}", pid);
        return Ok(TaskHandoff::Zombie { pid });
    }

    let uffd = recv_fd(sock).with_context(|| format!("recv_fd error for pid {}", pid))?;
    eprintln!("[handoff] Received pid {}, uffd {}", pid, uffd.as_raw_fd());
    Ok(TaskHandoff::Task { pid, uffd })
}

/// Receive a file descriptor over a Unix socket using SCM_RIGHTS
fn recv_fd(sock: &UnixStream) -> Result<OwnedFd> {
    use std::mem::MaybeUninit;

    let mut carrier = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: carrier.as_mut_ptr() as *mut libc::c_void,
        iov_len: carrier.len(),
    };

    // Control message buffer sized for one file descriptor
    // SAFETY: CMSG_SPACE is a const-like macro that computes buffer size
    let mut cmsg_buf =
        [0u8; unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize];

    let mut msg: libc::msghdr = unsafe { MaybeUninit::zeroed().assume_init() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    // SAFETY: recvmsg is a safe syscall with properly initialized buffers
    let bytes_received = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if bytes_received < 0 {
        return Err(anyhow!(
            "recvmsg failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    if bytes_received == 0 {
        bail!("Handoff socket closed mid-frame");
    }

    // Extract the file descriptor from the control message
    let mut received_fd: Option<RawFd> = None;

    // SAFETY: Iterating over control messages in properly received buffer
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let fd_ptr = libc::CMSG_DATA(cmsg) as *const RawFd;
                received_fd = Some(*fd_ptr);
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let fd = received_fd.ok_or_else(|| anyhow!("No file descriptor in SCM_RIGHTS message"))?;

    // SAFETY: We just received this FD via recvmsg, we own it now
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

//! Single-threaded page-fault dispatch loop and drain phase
//!
//! The server accepts one client connection carrying every task's
//! handoff frame, registers the received descriptors with epoll and
//! services faults until the poll quiesces. A timed-out poll means
//! fault-driven traffic ceased; the remaining intervals are then
//! delivered proactively and per-task accounting decides the exit code.

use crate::config::Cli;
use crate::handoff::{self, TaskHandoff};
use crate::images::{InventoryImage, MmImage};
use crate::pageread::open_page_read;
use crate::restorer::check_for_uffd;
use crate::task::{FaultStatus, LazyTask};
use anyhow::{anyhow, Context, Result};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, setsid, ForkResult};
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Quiescence threshold: an idle poll of this length triggers the drain
const POLL_TIMEOUT_MS: u16 = 5000;

pub struct LazyPagesServer {
    epoll: Epoll,
    /// Creation order doubles as drain order; epoll tokens index here
    tasks: Vec<LazyTask>,
}

impl LazyPagesServer {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("epoll_create failed")?;
        Ok(Self {
            epoll,
            tasks: Vec::new(),
        })
    }

    /// Consume every task frame from the connected restorer and register
    /// each received descriptor with the poll set
    pub fn prepare_uffds(
        &mut self,
        client: &mut UnixStream,
        nr_tasks: usize,
        images_dir: &Path,
        page_server: Option<&str>,
    ) -> Result<()> {
        for _ in 0..nr_tasks {
            match handoff::recv_uffd(client)? {
                TaskHandoff::Zombie { .. } => continue,
                TaskHandoff::Task { pid, uffd } => {
                    let pr = open_page_read(images_dir, pid, page_server)?;
                    let mm = MmImage::load(images_dir, pid)?;
                    let task = LazyTask::new(pid, uffd, pr, &mm)?;

                    let token = self.tasks.len() as u64;
                    // SAFETY: the task owns its descriptor for the
                    // server's whole lifetime
                    let fd = unsafe { BorrowedFd::borrow_raw(task.raw_fd()) };
                    self.epoll
                        .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, token))
                        .context("epoll add failed")?;
                    self.tasks.push(task);
                }
            }
        }
        Ok(())
    }

    /// Fault-driven phase, then drain, then per-task summaries.
    /// Returns the number of tasks with undelivered pages.
    pub fn handle_requests(&mut self) -> Result<i32> {
        let mut events = vec![EpollEvent::empty(); self.tasks.len().max(1)];

        loop {
            let n = self
                .epoll
                .wait(&mut events, EpollTimeout::from(POLL_TIMEOUT_MS))
                .context("epoll_wait failed")?;
            if n == 0 {
                // Quiescent: the fault-driven phase is over
                break;
            }

            for event in &events[..n] {
                let idx = event.data() as usize;
                let task = self
                    .tasks
                    .get_mut(idx)
                    .ok_or_else(|| anyhow!("Stale epoll token {}", idx))?;

                if task.handle_user_fault()? == FaultStatus::Exited {
                    // The task is gone; stop polling its descriptor but
                    // keep its state for the drain accounting
                    let fd = task.raw_fd();
                    // SAFETY: still owned by the task state
                    self.epoll
                        .delete(unsafe { BorrowedFd::borrow_raw(fd) })
                        .context("epoll delete failed")?;
                }
            }
        }

        eprintln!("[server] switching from request to copy mode");
        for task in &mut self.tasks {
            task.handle_remaining()?;
        }

        let mut failed = 0;
        for task in &self.tasks {
            if task.summary() {
                failed += 1;
            }
        }
        Ok(failed)
    }
}

/// Fork into the background. Returns true in the parent, which records
/// the child pid; the child detaches into its own session and continues
/// as the server.
fn daemonize(pidfile: Option<&Path>) -> Result<bool> {
    // SAFETY: single-threaded at this point; the child only continues
    // the server loop
    match unsafe { fork() }.context("Can't run in the background")? {
        ForkResult::Parent { child } => {
            if let Some(path) = pidfile {
                if let Err(e) = std::fs::write(path, format!("{}\n", child)) {
                    let _ = kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, None);
                    return Err(e)
                        .with_context(|| format!("Can't write pidfile {}", path.display()));
                }
            }
            Ok(true)
        }
        ForkResult::Child => {
            setsid().context("setsid failed")?;
            Ok(false)
        }
    }
}

/// Entry point for the lazy-pages server, the restore-time peer of
/// `restore --lazy-pages`
pub fn cr_lazy_pages(opts: &Cli) -> Result<i32> {
    check_for_uffd()?;

    let inventory = InventoryImage::load(&opts.images_dir)?;
    eprintln!("[server] Expecting {} task frames", inventory.tasks.len());

    // The rendezvous socket must exist before daemonizing so a restorer
    // can connect as soon as the parent returns
    let listener = handoff::server_listen()?;
    eprintln!(
        "[server] Waiting for incoming connections on {}",
        handoff::LAZY_PAGES_SOCK_NAME
    );

    if opts.daemon && daemonize(opts.pidfile.as_deref())? {
        return Ok(0); // parent: daemon started
    }

    let mut client = handoff::server_accept(&listener)?;
    let mut server = LazyPagesServer::new()?;
    server.prepare_uffds(
        &mut client,
        inventory.tasks.len(),
        &opts.images_dir,
        opts.page_server.as_deref(),
    )?;
    drop(client);
    drop(listener);

    server.handle_requests()
}

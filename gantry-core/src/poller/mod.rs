//! Readiness notification.
//!
//! The poller owns the FD table and a kernel backend (epoll on Linux,
//! poll(2) elsewhere). The worker drives it in two phases per iteration:
//!
//! 1. A *speculative* pass: [`Poller::spec_batch`] hands back descriptors
//!    whose interest was just expressed; the worker attempts the I/O
//!    directly and reports `would_block` to demote them into the kernel
//!    set. Successful speculation costs zero syscalls.
//! 2. A *kernel* pass: [`Poller::wait`] flushes deferred registration
//!    updates, blocks up to the scheduler-computed timeout, and returns
//!    readiness events tagged with their owners.
//!
//! The speculative pass is bounded per iteration so kernel events cannot be
//! starved by a busy SPEC list.

use std::io;
use std::os::unix::io::RawFd;

use crate::fd::{FdDir, FdOwner, FdTable};

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
use epoll::KernelPoller;

#[cfg(all(unix, not(target_os = "linux")))]
mod poll;
#[cfg(all(unix, not(target_os = "linux")))]
use poll::KernelPoller;

/// Largest kernel sleep per iteration, milliseconds.
pub const MAX_DELAY_MS: u64 = 1000;
/// Speculative completions serviced per iteration before yielding to the
/// kernel pass.
pub const MIN_RETURN_EVENTS: usize = 25;

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct FdEvent {
    pub fd: RawFd,
    pub owner: FdOwner,
    pub readable: bool,
    pub writable: bool,
    /// Error condition reported by the kernel.
    pub error: bool,
    /// Peer hung up.
    pub hup: bool,
}

/// FD table plus kernel readiness backend.
pub struct Poller {
    fds: FdTable,
    kernel: KernelPoller,
    events: Vec<FdEvent>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            fds: FdTable::new(),
            kernel: KernelPoller::new()?,
            events: Vec::with_capacity(256),
        })
    }

    /// Recreate the kernel handle. Must be called in the child after
    /// `fork()` so readiness queues are not shared across processes.
    pub fn reopen(&mut self) -> io::Result<()> {
        self.kernel = KernelPoller::new()?;
        // Reinstall every direction currently in the kernel set.
        for (fd, want_read, want_write) in self.fds.kernel_installed() {
            self.kernel.update(fd, want_read, want_write, false, false)?;
        }
        Ok(())
    }

    #[inline]
    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    // ------------------------------------------------------------------
    // Interest Management (delegated to the table)
    // ------------------------------------------------------------------

    pub fn register(&mut self, fd: RawFd, owner: FdOwner) {
        self.fds.register(fd, owner);
    }

    pub fn set_owner(&mut self, fd: RawFd, owner: FdOwner) {
        self.fds.set_owner(fd, owner);
    }

    pub fn owner(&self, fd: RawFd) -> Option<FdOwner> {
        self.fds.owner(fd)
    }

    pub fn want(&mut self, fd: RawFd, dir: FdDir) {
        self.fds.want(fd, dir);
    }

    pub fn stop(&mut self, fd: RawFd, dir: FdDir) {
        self.fds.stop(fd, dir);
    }

    pub fn would_block(&mut self, fd: RawFd, dir: FdDir) {
        self.fds.would_block(fd, dir);
    }

    /// Deregister a descriptor (the caller closes it afterwards).
    pub fn remove(&mut self, fd: RawFd) {
        if self.fds.deregister(fd) {
            let _ = self.kernel.update(fd, false, false, true, true);
        }
    }

    // ------------------------------------------------------------------
    // Event Collection
    // ------------------------------------------------------------------

    /// Speculative entries to attempt this iteration, bounded and rotated.
    pub fn spec_batch(&mut self) -> Vec<(RawFd, FdDir, FdOwner)> {
        self.fds.spec_batch(MIN_RETURN_EVENTS)
    }

    /// True when descriptors are waiting in the speculative state.
    pub fn has_spec(&self) -> bool {
        self.fds.spec_len() != 0
    }

    /// Flush deferred kernel updates, block up to `timeout_ms`, and return
    /// readiness events. A non-empty SPEC list forces a zero timeout.
    pub fn wait(&mut self, timeout_ms: u64) -> io::Result<&[FdEvent]> {
        for (fd, want_read, want_write, was_read, was_write) in self.fds.drain_updates() {
            self.kernel
                .update(fd, want_read, want_write, was_read, was_write)?;
        }
        let timeout = if self.has_spec() {
            0
        } else {
            timeout_ms.min(MAX_DELAY_MS)
        };
        self.events.clear();
        self.kernel.wait(timeout, &mut self.events, &self.fds)?;
        Ok(&self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_spec_then_kernel_demotion() {
        let mut poller = Poller::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (fd, _) = net::tcp_connect(addr).unwrap();
        let (_srv, _) = listener.accept().unwrap();

        poller.register(fd, FdOwner::WakePipe);
        poller.want(fd, FdDir::Read);
        let batch = poller.spec_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0, fd);

        // Nothing to read yet: demote and poll with zero timeout.
        poller.would_block(fd, FdDir::Read);
        let events = poller.wait(0).unwrap();
        assert!(events.is_empty());
        poller.remove(fd);
        net::close_fd(fd);
    }

    #[test]
    fn test_kernel_reports_readable() {
        let mut poller = Poller::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (fd, _) = net::tcp_connect(addr).unwrap();
        let (mut srv, _) = listener.accept().unwrap();

        poller.register(fd, FdOwner::WakePipe);
        poller.want(fd, FdDir::Read);
        poller.would_block(fd, FdDir::Read);

        srv.write_all(b"hello").unwrap();
        srv.flush().unwrap();

        let mut seen = false;
        for _ in 0..50 {
            let events = poller.wait(100).unwrap();
            if events.iter().any(|e| e.fd == fd && e.readable) {
                seen = true;
                break;
            }
        }
        assert!(seen, "kernel poller never reported readability");
        poller.remove(fd);
        net::close_fd(fd);
    }

    #[test]
    fn test_wait_timeout_zero_with_spec_pending() {
        let mut poller = Poller::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let fd = client.as_raw_fd();

        poller.register(fd, FdOwner::WakePipe);
        poller.want(fd, FdDir::Write);
        assert!(poller.has_spec());
        let start = std::time::Instant::now();
        let _ = poller.wait(500).unwrap();
        // SPEC pending forces an immediate return.
        assert!(start.elapsed().as_millis() < 100);
        poller.remove(fd);
    }
}

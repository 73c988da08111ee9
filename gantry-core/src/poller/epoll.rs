//! epoll backend (Linux).
//!
//! Level-triggered: the engine re-arms interest explicitly each iteration,
//! so edge semantics would only add missed-wakeup hazards.

use std::io;
use std::os::unix::io::RawFd;

use crate::fd::FdTable;

use super::FdEvent;

const MAX_EVENTS: usize = 1024;

pub struct KernelPoller {
    epfd: RawFd,
}

impl KernelPoller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    /// Reconcile one descriptor's kernel registration with the wanted mask.
    pub fn update(
        &mut self,
        fd: RawFd,
        want_read: bool,
        want_write: bool,
        was_read: bool,
        was_write: bool,
    ) -> io::Result<()> {
        let was_installed = was_read || was_write;
        let want_installed = want_read || want_write;

        let op = match (was_installed, want_installed) {
            (false, true) => libc::EPOLL_CTL_ADD,
            (true, true) => libc::EPOLL_CTL_MOD,
            (true, false) => libc::EPOLL_CTL_DEL,
            (false, false) => return Ok(()),
        };

        let mut events: u32 = libc::EPOLLRDHUP as u32;
        if want_read {
            events |= libc::EPOLLIN as u32;
        }
        if want_write {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let res = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if res < 0 {
            let err = io::Error::last_os_error();
            // DEL on an already-closed fd is harmless.
            if op == libc::EPOLL_CTL_DEL {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn wait(
        &mut self,
        timeout_ms: u64,
        out: &mut Vec<FdEvent>,
        fds: &FdTable,
    ) -> io::Result<()> {
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let timeout = timeout_ms.min(i32::MAX as u64) as i32;
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for ev in events.iter().take(n as usize) {
            let fd = ev.u64 as RawFd;
            let owner = match fds.owner(fd) {
                Some(o) => o,
                // Deregistered between wait and dispatch.
                None => continue,
            };
            let bits = ev.events;
            out.push(FdEvent {
                fd,
                owner,
                readable: bits & (libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32) != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                error: bits & libc::EPOLLERR as u32 != 0,
                hup: bits & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0,
            });
        }
        Ok(())
    }
}

impl Drop for KernelPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

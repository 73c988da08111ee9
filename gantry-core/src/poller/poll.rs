//! poll(2) backend for non-Linux Unix platforms.
//!
//! Keeps a dense `pollfd` vector with an fd-indexed position map. Slower
//! than epoll for large sets but portable everywhere.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use crate::fd::FdTable;

use super::FdEvent;

pub struct KernelPoller {
    pfds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
}

impl KernelPoller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            pfds: Vec::new(),
            index: HashMap::new(),
        })
    }

    pub fn update(
        &mut self,
        fd: RawFd,
        want_read: bool,
        want_write: bool,
        _was_read: bool,
        _was_write: bool,
    ) -> io::Result<()> {
        let mut events: libc::c_short = 0;
        if want_read {
            events |= libc::POLLIN;
        }
        if want_write {
            events |= libc::POLLOUT;
        }
        match (self.index.get(&fd).copied(), events != 0) {
            (Some(pos), true) => self.pfds[pos].events = events,
            (Some(pos), false) => {
                self.pfds.swap_remove(pos);
                self.index.remove(&fd);
                if pos < self.pfds.len() {
                    let moved = self.pfds[pos].fd;
                    self.index.insert(moved, pos);
                }
            }
            (None, true) => {
                self.index.insert(fd, self.pfds.len());
                self.pfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
            }
            (None, false) => {}
        }
        Ok(())
    }

    pub fn wait(
        &mut self,
        timeout_ms: u64,
        out: &mut Vec<FdEvent>,
        fds: &FdTable,
    ) -> io::Result<()> {
        let timeout = timeout_ms.min(i32::MAX as u64) as i32;
        let n = unsafe {
            libc::poll(
                self.pfds.as_mut_ptr(),
                self.pfds.len() as libc::nfds_t,
                timeout,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for pfd in &self.pfds {
            if pfd.revents == 0 {
                continue;
            }
            let owner = match fds.owner(pfd.fd) {
                Some(o) => o,
                None => continue,
            };
            out.push(FdEvent {
                fd: pfd.fd,
                owner,
                readable: pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                hup: pfd.revents & libc::POLLHUP != 0,
            });
        }
        Ok(())
    }
}

//! Deferred signal handling.
//!
//! Real signal handlers may only do async-safe work: they set a bit in an
//! atomic mask and poke a self-pipe so a blocked poller wakes up. The
//! actual reactions run at the top of the next scheduler iteration, in
//! normal (non-handler) context.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Orders the worker understands, decoded from raw signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxySignal {
    /// Graceful stop: stop accepting, drain, exit when empty (SIGUSR1).
    SoftStop,
    /// Temporarily stop listening, keep sockets bound (SIGTTOU).
    Pause,
    /// Resume listening after a pause (SIGTTIN).
    Resume,
    /// Immediate teardown of every session (SIGTERM / SIGINT).
    HardStop,
    /// Wake every frontend management task. Internal only; no POSIX
    /// signal maps to it.
    Broadcast,
}

const BIT_SOFT_STOP: u32 = 0x01;
const BIT_PAUSE: u32 = 0x02;
const BIT_RESUME: u32 = 0x04;
const BIT_HARD_STOP: u32 = 0x08;
const BIT_BROADCAST: u32 = 0x10;

static PENDING: AtomicU32 = AtomicU32::new(0);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signo: libc::c_int) {
    let bit = match signo {
        libc::SIGUSR1 => BIT_SOFT_STOP,
        libc::SIGTTOU => BIT_PAUSE,
        libc::SIGTTIN => BIT_RESUME,
        libc::SIGTERM | libc::SIGINT => BIT_HARD_STOP,
        _ => return,
    };
    PENDING.fetch_or(bit, Ordering::Relaxed);
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        // A full pipe already guarantees a wakeup; the result is moot.
        unsafe {
            libc::write(fd, b"s".as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// The worker-side signal queue: a self-pipe plus the pending mask.
pub struct SignalQueue {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SignalQueue {
    /// Create the self-pipe and install handlers for the control signals.
    pub fn install() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        crate::net::set_nonblocking(read_fd)?;
        crate::net::set_nonblocking(write_fd)?;
        WAKE_FD.store(write_fd, Ordering::Relaxed);

        for signo in [
            libc::SIGUSR1,
            libc::SIGTTOU,
            libc::SIGTTIN,
            libc::SIGTERM,
            libc::SIGINT,
        ] {
            let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
            sa.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            sa.sa_flags = libc::SA_RESTART;
            if unsafe { libc::sigaction(signo, &sa, std::ptr::null_mut()) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self { read_fd, write_fd })
    }

    /// Descriptor the worker registers with the poller.
    #[inline]
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Drain the pipe and collect pending orders, in severity order.
    pub fn drain(&self) -> Vec<ProxySignal> {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
        let mask = PENDING.swap(0, Ordering::Relaxed);
        let mut out = Vec::new();
        if mask & BIT_HARD_STOP != 0 {
            out.push(ProxySignal::HardStop);
        }
        if mask & BIT_SOFT_STOP != 0 {
            out.push(ProxySignal::SoftStop);
        }
        if mask & BIT_PAUSE != 0 {
            out.push(ProxySignal::Pause);
        }
        if mask & BIT_RESUME != 0 {
            out.push(ProxySignal::Resume);
        }
        if mask & BIT_BROADCAST != 0 {
            out.push(ProxySignal::Broadcast);
        }
        out
    }

    /// Inject an order as if the signal had been delivered. Used by the
    /// admin applet and tests; takes the same path as real delivery.
    pub fn raise(&self, sig: ProxySignal) {
        let bit = match sig {
            ProxySignal::SoftStop => BIT_SOFT_STOP,
            ProxySignal::Pause => BIT_PAUSE,
            ProxySignal::Resume => BIT_RESUME,
            ProxySignal::HardStop => BIT_HARD_STOP,
            ProxySignal::Broadcast => BIT_BROADCAST,
        };
        PENDING.fetch_or(bit, Ordering::Relaxed);
        unsafe {
            libc::write(self.write_fd, b"s".as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl Drop for SignalQueue {
    fn drop(&mut self) {
        WAKE_FD.store(-1, Ordering::Relaxed);
        crate::net::close_fd(self.read_fd);
        crate::net::close_fd(self.write_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_and_drain() {
        let q = SignalQueue::install().unwrap();
        q.raise(ProxySignal::Pause);
        q.raise(ProxySignal::SoftStop);
        let sigs = q.drain();
        assert!(sigs.contains(&ProxySignal::Pause));
        assert!(sigs.contains(&ProxySignal::SoftStop));
        // Severity order: a hard stop always comes out first.
        q.raise(ProxySignal::Resume);
        q.raise(ProxySignal::HardStop);
        let sigs = q.drain();
        assert_eq!(sigs[0], ProxySignal::HardStop);
        assert!(q.drain().is_empty());
    }
}

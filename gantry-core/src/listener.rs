//! Frontend listeners.
//!
//! A listener is one bound socket of a frontend. Its state tracks why it
//! is (or is not) currently subscribed to the poller: a `Full` listener is
//! throttled by the frontend's maxconn, a `Limited` one by the session
//! rate limit, a `Paused` one by an operator signal. In every throttled
//! state the descriptor stays open so no connection attempt is refused at
//! the kernel level, only deferred.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::fd::{FdDir, FdOwner};
use crate::net;
use crate::poller::Poller;

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Created, no address work done yet.
    Init,
    /// Address assigned, socket not yet bound.
    Assigned,
    /// Bound and listening, not subscribed to the poller.
    Listening,
    /// Subscribed: accepting connections.
    Ready,
    /// Desubscribed: the frontend hit its session rate limit.
    Limited,
    /// Desubscribed by operator request (hot reload).
    Paused,
    /// Desubscribed: the frontend is at maxconn.
    Full,
    /// Bind or listen failed.
    ListenError,
}

#[derive(Debug)]
pub struct Listener {
    pub addr: SocketAddr,
    pub fd: RawFd,
    pub state: ListenerState,
    pub backlog: i32,
    /// Connections accepted through this listener.
    pub cum_accepts: u64,
}

impl Listener {
    pub fn new(addr: SocketAddr, backlog: i32) -> Self {
        Self {
            addr,
            fd: -1,
            state: ListenerState::Assigned,
            backlog,
            cum_accepts: 0,
        }
    }

    /// Bind and listen. Failure is recorded in the state and returned.
    pub fn bind(&mut self) -> io::Result<()> {
        debug_assert!(self.fd < 0);
        match net::tcp_listen(self.addr, self.backlog) {
            Ok(fd) => {
                self.fd = fd;
                self.state = ListenerState::Listening;
                if self.addr.port() == 0 {
                    if let Ok(Some(actual)) = net::local_addr(fd) {
                        self.addr = actual;
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.state = ListenerState::ListenError;
                Err(e)
            }
        }
    }

    /// Register with the poller and start accepting.
    pub fn enable(&mut self, poller: &mut Poller, frontend: usize, index: usize) {
        debug_assert!(self.fd >= 0);
        if self.state == ListenerState::Listening {
            poller.register(self.fd, FdOwner::Listener(frontend, index));
        }
        poller.want(self.fd, FdDir::Read);
        self.state = ListenerState::Ready;
    }

    fn desubscribe(&mut self, poller: &mut Poller, state: ListenerState) {
        if self.state == ListenerState::Ready {
            poller.stop(self.fd, FdDir::Read);
        }
        self.state = state;
    }

    /// Stop accepting: frontend at maxconn.
    pub fn set_full(&mut self, poller: &mut Poller) {
        if self.state == ListenerState::Ready {
            self.desubscribe(poller, ListenerState::Full);
        }
    }

    /// Stop accepting: session rate limit reached.
    pub fn set_limited(&mut self, poller: &mut Poller) {
        if self.state == ListenerState::Ready {
            self.desubscribe(poller, ListenerState::Limited);
        }
    }

    /// Operator pause. The descriptor stays open but desubscribed.
    pub fn pause(&mut self, poller: &mut Poller) {
        if self.state == ListenerState::Ready {
            self.desubscribe(poller, ListenerState::Paused);
        }
    }

    /// Resume accepting after full/limited/paused.
    pub fn resume(&mut self, poller: &mut Poller) {
        match self.state {
            ListenerState::Full | ListenerState::Limited | ListenerState::Paused => {
                poller.want(self.fd, FdDir::Read);
                self.state = ListenerState::Ready;
            }
            _ => {}
        }
    }

    /// Close the socket entirely (graceful stop past grace).
    pub fn unbind(&mut self, poller: &mut Poller) {
        if self.fd >= 0 {
            poller.remove(self.fd);
            net::close_fd(self.fd);
            self.fd = -1;
        }
        self.state = ListenerState::Assigned;
    }

    /// Accepting right now?
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == ListenerState::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_state_flow() {
        let mut poller = Poller::new().unwrap();
        let mut l = Listener::new("127.0.0.1:0".parse().unwrap(), 16);
        assert_eq!(l.state, ListenerState::Assigned);
        l.bind().unwrap();
        assert_eq!(l.state, ListenerState::Listening);
        l.enable(&mut poller, 0, 0);
        assert!(l.is_ready());

        l.set_full(&mut poller);
        assert_eq!(l.state, ListenerState::Full);
        l.resume(&mut poller);
        assert!(l.is_ready());

        l.set_limited(&mut poller);
        assert_eq!(l.state, ListenerState::Limited);
        l.resume(&mut poller);

        l.pause(&mut poller);
        assert_eq!(l.state, ListenerState::Paused);
        l.resume(&mut poller);
        assert!(l.is_ready());

        l.unbind(&mut poller);
        assert_eq!(l.state, ListenerState::Assigned);
        assert_eq!(l.fd, -1);
    }

    #[test]
    fn test_full_only_from_ready() {
        let mut poller = Poller::new().unwrap();
        let mut l = Listener::new("127.0.0.1:0".parse().unwrap(), 16);
        l.bind().unwrap();
        l.enable(&mut poller, 0, 0);
        l.pause(&mut poller);
        // A paused listener must not be silently switched to Full.
        l.set_full(&mut poller);
        assert_eq!(l.state, ListenerState::Paused);
        l.unbind(&mut poller);
    }

    #[test]
    fn test_bind_error_state() {
        // TEST-NET addresses are never assigned to a local interface, so
        // binding fails regardless of privileges.
        let mut l = Listener::new("192.0.2.1:9999".parse().unwrap(), 16);
        assert!(l.bind().is_err());
        assert_eq!(l.state, ListenerState::ListenError);
    }
}

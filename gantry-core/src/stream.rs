//! Stream interfaces.
//!
//! Each session has two: the client side, which exists from accept, and
//! the server side, which walks the assignment/connection states before
//! reaching establishment. The two sides advance independently but are
//! always updated within the same scheduler iteration.

use std::os::unix::io::RawFd;

use crate::ticks::{Tick, TICK_ETERNITY};

/// Stream-interface state.
///
/// ```text
/// INI → REQ → (QUE | TAR)? → ASS → CON → EST → DIS → CLO
///                                   ↘ CER → (retry → TAR/CON | REQ | CLO)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiState {
    /// Idle, before first wakeup.
    Ini,
    /// A server connection is desired.
    Req,
    /// Parked in a pending queue (server maxconn).
    Que,
    /// Turn-around pause after a failed connect.
    Tar,
    /// Server just assigned; accounting in progress.
    Ass,
    /// connect() issued, waiting for the outcome.
    Con,
    /// Connect attempt failed; deciding on retry.
    Cer,
    /// Established, data flowing.
    Est,
    /// One side shut; draining the rest.
    Dis,
    /// Fully closed.
    Clo,
}

impl SiState {
    /// Connection-oriented states where a server fd exists.
    #[inline]
    pub fn has_conn(&self) -> bool {
        matches!(self, SiState::Con | SiState::Est | SiState::Dis)
    }
}

/// Interface-level error observed (I/O error on this side).
pub const SI_FL_ERR: u32 = 0x01;
/// The interface's own deadline expired.
pub const SI_FL_EXP: u32 = 0x02;

/// One side of a session.
#[derive(Debug)]
pub struct StreamInterface {
    pub state: SiState,
    pub fd: RawFd,
    /// State-specific deadline (connect, turn-around, queue).
    pub exp: Tick,
    pub flags: u32,
}

impl StreamInterface {
    pub fn new() -> Self {
        Self {
            state: SiState::Ini,
            fd: -1,
            exp: TICK_ETERNITY,
            flags: 0,
        }
    }

    /// Client-side interface for an accepted connection: established from
    /// the start.
    pub fn accepted(fd: RawFd) -> Self {
        Self {
            state: SiState::Est,
            fd,
            exp: TICK_ETERNITY,
            flags: 0,
        }
    }

    #[inline]
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.flags |= flag;
    }

    #[inline]
    pub fn clr(&mut self, flag: u32) {
        self.flags &= !flag;
    }
}

impl Default for StreamInterface {
    fn default() -> Self {
        Self::new()
    }
}

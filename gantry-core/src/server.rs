//! Backend servers.
//!
//! A server belongs to exactly one backend. Its load-balancing position
//! data lives here (`SrvLbNode`) so the LB disciplines can move it between
//! trees without auxiliary maps; the trees themselves belong to the
//! backend's `LbState`.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::slots::SlotId;
use crate::stats::ServerCounters;

// ============================================================================
// Weights
// ============================================================================

/// Highest user-visible weight.
pub const UWEIGHT_MAX: u32 = 256;
/// Key multiplier used by the round-robin position encoding.
pub const UWEIGHT_RANGE: u32 = 256;
/// Internal scale applied to user weights for smooth modulation.
pub const WEIGHT_SCALE: u32 = 16;
/// Highest effective weight.
pub const EWEIGHT_MAX: u32 = UWEIGHT_MAX * WEIGHT_SCALE;

// ============================================================================
// State
// ============================================================================

/// Administrative/operational server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrvState {
    /// Accepting traffic.
    Running,
    /// Administratively disabled.
    Maintenance,
    /// Taken out by a failed health check.
    DownByCheck,
    /// Draining: existing sessions finish, no new ones are routed.
    Stopping,
}

impl SrvState {
    /// Short admin-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            SrvState::Running => "up",
            SrvState::Maintenance => "maint",
            SrvState::DownByCheck => "down",
            SrvState::Stopping => "stopping",
        }
    }
}

/// Which LB tree currently holds the server, with its key for removal.
///
/// The round-robin discipline swaps the roles of its two scratch trees, so
/// membership records the concrete tree (`Scratch(0)`/`Scratch(1)`) rather
/// than its current role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeLoc {
    #[default]
    None,
    /// FWRR current-pass tree.
    Curr(u64, u64),
    /// One of FWRR's two weight-sorted scratch trees (init/next roles).
    Scratch(u8, u64, u64),
    /// FWLC single tree.
    Lc(u64, u64),
}

/// Per-server load-balancing position data.
#[derive(Debug, Clone, Copy, Default)]
pub struct SrvLbNode {
    /// Next emission position (round robin).
    pub npos: i64,
    /// Last emission position.
    pub lpos: i64,
    /// Remainder carried between emissions for weight smoothing.
    pub rweight: i64,
    /// Tree membership.
    pub loc: TreeLoc,
}

// ============================================================================
// Handle
// ============================================================================

/// Weak reference to a server, validated on every use.
///
/// Sessions keep these instead of direct indices: the `uid` must still
/// match when the handle is resolved, so a server replaced at runtime can
/// never be aliased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHandle {
    pub backend: usize,
    pub index: usize,
    pub uid: u32,
}

// ============================================================================
// Server
// ============================================================================

/// Health-check parameters carried for the external prober; the core never
/// runs probes itself, it only consumes the resulting state transitions.
#[derive(Debug, Clone, Default)]
pub struct CheckParams {
    pub enabled: bool,
    pub addr: Option<SocketAddr>,
    pub port: Option<u16>,
    pub inter_ms: u32,
    pub rise: u32,
    pub fall: u32,
}

#[derive(Debug)]
pub struct Server {
    pub name: String,
    /// Numeric unique id within the process.
    pub uid: u32,
    pub addr: SocketAddr,
    pub state: SrvState,
    pub prev_state: SrvState,
    /// Set once at creation; backup servers only receive traffic when no
    /// active server is usable.
    pub backup: bool,
    /// User weight, 0..=256.
    pub uweight: u32,
    /// `uweight * WEIGHT_SCALE`; zero excludes the server.
    pub eweight: u32,
    pub prev_eweight: u32,
    /// In-flight connections.
    pub served: u32,
    /// Hard concurrent-connection cap; zero means unlimited.
    pub maxconn: u32,
    /// Sessions queued waiting for a slot on this specific server.
    pub pending: VecDeque<SlotId>,
    pub counters: ServerCounters,
    pub check: CheckParams,
    pub lb: SrvLbNode,
}

impl Server {
    pub fn new(name: impl Into<String>, uid: u32, addr: SocketAddr, uweight: u32) -> Self {
        let uweight = uweight.min(UWEIGHT_MAX);
        Self {
            name: name.into(),
            uid,
            addr,
            state: SrvState::Running,
            prev_state: SrvState::Running,
            backup: false,
            uweight,
            eweight: uweight * WEIGHT_SCALE,
            prev_eweight: uweight * WEIGHT_SCALE,
            served: 0,
            maxconn: 0,
            pending: VecDeque::new(),
            counters: ServerCounters::default(),
            check: CheckParams::default(),
            lb: SrvLbNode::default(),
        }
    }

    /// Can this server receive new traffic?
    #[inline]
    pub fn usable(&self) -> bool {
        matches!(self.state, SrvState::Running) && self.eweight > 0
    }

    /// Usability before the transition being applied.
    #[inline]
    pub fn prev_usable(&self) -> bool {
        matches!(self.prev_state, SrvState::Running) && self.prev_eweight > 0
    }

    /// Record current state as the snapshot future transitions diff against.
    #[inline]
    pub fn commit_state(&mut self) {
        self.prev_state = self.state;
        self.prev_eweight = self.eweight;
    }

    /// Apply a new user weight (clamped to the valid range).
    pub fn set_uweight(&mut self, uweight: u32) {
        self.uweight = uweight.min(UWEIGHT_MAX);
        self.eweight = self.uweight * WEIGHT_SCALE;
    }

    /// Number of sessions queued on this server.
    #[inline]
    pub fn nbpend(&self) -> usize {
        self.pending.len()
    }

    /// Saturated for selection: the LB skips this server. Either the limit
    /// is reached or earlier arrivals are already queued ahead.
    pub fn is_full(&self, dyn_maxconn: u32) -> bool {
        self.maxconn != 0 && (!self.pending.is_empty() || self.served >= dyn_maxconn)
    }

    /// At the connection limit itself (a fresh session must queue).
    pub fn at_capacity(&self, dyn_maxconn: u32) -> bool {
        self.maxconn != 0 && self.served >= dyn_maxconn
    }

    pub fn handle(&self, backend: usize, index: usize) -> ServerHandle {
        ServerHandle {
            backend,
            index,
            uid: self.uid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn srv(weight: u32) -> Server {
        Server::new("s1", 1, "127.0.0.1:8000".parse().unwrap(), weight)
    }

    #[test]
    fn test_eweight_scaling() {
        let s = srv(10);
        assert_eq!(s.eweight, 160);
        let s = srv(500);
        assert_eq!(s.uweight, UWEIGHT_MAX);
        assert_eq!(s.eweight, EWEIGHT_MAX);
    }

    #[test]
    fn test_usable() {
        let mut s = srv(1);
        assert!(s.usable());
        s.state = SrvState::Maintenance;
        assert!(!s.usable());
        s.state = SrvState::Running;
        s.set_uweight(0);
        assert!(!s.usable(), "zero weight excludes the server");
        s.state = SrvState::Stopping;
        s.set_uweight(1);
        assert!(!s.usable(), "draining server takes no new traffic");
    }

    #[test]
    fn test_commit_state_snapshot() {
        let mut s = srv(2);
        s.state = SrvState::DownByCheck;
        assert!(s.prev_usable());
        assert!(!s.usable());
        s.commit_state();
        assert!(!s.prev_usable());
    }

    #[test]
    fn test_fullness() {
        let mut s = srv(1);
        s.maxconn = 2;
        s.served = 2;
        assert!(s.is_full(2));
        assert!(s.at_capacity(2));
        s.served = 1;
        assert!(!s.is_full(2));
        s.pending.push_back(crate::slots::SlotId::from_raw(0, 0));
        assert!(s.is_full(2), "queued arrivals saturate the server");
        assert!(!s.at_capacity(2));
        s.maxconn = 0;
        assert!(!s.is_full(2));
    }

    #[test]
    fn test_handle_carries_uid() {
        let s = srv(1);
        let h = s.handle(3, 0);
        assert_eq!(h.uid, s.uid);
        assert_eq!(h.backend, 3);
    }
}

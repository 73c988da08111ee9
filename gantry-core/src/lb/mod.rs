//! Load-balancer core.
//!
//! One entry point, [`pick_server`], dispatching over the backend's
//! configured discipline. Each discipline keeps ordered structures over
//! two partitions (active, backup) and repositions servers as traffic and
//! transitions happen. Server state transitions are applied through the
//! hooks here so trees, weight totals and the first-backup pointer never
//! drift from the server states.

use std::collections::BTreeMap;

use crate::proxy::Backend;
use crate::queue::dynamic_maxconn;
use crate::server::{Server, SrvState};

pub mod chash;
pub mod fwlc;
pub mod fwrr;
pub mod hash;
pub mod map;

pub use hash::HashSource;

// ============================================================================
// Ordered Tree
// ============================================================================

/// Ordered multimap from a 64-bit key to a server index.
///
/// Duplicate keys are kept in insertion order via a monotonic sequence
/// tiebreaker; the pair `(key, seq)` is what members store for removal.
#[derive(Debug, Default)]
pub struct OrderedTree {
    tree: BTreeMap<(u64, u64), usize>,
    seq: u64,
}

impl OrderedTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: u64, srv: usize) -> (u64, u64) {
        let seq = self.seq;
        self.seq += 1;
        self.tree.insert((key, seq), srv);
        (key, seq)
    }

    pub fn remove(&mut self, loc: (u64, u64)) -> Option<usize> {
        self.tree.remove(&loc)
    }

    pub fn first(&self) -> Option<((u64, u64), usize)> {
        self.tree.iter().next().map(|(&k, &v)| (k, v))
    }

    pub fn iter(&self) -> impl Iterator<Item = ((u64, u64), usize)> + '_ {
        self.tree.iter().map(|(&k, &v)| (k, v))
    }

    /// Iterate starting at the first key >= `key`, wrapping to the start.
    pub fn iter_from(&self, key: u64) -> impl Iterator<Item = ((u64, u64), usize)> + '_ {
        self.tree
            .range((key, 0)..)
            .chain(self.tree.range(..(key, 0)))
            .map(|(&k, &v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

// ============================================================================
// Discipline State
// ============================================================================

/// Per-backend LB discipline state, dispatched by a single match.
#[derive(Debug)]
pub enum LbState {
    Fwrr(fwrr::FwrrState),
    Fwlc(fwlc::FwlcState),
    Chash(chash::ChashState),
    Map(map::MapState),
}

impl LbState {
    /// Smooth weighted round robin.
    pub fn new_roundrobin() -> Self {
        LbState::Fwrr(fwrr::FwrrState::new())
    }

    /// Weighted least connections.
    pub fn new_leastconn() -> Self {
        LbState::Fwlc(fwlc::FwlcState::new())
    }

    /// Consistent hashing over the given key source.
    pub fn new_chash(source: HashSource) -> Self {
        LbState::Chash(chash::ChashState::new(source))
    }

    /// Weight-expanded static round robin.
    pub fn new_static() -> Self {
        LbState::Map(map::MapState::new())
    }

    /// The hash key source, for disciplines that use one.
    pub fn hash_source(&self) -> Option<&HashSource> {
        match self {
            LbState::Chash(st) => Some(&st.source),
            _ => None,
        }
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Pick a server for a new session.
///
/// `key` feeds the consistent-hash discipline and is ignored elsewhere.
/// `avoid` is the server a redispatch is moving away from; it is only
/// returned when no alternative exists. Saturated servers are skipped; if
/// every candidate is saturated the caller queues at the backend.
pub fn pick_server(be: &mut Backend, key: Option<u32>, avoid: Option<usize>) -> Option<usize> {
    if be.srv_act == 0 {
        // No active server: fall back to backups.
        if !be.allbackups {
            return be.first_backup;
        }
        if be.srv_bck == 0 {
            return None;
        }
    }
    let use_backup = be.srv_act == 0;
    let beconn = be.beconn;
    let fullconn = be.fullconn;
    let Backend {
        servers, lb: state, ..
    } = be;
    let is_full =
        |srv: &Server| srv.is_full(dynamic_maxconn(srv, beconn, fullconn));
    match state {
        LbState::Fwrr(st) => fwrr::pick(st, servers, use_backup, avoid, &is_full),
        LbState::Fwlc(st) => fwlc::pick(st, servers, use_backup, avoid, &is_full),
        LbState::Chash(st) => chash::pick(st, servers, use_backup, key, avoid, &is_full),
        LbState::Map(st) => map::pick(st, servers, use_backup, avoid, &is_full),
    }
}

// ============================================================================
// Connection Accounting Hooks
// ============================================================================

/// A session was assigned to the server: bump `served`, reposition.
pub fn server_take_conn(be: &mut Backend, idx: usize) {
    be.servers[idx].served += 1;
    let served = be.servers[idx].served;
    be.servers[idx].counters.note_served(served);
    if let LbState::Fwlc(st) = &mut be.lb {
        fwlc::reposition(st, &mut be.servers, idx);
    }
}

/// A session released the server: drop `served`, reposition.
pub fn server_drop_conn(be: &mut Backend, idx: usize) {
    debug_assert!(be.servers[idx].served > 0);
    be.servers[idx].served = be.servers[idx].served.saturating_sub(1);
    if let LbState::Fwlc(st) = &mut be.lb {
        fwlc::reposition(st, &mut be.servers, idx);
    }
}

// ============================================================================
// Server Transitions
// ============================================================================

fn attach(be: &mut Backend, idx: usize) {
    let Backend {
        servers, lb: state, ..
    } = be;
    match state {
        LbState::Fwrr(st) => fwrr::attach(st, servers, idx),
        LbState::Fwlc(st) => fwlc::attach(st, servers, idx),
        LbState::Chash(st) => chash::attach(st, servers, idx),
        LbState::Map(st) => st.invalidate(),
    }
}

fn detach(be: &mut Backend, idx: usize) {
    let Backend {
        servers, lb: state, ..
    } = be;
    match state {
        LbState::Fwrr(st) => fwrr::detach(st, servers, idx),
        LbState::Fwlc(st) => fwlc::detach(st, servers, idx),
        LbState::Chash(st) => chash::detach(st, servers, idx),
        LbState::Map(st) => st.invalidate(),
    }
}

fn count_in(be: &mut Backend, idx: usize) {
    let (backup, ew) = (be.servers[idx].backup, be.servers[idx].eweight);
    if backup {
        be.srv_bck += 1;
        be.tot_wbck += ew;
    } else {
        be.srv_act += 1;
        be.tot_wact += ew;
    }
}

fn count_out(be: &mut Backend, idx: usize) {
    let (backup, ew) = (be.servers[idx].backup, be.servers[idx].prev_eweight);
    if backup {
        be.srv_bck -= 1;
        be.tot_wbck -= ew;
    } else {
        be.srv_act -= 1;
        be.tot_wact -= ew;
    }
}

/// Apply a state change (admin order or health-check outcome).
///
/// No-ops when the transition does not change usability; otherwise trees
/// and counters are updated atomically with respect to traffic (the worker
/// never calls this during a selection).
pub fn set_server_state(be: &mut Backend, idx: usize, new_state: SrvState) {
    let was_usable = be.servers[idx].prev_usable();
    be.servers[idx].state = new_state;
    let now_usable = be.servers[idx].usable();
    if was_usable == now_usable {
        be.servers[idx].commit_state();
        return;
    }
    if now_usable {
        count_in(be, idx);
        attach(be, idx);
    } else {
        detach(be, idx);
        count_out(be, idx);
    }
    if be.servers[idx].backup {
        be.rescan_first_backup();
    }
    be.servers[idx].commit_state();
}

/// Apply a weight change. A change to or from zero behaves like a state
/// transition; otherwise the server is repositioned in place.
pub fn set_server_weight(be: &mut Backend, idx: usize, uweight: u32) {
    let was_usable = be.servers[idx].prev_usable();
    be.servers[idx].set_uweight(uweight);
    let now_usable = be.servers[idx].usable();
    match (was_usable, now_usable) {
        (false, false) => {}
        (false, true) => {
            count_in(be, idx);
            attach(be, idx);
            if be.servers[idx].backup {
                be.rescan_first_backup();
            }
        }
        (true, false) => {
            detach(be, idx);
            count_out(be, idx);
            if be.servers[idx].backup {
                be.rescan_first_backup();
            }
        }
        (true, true) => {
            let prev = be.servers[idx].prev_eweight;
            let now = be.servers[idx].eweight;
            if be.servers[idx].backup {
                be.tot_wbck = be.tot_wbck - prev + now;
            } else {
                be.tot_wact = be.tot_wact - prev + now;
            }
            let Backend {
                servers, lb: state, ..
            } = be;
            match state {
                LbState::Fwrr(st) => fwrr::update_weight(st, servers, idx),
                LbState::Fwlc(st) => fwlc::update_weight(st, servers, idx),
                LbState::Chash(st) => chash::update_weight(st, servers, idx),
                LbState::Map(st) => st.invalidate(),
            }
        }
    }
    be.servers[idx].commit_state();
}

/// Register a server appended to a live backend (admin `pool.add`).
///
/// The snapshot is committed first so a server created in maintenance
/// enables cleanly later.
pub fn server_added(be: &mut Backend, idx: usize) {
    be.servers[idx].commit_state();
    if be.servers[idx].usable() {
        count_in(be, idx);
        attach(be, idx);
    }
    if be.servers[idx].backup {
        be.rescan_first_backup();
    }
}

/// Build all LB structures for a freshly configured backend.
pub fn init_backend(be: &mut Backend) {
    for idx in 0..be.servers.len() {
        if be.servers[idx].usable() {
            count_in(be, idx);
            attach(be, idx);
        }
        be.servers[idx].commit_state();
    }
    be.rescan_first_backup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::WEIGHT_SCALE;

    fn mk_backend(lb: LbState, weights: &[(u32, bool)]) -> Backend {
        let mut be = Backend::new("pool", 0, lb);
        for (i, &(w, backup)) in weights.iter().enumerate() {
            let uid = be.alloc_srv_uid();
            let mut s = Server::new(
                format!("s{i}"),
                uid,
                "127.0.0.1:9000".parse().unwrap(),
                w,
            );
            s.backup = backup;
            be.servers.push(s);
        }
        init_backend(&mut be);
        be
    }

    #[test]
    fn test_init_counts() {
        let be = mk_backend(LbState::new_roundrobin(), &[(2, false), (1, false), (1, true)]);
        assert_eq!(be.srv_act, 2);
        assert_eq!(be.srv_bck, 1);
        assert_eq!(be.tot_wact, 3 * WEIGHT_SCALE);
        assert_eq!(be.tot_wbck, WEIGHT_SCALE);
        assert_eq!(be.first_backup, Some(2));
    }

    #[test]
    fn test_down_up_counts() {
        let mut be = mk_backend(LbState::new_roundrobin(), &[(2, false), (1, false)]);
        set_server_state(&mut be, 0, SrvState::DownByCheck);
        assert_eq!(be.srv_act, 1);
        assert_eq!(be.tot_wact, WEIGHT_SCALE);
        // Re-applying the same state changes nothing.
        set_server_state(&mut be, 0, SrvState::Maintenance);
        assert_eq!(be.srv_act, 1);
        set_server_state(&mut be, 0, SrvState::Running);
        assert_eq!(be.srv_act, 2);
        assert_eq!(be.tot_wact, 3 * WEIGHT_SCALE);
    }

    #[test]
    fn test_weight_zero_acts_as_down() {
        let mut be = mk_backend(LbState::new_leastconn(), &[(1, false), (1, false)]);
        set_server_weight(&mut be, 1, 0);
        assert_eq!(be.srv_act, 1);
        assert!(!be.servers[1].usable());
        set_server_weight(&mut be, 1, 3);
        assert_eq!(be.srv_act, 2);
        assert_eq!(be.tot_wact, 4 * WEIGHT_SCALE);
    }

    #[test]
    fn test_backup_promotion() {
        let mut be = mk_backend(LbState::new_roundrobin(), &[(1, false), (1, true)]);
        assert_eq!(pick_server(&mut be, None, None), Some(0));
        set_server_state(&mut be, 0, SrvState::DownByCheck);
        // Only the backup remains; it is returned directly.
        assert_eq!(pick_server(&mut be, None, None), Some(1));
        set_server_state(&mut be, 1, SrvState::Maintenance);
        assert_eq!(pick_server(&mut be, None, None), None);
    }

    #[test]
    fn test_take_drop_conn_accounting() {
        let mut be = mk_backend(LbState::new_leastconn(), &[(1, false)]);
        server_take_conn(&mut be, 0);
        server_take_conn(&mut be, 0);
        assert_eq!(be.servers[0].served, 2);
        assert_eq!(be.servers[0].counters.max_served, 2);
        server_drop_conn(&mut be, 0);
        assert_eq!(be.servers[0].served, 1);
    }
}

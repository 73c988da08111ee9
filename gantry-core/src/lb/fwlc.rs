//! Fast weighted least connections.
//!
//! One ordered tree per partition, keyed on `served * EWEIGHT_MAX /
//! eweight` so a heavier server tolerates proportionally more in-flight
//! connections before losing the leftmost spot. Every `served` change
//! reinserts the server at its new key; ties go to the longest-standing
//! entry.

use crate::server::{Server, TreeLoc, EWEIGHT_MAX};

use super::OrderedTree;

#[derive(Debug)]
pub struct FwlcState {
    act: OrderedTree,
    bck: OrderedTree,
}

impl FwlcState {
    pub fn new() -> Self {
        Self {
            act: OrderedTree::new(),
            bck: OrderedTree::new(),
        }
    }

    fn tree(&mut self, backup: bool) -> &mut OrderedTree {
        if backup {
            &mut self.bck
        } else {
            &mut self.act
        }
    }
}

impl Default for FwlcState {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn lc_key(srv: &Server) -> u64 {
    debug_assert!(srv.eweight > 0);
    srv.served as u64 * EWEIGHT_MAX as u64 / srv.eweight as u64
}

pub fn attach(st: &mut FwlcState, servers: &mut [Server], idx: usize) {
    let key = lc_key(&servers[idx]);
    let tree = st.tree(servers[idx].backup);
    let (k, s) = tree.insert(key, idx);
    servers[idx].lb.loc = TreeLoc::Lc(k, s);
}

pub fn detach(st: &mut FwlcState, servers: &mut [Server], idx: usize) {
    if let TreeLoc::Lc(k, s) = servers[idx].lb.loc {
        st.tree(servers[idx].backup).remove((k, s));
        servers[idx].lb.loc = TreeLoc::None;
    }
}

/// Re-key after a `served` change. No-op for detached servers.
pub fn reposition(st: &mut FwlcState, servers: &mut [Server], idx: usize) {
    if let TreeLoc::Lc(k, s) = servers[idx].lb.loc {
        let tree = st.tree(servers[idx].backup);
        tree.remove((k, s));
        let key = lc_key(&servers[idx]);
        let (nk, ns) = tree.insert(key, idx);
        servers[idx].lb.loc = TreeLoc::Lc(nk, ns);
    }
}

/// Weight changed while usable: same movement as a reposition.
pub fn update_weight(st: &mut FwlcState, servers: &mut [Server], idx: usize) {
    reposition(st, servers, idx);
}

/// Leftmost non-saturated server.
pub fn pick(
    st: &mut FwlcState,
    servers: &mut [Server],
    use_backup: bool,
    avoid: Option<usize>,
    is_full: &dyn Fn(&Server) -> bool,
) -> Option<usize> {
    let tree = st.tree(use_backup);
    let mut avoided = None;
    for (_, idx) in tree.iter() {
        if is_full(&servers[idx]) {
            continue;
        }
        if avoid == Some(idx) {
            avoided = Some(idx);
            continue;
        }
        return Some(idx);
    }
    avoided
}

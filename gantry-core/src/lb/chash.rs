//! Consistent hashing.
//!
//! Every usable server owns `eweight` virtual nodes placed on an ordered
//! ring; a request's key maps to the nearest node at or after it, with
//! wrap-around. Adding or removing a server only remaps the keys that
//! land on its own nodes, which is the whole point: resizing the pool
//! barely disturbs existing client-to-server affinity.

use std::collections::HashMap;

use crate::server::Server;

use super::hash::{full_hash, HashSource};
use super::OrderedTree;

/// Spacing factor between a server's virtual-node indices.
const VNODE_SALT: u32 = 4099;

#[derive(Debug)]
pub struct ChashState {
    pub source: HashSource,
    act: OrderedTree,
    bck: OrderedTree,
    /// Tree locations of each server's virtual nodes, for removal.
    nodes: HashMap<usize, Vec<(u64, u64)>>,
    /// Rotating point for keyless picks.
    rotor: u32,
}

impl ChashState {
    pub fn new(source: HashSource) -> Self {
        Self {
            source,
            act: OrderedTree::new(),
            bck: OrderedTree::new(),
            nodes: HashMap::new(),
            rotor: 0,
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

fn vnode_point(uid: u32, i: u32) -> u32 {
    full_hash(uid.wrapping_mul(VNODE_SALT).wrapping_add(i))
}

pub fn attach(st: &mut ChashState, servers: &mut [Server], idx: usize) {
    let (uid, eweight, backup) = {
        let s = &servers[idx];
        (s.uid, s.eweight, s.backup)
    };
    let tree = st.tree(backup);
    let mut locs = Vec::with_capacity(eweight as usize);
    for i in 0..eweight {
        let point = vnode_point(uid, i);
        locs.push(tree.insert(point as u64, idx));
    }
    st.nodes.insert(idx, locs);
}

pub fn detach(st: &mut ChashState, servers: &mut [Server], idx: usize) {
    let backup = servers[idx].backup;
    if let Some(locs) = st.nodes.remove(&idx) {
        let tree = st.tree(backup);
        for loc in locs {
            tree.remove(loc);
        }
    }
}

/// Weight changes resize the server's share of the ring.
pub fn update_weight(st: &mut ChashState, servers: &mut [Server], idx: usize) {
    detach(st, servers, idx);
    attach(st, servers, idx);
}

/// Map `key` to its server, skipping saturated candidates along the ring.
pub fn pick(
    st: &mut ChashState,
    servers: &mut [Server],
    use_backup: bool,
    key: Option<u32>,
    avoid: Option<usize>,
    is_full: &dyn Fn(&Server) -> bool,
) -> Option<usize> {
    let start = match key {
        Some(k) => k,
        None => {
            // No key source in this request: rotate so keyless traffic
            // still spreads.
            st.rotor = st.rotor.wrapping_add(0x9e37_79b9);
            st.rotor
        }
    };
    let tree = if use_backup { &st.bck } else { &st.act };
    let mut avoided = None;
    let mut last = None;
    for (_, idx) in tree.iter_from(start as u64) {
        if last == Some(idx) {
            // Runs of the same server's nodes: skip cheaply.
            continue;
        }
        last = Some(idx);
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

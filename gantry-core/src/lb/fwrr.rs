//! Fast weighted round robin.
//!
//! Servers carry a fractional emission position: after each pick a
//! server's next position advances by `total_weight / eweight`, with the
//! remainder accumulated so the long-run emission count is exact. The
//! ordered `curr` tree yields the lowest-position server first, which
//! interleaves heavy and light servers smoothly instead of bursting.
//!
//! Each partition (active, backup) runs one group of three trees:
//!
//! - `curr`: servers ordered by position for the pass in progress;
//! - two weight-sorted scratch trees alternating the *init* and *next*
//!   roles: newcomers and weight-changed servers enter through *init*,
//!   servers whose position overflows the pass are parked in *next*.
//!
//! When `curr` and *init* run dry the scratch roles swap and a new pass
//! begins. At most one swap happens per selection.

use crate::server::{Server, SrvLbNode, TreeLoc, EWEIGHT_MAX, UWEIGHT_RANGE, WEIGHT_SCALE};

use super::OrderedTree;

#[derive(Debug)]
pub struct FwrrGroup {
    curr: OrderedTree,
    scratch: [OrderedTree; 2],
    /// Which scratch tree currently plays the *init* role.
    init_idx: u8,
    curr_pos: i64,
    curr_weight: i64,
    next_weight: i64,
}

impl FwrrGroup {
    fn new() -> Self {
        Self {
            curr: OrderedTree::new(),
            scratch: [OrderedTree::new(), OrderedTree::new()],
            init_idx: 0,
            curr_pos: 0,
            curr_weight: 0,
            next_weight: 0,
        }
    }

    #[inline]
    fn init_tree(&mut self) -> &mut OrderedTree {
        &mut self.scratch[self.init_idx as usize]
    }

    #[inline]
    fn next_tree_idx(&self) -> u8 {
        1 - self.init_idx
    }
}

#[derive(Debug)]
pub struct FwrrState {
    act: FwrrGroup,
    bck: FwrrGroup,
}

impl FwrrState {
    pub fn new() -> Self {
        Self {
            act: FwrrGroup::new(),
            bck: FwrrGroup::new(),
        }
    }

    fn group(&mut self, backup: bool) -> &mut FwrrGroup {
        if backup {
            &mut self.bck
        } else {
            &mut self.act
        }
    }
}

impl Default for FwrrState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tree Plumbing
// ============================================================================

fn dequeue(grp: &mut FwrrGroup, srv: &mut Server) {
    match srv.lb.loc {
        TreeLoc::Curr(k, s) => {
            grp.curr.remove((k, s));
        }
        TreeLoc::Scratch(w, k, s) => {
            grp.scratch[w as usize].remove((k, s));
        }
        TreeLoc::None => {}
        TreeLoc::Lc(..) => unreachable!("least-conn location under round robin"),
    }
    srv.lb.loc = TreeLoc::None;
}

/// Insert into a scratch tree sorted by weight, heaviest first.
fn queue_by_weight(grp: &mut FwrrGroup, which: u8, srv: &mut Server, idx: usize) {
    let key = (EWEIGHT_MAX - srv.eweight) as u64;
    let (k, s) = grp.scratch[which as usize].insert(key, idx);
    srv.lb.loc = TreeLoc::Scratch(which, k, s);
}

/// Re-insert a server after it was picked or repositioned.
fn queue_srv(grp: &mut FwrrGroup, srv: &mut Server, idx: usize) {
    debug_assert_eq!(srv.lb.loc, TreeLoc::None);
    if !srv.usable() {
        return;
    }
    let node = &srv.lb;
    if node.npos >= 2 * grp.curr_weight || node.npos >= grp.curr_weight + grp.next_weight {
        // Beyond this pass: park in the next tree, position rebased to
        // the coming pass.
        srv.lb.npos -= grp.curr_weight;
        queue_by_weight(grp, grp.next_tree_idx(), srv, idx);
    } else {
        let key = UWEIGHT_RANGE as i64 * node.npos
            + (EWEIGHT_MAX as i64 + node.rweight - srv.eweight as i64) / WEIGHT_SCALE as i64;
        debug_assert!(key >= 0);
        let (k, s) = grp.curr.insert(key as u64, idx);
        srv.lb.loc = TreeLoc::Curr(k, s);
    }
}

fn update_position(grp: &FwrrGroup, node: &mut SrvLbNode, eweight: u32) {
    let ew = eweight as i64;
    if node.npos == 0 {
        // First emission since (re)entering through the init tree: start
        // from the current pass position so a newcomer cannot monopolise
        // the next picks.
        node.lpos = grp.curr_pos;
        node.npos = grp.curr_pos + grp.next_weight / ew;
    } else {
        node.lpos = node.npos;
        node.npos += grp.next_weight / ew;
    }
    node.rweight += grp.next_weight % ew;
    if node.rweight >= ew {
        node.rweight -= ew;
        node.npos += 1;
    }
}

fn switch_trees(grp: &mut FwrrGroup) {
    grp.init_idx = grp.next_tree_idx();
    grp.curr_weight = grp.next_weight;
    grp.curr_pos = 0;
}

/// Candidate from the current tree, or the init tree when the current one
/// is empty or its head is past the current position (a hole).
fn server_from_group(grp: &mut FwrrGroup, servers: &[Server]) -> Option<(usize, bool)> {
    let curr_first = grp.curr.first();
    if let Some((_, idx)) = curr_first {
        if servers[idx].lb.npos <= grp.curr_pos {
            return Some((idx, false));
        }
    }
    if let Some((_, idx)) = grp.init_tree().first() {
        return Some((idx, true));
    }
    // A hole with an empty init tree: take the future server anyway.
    curr_first.map(|(_, idx)| (idx, false))
}

// ============================================================================
// Hooks
// ============================================================================

/// A server became usable: enter through the init tree.
pub fn attach(st: &mut FwrrState, servers: &mut [Server], idx: usize) {
    let grp = st.group(servers[idx].backup);
    grp.next_weight += servers[idx].eweight as i64;
    servers[idx].lb.npos = 0;
    servers[idx].lb.lpos = 0;
    servers[idx].lb.rweight = 0;
    queue_by_weight(grp, grp.init_idx, &mut servers[idx], idx);
}

/// A server stopped being usable: extract it wherever it is.
pub fn detach(st: &mut FwrrState, servers: &mut [Server], idx: usize) {
    let grp = st.group(servers[idx].backup);
    grp.next_weight -= servers[idx].prev_eweight as i64;
    dequeue(grp, &mut servers[idx]);
}

/// Reposition after a weight change that kept the server usable.
pub fn update_weight(st: &mut FwrrState, servers: &mut [Server], idx: usize) {
    let grp = st.group(servers[idx].backup);
    grp.next_weight =
        grp.next_weight - servers[idx].prev_eweight as i64 + servers[idx].eweight as i64;
    match servers[idx].lb.loc {
        TreeLoc::Scratch(w, ..) if w == grp.init_idx => {
            // Still waiting in init: only the weight key changes.
            dequeue(grp, &mut servers[idx]);
            queue_by_weight(grp, grp.init_idx, &mut servers[idx], idx);
        }
        TreeLoc::None => {
            // Extracted mid-selection; it will requeue itself.
        }
        _ => {
            // In curr or next: adjust the position so the new weight takes
            // effect without handing the server a burst of picks.
            let ew = servers[idx].eweight as i64;
            let node = &mut servers[idx].lb;
            let prev_next = node.npos;
            let step = grp.next_weight / ew;
            node.npos = node.lpos + step;
            node.rweight = 0;
            if node.npos > prev_next {
                node.npos = prev_next;
            }
            if node.npos < grp.curr_pos + 2 {
                node.npos = grp.curr_pos + step;
            }
            dequeue(grp, &mut servers[idx]);
            queue_srv(grp, &mut servers[idx], idx);
        }
    }
}

// ============================================================================
// Selection
// ============================================================================

/// One weighted-round-robin pick.
///
/// Saturated servers are extracted, chained aside, and reinserted after
/// the winner is chosen, so they keep their position for when they free
/// up. `avoid` is only returned when it is the sole usable choice.
pub fn pick(
    st: &mut FwrrState,
    servers: &mut [Server],
    use_backup: bool,
    avoid: Option<usize>,
    is_full: &dyn Fn(&Server) -> bool,
) -> Option<usize> {
    let grp = st.group(use_backup);
    let mut switched = false;
    let mut avoided: Option<usize> = None;
    let mut full_list: Vec<usize> = Vec::new();
    let chosen: Option<usize>;

    loop {
        if grp.curr_weight == 0 {
            // Empty pass: pick up weights that changed since the last one.
            grp.curr_pos = grp.next_weight;
            grp.curr_weight = grp.next_weight;
        }
        let got = loop {
            if let Some(found) = server_from_group(grp, servers) {
                break Some(found);
            }
            if switched {
                break None;
            }
            switched = true;
            switch_trees(grp);
        };
        let (idx, from_init) = match got {
            Some(x) => x,
            None => {
                // Both trees dry: settle for the avoided server if any.
                chosen = avoided;
                break;
            }
        };
        if from_init {
            servers[idx].lb.npos = 0;
            servers[idx].lb.rweight = 0;
        }
        let eweight = servers[idx].eweight;
        update_position(grp, &mut servers[idx].lb, eweight);
        dequeue(grp, &mut servers[idx]);
        grp.curr_pos += 1;

        if !is_full(&servers[idx]) {
            if avoid != Some(idx) || avoided.is_some() {
                chosen = Some(idx);
                break;
            }
            avoided = Some(idx);
        }
        // Saturated or avoided: set aside, reinserted below.
        full_list.push(idx);
    }

    if let Some(c) = chosen {
        if servers[c].lb.loc == TreeLoc::None {
            queue_srv(grp, &mut servers[c], c);
        }
    }
    for f in full_list {
        if Some(f) == chosen {
            continue;
        }
        if switched {
            // The pass restarted while they were out; their position is
            // meaningless now, re-enter by weight.
            servers[f].lb.npos = 0;
            servers[f].lb.rweight = 0;
            queue_by_weight(grp, grp.init_idx, &mut servers[f], f);
        } else {
            queue_srv(grp, &mut servers[f], f);
        }
    }
    chosen
}

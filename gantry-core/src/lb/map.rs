//! Static weight-expanded round robin.
//!
//! A precomputed map holds one slot per unit of user weight, interleaved
//! so servers alternate rather than burst. The map is rebuilt lazily
//! after any server transition; between rebuilds selection is a cursor
//! walk, which makes this the cheapest discipline when weights rarely
//! change.

use crate::server::Server;

#[derive(Debug, Default)]
struct PartMap {
    slots: Vec<usize>,
    pos: usize,
    valid: bool,
}

#[derive(Debug, Default)]
pub struct MapState {
    act: PartMap,
    bck: PartMap,
}

impl MapState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop both maps; they rebuild on the next pick.
    pub fn invalidate(&mut self) {
        self.act.valid = false;
        self.bck.valid = false;
    }
}

/// Interleaved expansion: each pass hands every server its weight in
/// credit and emits the richest, so a 3:1 pair comes out as
/// `a a b a` rather than `a a a b`.
fn rebuild(part: &mut PartMap, servers: &[Server], backup: bool) {
    part.slots.clear();
    part.pos = 0;
    part.valid = true;
    let members: Vec<usize> = servers
        .iter()
        .enumerate()
        .filter(|(_, s)| s.backup == backup && s.usable())
        .map(|(i, _)| i)
        .collect();
    let total: i64 = members.iter().map(|&i| servers[i].uweight as i64).sum();
    if total == 0 {
        return;
    }
    let mut credit: Vec<i64> = vec![0; members.len()];
    for _ in 0..total {
        let mut best = 0;
        for (m, &idx) in members.iter().enumerate() {
            credit[m] += servers[idx].uweight as i64;
            if credit[m] > credit[best] {
                best = m;
            }
        }
        credit[best] -= total;
        part.slots.push(members[best]);
    }
}

pub fn pick(
    st: &mut MapState,
    servers: &mut [Server],
    use_backup: bool,
    avoid: Option<usize>,
    is_full: &dyn Fn(&Server) -> bool,
) -> Option<usize> {
    let part = if use_backup { &mut st.bck } else { &mut st.act };
    if !part.valid {
        rebuild(part, servers, use_backup);
    }
    if part.slots.is_empty() {
        return None;
    }
    let mut avoided = None;
    for _ in 0..part.slots.len() {
        let idx = part.slots[part.pos];
        part.pos = (part.pos + 1) % part.slots.len();
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

//! Pending-connection queues and dynamic admission.
//!
//! When every eligible server is saturated, a session parks in a FIFO
//! queue: on the specific server it was assigned to (persistence, direct
//! dispatch), or on the backend when no server was chosen. Releasing a
//! server connection promotes the head of the server's own queue first,
//! then the backend's.

use crate::proxy::Backend;
use crate::server::Server;
use crate::slots::SlotId;

/// Where a queued session is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedAt {
    Server(usize),
    Backend,
}

/// Effective concurrent-connection limit for a server right now.
///
/// With a `fullconn` threshold configured, the limit ramps up linearly
/// with backend load: an idle backend keeps servers on a small floor so a
/// traffic burst spreads before piling onto one machine, and the full
/// `maxconn` is only reachable at `fullconn` concurrent backend sessions.
pub fn dynamic_maxconn(srv: &Server, beconn: u32, fullconn: u32) -> u32 {
    if srv.maxconn == 0 {
        return u32::MAX;
    }
    if fullconn == 0 || beconn >= fullconn {
        return srv.maxconn;
    }
    let scaled = srv.maxconn as u64 * beconn as u64 / fullconn as u64;
    (scaled as u32).max(1)
}

/// Park a session in the appropriate queue.
pub fn enqueue(be: &mut Backend, at: QueuedAt, sid: SlotId) {
    match at {
        QueuedAt::Server(idx) => be.servers[idx].pending.push_back(sid),
        QueuedAt::Backend => be.pending.push_back(sid),
    }
}

/// Remove a parked session (abort, queue timeout). Returns whether it was
/// still queued.
pub fn remove_pending(be: &mut Backend, at: QueuedAt, sid: SlotId) -> bool {
    let queue = match at {
        QueuedAt::Server(idx) => &mut be.servers[idx].pending,
        QueuedAt::Backend => &mut be.pending,
    };
    if let Some(pos) = queue.iter().position(|&q| q == sid) {
        queue.remove(pos);
        true
    } else {
        false
    }
}

/// Promote the next queued session after `srv_idx` released a slot.
///
/// The server's own queue has priority (those sessions insisted on this
/// server); the shared backend queue feeds any server with room.
pub fn next_pending(be: &mut Backend, srv_idx: usize) -> Option<(SlotId, QueuedAt)> {
    if let Some(sid) = be.servers[srv_idx].pending.pop_front() {
        return Some((sid, QueuedAt::Server(srv_idx)));
    }
    be.pending.pop_front().map(|sid| (sid, QueuedAt::Backend))
}

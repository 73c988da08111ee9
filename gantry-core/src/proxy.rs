//! Frontends and backends.
//!
//! A frontend accepts client connections and runs inspection; a backend
//! owns a server pool, a load-balancing discipline and the pending queue
//! for sessions awaiting a server slot. Both carry their own counters and
//! error snapshots.

use std::collections::VecDeque;

use crate::lb::LbState;
use crate::listener::Listener;
use crate::rules::{SwitchRule, TcpRule};
use crate::server::Server;
use crate::slots::SlotId;
use crate::stats::{ErrorLog, FreqCounter, ProxyCounters};
use crate::task::TaskId;
use crate::ticks::Tick;

/// Frontend listening state, driven by signals and graceful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Listeners accepting.
    Ready,
    /// Listeners desubscribed by the pause signal.
    Paused,
    /// Graceful stop underway; no new connections.
    Stopped,
}

// ============================================================================
// Frontend
// ============================================================================

#[derive(Debug)]
pub struct Frontend {
    pub name: String,
    pub id: usize,
    pub listeners: Vec<Listener>,
    /// Concurrent-session cap; zero means unlimited.
    pub maxconn: u32,
    /// Sessions per second; zero means unlimited.
    pub rate_limit: u32,
    /// Live session count.
    pub feconn: u32,
    pub sess_rate: FreqCounter,
    pub counters: ProxyCounters,
    pub errors: ErrorLog,
    /// Where unmatched traffic goes.
    pub default_backend: Option<usize>,
    pub switch_rules: Vec<SwitchRule>,
    /// Layer-4 rules evaluated at accept.
    pub conn_rules: Vec<TcpRule>,
    /// Content rules evaluated once payload arrives.
    pub content_rules: Vec<TcpRule>,
    /// How long content rules may wait for payload, ms. Zero disables
    /// inspection delay (content rules evaluate once, forced).
    pub inspect_delay: u32,
    /// Client-side inactivity timeout, ms. Zero means none.
    pub timeout_client: u32,
    /// Hold time for tarpitted connections, ms.
    pub timeout_tarpit: u32,
    /// Set TCP_NODELAY on accepted sockets and never delay forwarding.
    pub nodelay: bool,
    pub state: ProxyState,
    /// Grace period granted to live sessions on soft stop, ms.
    pub grace_ms: u32,
    /// Deadline after which remaining sessions are torn down.
    pub stop_time: Option<Tick>,
    /// Management task (grace expiry, rate-limit resume).
    pub mgmt_task: Option<TaskId>,
}

impl Frontend {
    pub fn new(name: impl Into<String>, id: usize) -> Self {
        Self {
            name: name.into(),
            id,
            listeners: Vec::new(),
            maxconn: 0,
            rate_limit: 0,
            feconn: 0,
            sess_rate: FreqCounter::new(),
            counters: ProxyCounters::default(),
            errors: ErrorLog::new(),
            default_backend: None,
            switch_rules: Vec::new(),
            conn_rules: Vec::new(),
            content_rules: Vec::new(),
            inspect_delay: 0,
            timeout_client: 0,
            timeout_tarpit: 0,
            nodelay: false,
            state: ProxyState::Ready,
            grace_ms: 0,
            stop_time: None,
            mgmt_task: None,
        }
    }

    /// Frontend at its session cap?
    #[inline]
    pub fn at_maxconn(&self) -> bool {
        self.maxconn != 0 && self.feconn >= self.maxconn
    }

    /// Accepting new sessions at all?
    #[inline]
    pub fn accepting(&self) -> bool {
        self.state == ProxyState::Ready
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub id: usize,
    pub servers: Vec<Server>,
    pub lb: LbState,
    /// Sessions queued without an assigned server.
    pub pending: VecDeque<SlotId>,
    /// Live sessions routed into this backend.
    pub beconn: u32,
    /// Load level at which per-server dynamic maxconn reaches its
    /// configured ceiling. Zero disables the ramp.
    pub fullconn: u32,
    pub counters: ProxyCounters,
    pub errors: ErrorLog,
    /// Connect establishment timeout, ms.
    pub timeout_connect: u32,
    /// Server-side inactivity timeout, ms.
    pub timeout_server: u32,
    /// Maximum time a session may wait in a pending queue, ms.
    pub timeout_queue: u32,
    /// Connection retries per session before giving up.
    pub retries: u32,
    /// Rebalance to another server on the final retry.
    pub redispatch: bool,
    /// Abort the server side as soon as the client goes away.
    pub abortonclose: bool,
    /// Spread over all usable backups instead of the first one.
    pub allbackups: bool,
    /// Do not refresh a direction's read timeout on opposite-direction
    /// write activity.
    pub independent_streams: bool,
    /// Usable non-backup server count.
    pub srv_act: u32,
    /// Usable backup server count.
    pub srv_bck: u32,
    /// Total effective weight of usable active servers.
    pub tot_wact: u32,
    /// Total effective weight of usable backup servers.
    pub tot_wbck: u32,
    /// First usable backup in declaration order.
    pub first_backup: Option<usize>,
    /// Divisor turning effective weights back into user weights for
    /// reporting.
    pub wdiv: u32,
    /// Monotonic source for server uids.
    pub next_srv_uid: u32,
}

impl Backend {
    pub fn new(name: impl Into<String>, id: usize, lb: LbState) -> Self {
        Self {
            name: name.into(),
            id,
            servers: Vec::new(),
            lb,
            pending: VecDeque::new(),
            beconn: 0,
            fullconn: 0,
            counters: ProxyCounters::default(),
            errors: ErrorLog::new(),
            timeout_connect: 5_000,
            timeout_server: 0,
            timeout_queue: 0,
            retries: 3,
            redispatch: false,
            abortonclose: false,
            allbackups: false,
            independent_streams: false,
            srv_act: 0,
            srv_bck: 0,
            tot_wact: 0,
            tot_wbck: 0,
            first_backup: None,
            wdiv: crate::server::WEIGHT_SCALE,
            next_srv_uid: 1,
        }
    }

    /// Sessions queued at the backend (excluding per-server queues).
    #[inline]
    pub fn nbpend(&self) -> usize {
        self.pending.len()
    }

    /// Total queued sessions, backend plus all servers.
    pub fn total_pending(&self) -> usize {
        self.pending.len() + self.servers.iter().map(|s| s.nbpend()).sum::<usize>()
    }

    /// Any usable server at all (active or backup)?
    pub fn has_usable_server(&self) -> bool {
        self.srv_act > 0 || self.srv_bck > 0
    }

    /// Allocate the next server uid.
    pub fn alloc_srv_uid(&mut self) -> u32 {
        let uid = self.next_srv_uid;
        self.next_srv_uid += 1;
        uid
    }

    /// Find a server by name.
    pub fn server_named(&self, name: &str) -> Option<usize> {
        self.servers.iter().position(|s| s.name == name)
    }

    /// Rescan for the first usable backup, in declaration order.
    pub fn rescan_first_backup(&mut self) {
        self.first_backup = self
            .servers
            .iter()
            .position(|s| s.backup && s.usable());
    }
}

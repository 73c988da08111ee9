//! Sessions: the end-to-end forwarding engine.
//!
//! A session is born on accept, runs the request analysers, obtains a
//! server from the load balancer (possibly waiting in a queue), connects,
//! and then splices bytes between its two buffers until either side
//! finishes. All progress happens inside [`Session::process`], which runs
//! to completion on every wakeup and re-arms its own poller interest and
//! timers before returning; FD callbacks only move bytes and flip buffer
//! flags.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use tracing::{debug, trace};

use crate::buffer::{
    Buffer, BUF_READ_ACTIVITY, BUF_READ_ERROR, BUF_SHUTR, BUF_SHUTW, BUF_WRITE_ACTIVITY,
    BUF_WRITE_ENA, BUF_WRITE_ERROR,
};
use crate::fd::FdDir;
use crate::lb;
use crate::net::{self, ReadStatus, WriteStatus};
use crate::poller::Poller;
use crate::proxy::{Backend, Frontend};
use crate::queue::{self, QueuedAt};
use crate::rules::{self, RuleVerdict};
use crate::server::ServerHandle;
use crate::slots::SlotId;
use crate::stream::{SiState, StreamInterface, SI_FL_ERR};
use crate::task::Scheduler;
use crate::ticks::{tick_add, tick_first, tick_is_expired, Clock, Tick, TICK_ETERNITY};

/// The slice of worker state a session handler may touch. The worker
/// builds one per dispatch by splitting borrows; the session itself is
/// checked out of its arena for the duration.
pub struct SessionCtx<'a> {
    pub clock: &'a Clock,
    pub sched: &'a mut Scheduler,
    pub poller: &'a mut Poller,
    pub frontends: &'a mut [Frontend],
    pub backends: &'a mut [Backend],
    /// Graceful stop underway: no new work, existing sessions drain.
    pub stopping: bool,
    /// Hard stop: every session terminates on its next wakeup.
    pub hard_stop: bool,
}

/// Default per-direction buffer capacity.
pub const BUFSIZE: usize = 16 * 1024;

/// Turn-around ceiling between connection retries, ms.
const TURNAROUND_MAX_MS: u32 = 1000;

// ============================================================================
// Termination Taxonomy
// ============================================================================

/// Who caused the session to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrClass {
    #[default]
    None,
    /// Client-side timeout.
    CliTo,
    /// Client abort or socket error.
    CliCl,
    /// Server-side timeout.
    SrvTo,
    /// Server abort, socket or connect error.
    SrvCl,
    /// Denied or aborted by proxy policy (rules, maxconn, tarpit).
    PrxCond,
    /// Local resource exhaustion (fd, memory, port).
    Resource,
    /// State-machine or internal error.
    Internal,
    /// No usable server in the backend.
    Down,
}

impl ErrClass {
    pub fn label(&self) -> &'static str {
        match self {
            ErrClass::None => "-",
            ErrClass::CliTo => "CLITO",
            ErrClass::CliCl => "CLICL",
            ErrClass::SrvTo => "SRVTO",
            ErrClass::SrvCl => "SRVCL",
            ErrClass::PrxCond => "PRXCOND",
            ErrClass::Resource => "RESOURCE",
            ErrClass::Internal => "INTERNAL",
            ErrClass::Down => "DOWN",
        }
    }
}

/// Where in its life the session was when it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinState {
    /// During request analysis.
    R,
    /// During connect.
    C,
    /// Waiting for server response headers.
    H,
    /// During data transfer.
    D,
    /// During the last push to the client.
    L,
    /// While queued.
    Q,
    /// While tarpitted.
    T,
}

impl FinState {
    pub fn label(&self) -> &'static str {
        match self {
            FinState::R => "R",
            FinState::C => "C",
            FinState::H => "H",
            FinState::D => "D",
            FinState::L => "L",
            FinState::Q => "Q",
            FinState::T => "T",
        }
    }
}

// ============================================================================
// Session Flags
// ============================================================================

/// A server has been assigned.
pub const SN_ASSIGNED: u32 = 0x01;
/// The server address is resolved.
pub const SN_ADDR_SET: u32 = 0x02;
/// A backend has been assigned (beconn counted).
pub const SN_BE_ASSIGNED: u32 = 0x04;
/// The session has been redispatched away from a failing server.
pub const SN_REDISP: u32 = 0x08;
/// The session is being tarpitted.
pub const SN_TARPIT: u32 = 0x10;

/// Analyser bits, cleared as each stage completes.
pub const AN_REQ_CONTENT: u32 = 0x01;
pub const AN_REQ_SWITCHING: u32 = 0x02;

/// Outcome of one processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    /// Terminal: the worker must release the session.
    Closed,
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    pub task: crate::task::TaskId,
    pub frontend: usize,
    pub backend: Option<usize>,
    pub srv: Option<ServerHandle>,
    /// Server to avoid on redispatch.
    pub avoid: Option<usize>,
    pub cli: StreamInterface,
    pub srv_si: StreamInterface,
    /// Client-to-server bytes.
    pub req: Buffer,
    /// Server-to-client bytes.
    pub rep: Buffer,
    pub peer: Option<SocketAddr>,
    pub flags: u32,
    pub analysers: u32,
    pub conn_retries: u32,
    pub err_class: ErrClass,
    pub fin: Option<FinState>,
    pub queued_at: Option<QueuedAt>,

    // Per-direction deadlines; eternity when the wait is not armed.
    cli_rex: Tick,
    cli_wex: Tick,
    srv_rex: Tick,
    srv_wex: Tick,
    inspect_exp: Tick,
    tarpit_exp: Tick,

    // Transaction timestamps, worker-clock milliseconds.
    pub t_accept: u64,
    queue_start: Option<u64>,
    /// Total time spent queued, ms.
    pub t_queue: u64,
    pub t_connect: Option<u64>,
    pub t_data: Option<u64>,
    pub t_close: Option<u64>,

    /// Last connect failure was a timeout (drives SRVTO vs SRVCL).
    conn_err_timeout: bool,
    /// `server_take_conn` has been signalled and not yet balanced.
    pub served_counted: bool,
    /// The session reached full establishment at least once.
    pub established: bool,
}

impl Session {
    /// Build a session for a freshly accepted client connection.
    pub fn new(
        fd: RawFd,
        peer: Option<SocketAddr>,
        frontend: usize,
        timeout_client: u32,
        retries: u32,
        now: Tick,
        now_ms: u64,
        task: crate::task::TaskId,
    ) -> Self {
        let cli_rex = if timeout_client != 0 {
            tick_add(now, timeout_client)
        } else {
            TICK_ETERNITY
        };
        Self {
            task,
            frontend,
            backend: None,
            srv: None,
            avoid: None,
            cli: StreamInterface::accepted(fd),
            srv_si: StreamInterface::new(),
            req: Buffer::new(BUFSIZE),
            rep: Buffer::new(BUFSIZE),
            peer,
            flags: 0,
            analysers: AN_REQ_CONTENT | AN_REQ_SWITCHING,
            conn_retries: retries,
            err_class: ErrClass::None,
            fin: None,
            queued_at: None,
            cli_rex,
            cli_wex: TICK_ETERNITY,
            srv_rex: TICK_ETERNITY,
            srv_wex: TICK_ETERNITY,
            inspect_exp: TICK_ETERNITY,
            tarpit_exp: TICK_ETERNITY,
            t_accept: now_ms,
            queue_start: None,
            t_queue: 0,
            t_connect: None,
            t_data: None,
            t_close: None,
            conn_err_timeout: false,
            served_counted: false,
            established: false,
        }
    }

    #[inline]
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    fn set(&mut self, flag: u32) {
        self.flags |= flag;
    }

    #[inline]
    fn clr(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    /// Record the first termination cause; later causes do not overwrite.
    pub fn terminate(&mut self, class: ErrClass, fin: FinState) {
        if self.err_class == ErrClass::None {
            self.err_class = class;
            self.fin = Some(fin);
        }
        self.cli.state = SiState::Clo;
        self.srv_si.state = SiState::Clo;
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.cli.state == SiState::Clo && self.srv_si.state == SiState::Clo
    }

    /// A queued session was granted the slot it was waiting for.
    pub fn assign_from_queue(&mut self, handle: ServerHandle) {
        debug_assert_eq!(self.srv_si.state, SiState::Que);
        self.srv = Some(handle);
        self.set(SN_ASSIGNED | SN_ADDR_SET);
        self.queued_at = None;
        self.srv_si.state = SiState::Ass;
        self.srv_si.exp = TICK_ETERNITY;
    }

    // ------------------------------------------------------------------
    // FD Callbacks (invoked by the worker before waking the task)
    // ------------------------------------------------------------------

    /// Move bytes for a client-side readiness event.
    pub fn client_io(
        &mut self,
        readable: bool,
        writable: bool,
        error: bool,
        poller: &mut Poller,
    ) {
        let fd = self.cli.fd;
        if error {
            self.cli.set(SI_FL_ERR);
            self.req.set(BUF_READ_ERROR);
            self.rep.set(BUF_WRITE_ERROR);
            return;
        }
        if readable && !self.req.input_closed() {
            if self.req.space() == 0 {
                // Nothing to do until the consumer drains; interest is
                // dropped during re-arm.
            } else {
                match net::read_to_buffer(fd, &mut self.req) {
                    Ok(ReadStatus::Data(_)) => {}
                    Ok(ReadStatus::Eof) => self.req.set(BUF_SHUTR),
                    Ok(ReadStatus::WouldBlock) => poller.would_block(fd, FdDir::Read),
                    Err(_) => {
                        self.cli.set(SI_FL_ERR);
                        self.req.set(BUF_READ_ERROR);
                    }
                }
            }
        }
        if writable {
            if self.rep.is_empty() {
                poller.would_block(fd, FdDir::Write);
            } else {
                match net::write_from_buffer(fd, &mut self.rep) {
                    Ok(WriteStatus::Data(_)) => {}
                    Ok(WriteStatus::WouldBlock) => poller.would_block(fd, FdDir::Write),
                    Err(_) => {
                        self.cli.set(SI_FL_ERR);
                        self.rep.set(BUF_WRITE_ERROR);
                    }
                }
            }
        }
    }

    /// Move bytes (or settle the connect) for a server-side event.
    pub fn server_io(
        &mut self,
        readable: bool,
        writable: bool,
        error: bool,
        poller: &mut Poller,
    ) {
        let fd = self.srv_si.fd;
        if self.srv_si.state == SiState::Con {
            // The only event a connecting socket produces is the connect
            // outcome, surfaced through writability or an error.
            if error {
                self.srv_si.set(SI_FL_ERR);
                return;
            }
            if writable {
                match net::connect_error(fd) {
                    Err(_) => self.srv_si.set(SI_FL_ERR),
                    Ok(()) => match net::is_connected(fd) {
                        Ok(true) => self.srv_si.set(SI_FL_CONN_OK),
                        // Speculative attempt before the handshake done.
                        Ok(false) => poller.would_block(fd, FdDir::Write),
                        Err(_) => self.srv_si.set(SI_FL_ERR),
                    },
                }
            }
            return;
        }
        if error {
            self.srv_si.set(SI_FL_ERR);
            self.rep.set(BUF_READ_ERROR);
            self.req.set(BUF_WRITE_ERROR);
            return;
        }
        if readable && !self.rep.input_closed() {
            if self.rep.space() != 0 {
                match net::read_to_buffer(fd, &mut self.rep) {
                    Ok(ReadStatus::Data(_)) => {}
                    Ok(ReadStatus::Eof) => self.rep.set(BUF_SHUTR),
                    Ok(ReadStatus::WouldBlock) => poller.would_block(fd, FdDir::Read),
                    Err(_) => {
                        self.srv_si.set(SI_FL_ERR);
                        self.rep.set(BUF_READ_ERROR);
                    }
                }
            }
        }
        if writable {
            if self.req.is_empty() || !self.req.has(BUF_WRITE_ENA) {
                poller.would_block(fd, FdDir::Write);
            } else {
                match net::write_from_buffer(fd, &mut self.req) {
                    Ok(WriteStatus::Data(_)) => {}
                    Ok(WriteStatus::WouldBlock) => poller.would_block(fd, FdDir::Write),
                    Err(_) => {
                        self.srv_si.set(SI_FL_ERR);
                        self.req.set(BUF_WRITE_ERROR);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Main State Machine
    // ------------------------------------------------------------------

    /// Advance the session as far as possible. Called on every wakeup.
    pub fn process(&mut self, sid: SlotId, ctx: &mut SessionCtx<'_>) -> SessionStatus {
        let now = ctx.clock.now();

        if ctx.hard_stop && !self.is_closed() {
            let class = if self.srv_si.state == SiState::Est {
                ErrClass::SrvCl
            } else {
                ErrClass::CliCl
            };
            let fin = if self.established {
                FinState::D
            } else {
                FinState::R
            };
            self.release_queue_slot(sid, ctx);
            self.terminate(class, fin);
        }

        self.refresh_timeouts(now, ctx);
        if !self.is_closed() {
            self.check_client_side(sid, now, ctx);
        }

        // Server-side transitions chain within a single pass: an accepted
        // request may assign, connect and even establish speculatively.
        let mut guard = 0;
        while !self.is_closed() {
            let before = self.srv_si.state;
            match before {
                SiState::Ini => {
                    if self.has(SN_TARPIT) {
                        self.run_tarpit(now, ctx);
                    } else {
                        self.srv_si.state = SiState::Req;
                        continue;
                    }
                }
                SiState::Req => self.run_request(sid, now, ctx),
                SiState::Que => self.run_queue_wait(sid, now, ctx),
                SiState::Tar => self.run_turnaround(now),
                SiState::Ass => self.run_assign(sid, now, ctx),
                SiState::Con | SiState::Cer => self.run_connect_wait(now, ctx),
                SiState::Est | SiState::Dis => self.run_established(now, ctx),
                SiState::Clo => {}
            }
            if self.srv_si.state == before {
                break;
            }
            guard += 1;
            if guard > 16 {
                // A transition loop is a state-machine impossibility.
                panic!("session state machine did not settle");
            }
        }

        if self.is_closed() {
            return SessionStatus::Closed;
        }
        self.rearm(ctx);
        SessionStatus::Running
    }

    // ------------------------------------------------------------------
    // Timeout Accounting
    // ------------------------------------------------------------------

    fn refresh_timeouts(&mut self, now: Tick, ctx: &SessionCtx<'_>) {
        let fe_timeout = ctx.frontends[self.frontend].timeout_client;
        let (be_timeout, indep) = match self.backend {
            Some(b) => (
                ctx.backends[b].timeout_server,
                ctx.backends[b].independent_streams,
            ),
            None => (0, false),
        };
        let req_act = self.req.take_activity();
        let rep_act = self.rep.take_activity();

        if req_act & BUF_READ_ACTIVITY != 0 && fe_timeout != 0 {
            self.cli_rex = tick_add(now, fe_timeout);
        }
        if req_act & BUF_WRITE_ACTIVITY != 0 && be_timeout != 0 {
            self.srv_wex = tick_add(now, be_timeout);
            if !indep {
                self.srv_rex = tick_add(now, be_timeout);
            }
        }
        if rep_act & BUF_READ_ACTIVITY != 0 && be_timeout != 0 {
            self.srv_rex = tick_add(now, be_timeout);
        }
        if rep_act & BUF_WRITE_ACTIVITY != 0 && fe_timeout != 0 {
            self.cli_wex = tick_add(now, fe_timeout);
            if !indep {
                self.cli_rex = tick_add(now, fe_timeout);
            }
        }
        if rep_act & BUF_READ_ACTIVITY != 0 && self.t_data.is_none() {
            self.t_data = Some(ctx.clock.now_ms());
        }
        // Arm write deadlines the moment data is waiting to leave.
        if !self.rep.is_empty() && self.cli_wex == TICK_ETERNITY && fe_timeout != 0 {
            self.cli_wex = tick_add(now, fe_timeout);
        }
        if !self.req.is_empty()
            && self.req.has(BUF_WRITE_ENA)
            && self.srv_wex == TICK_ETERNITY
            && be_timeout != 0
        {
            self.srv_wex = tick_add(now, be_timeout);
        }
    }

    fn check_client_side(&mut self, sid: SlotId, now: Tick, ctx: &mut SessionCtx<'_>) {
        if self.cli.has(SI_FL_ERR) || self.req.has(BUF_READ_ERROR) || self.rep.has(BUF_WRITE_ERROR)
        {
            let fin = self.current_phase();
            self.release_queue_slot(sid, ctx);
            self.terminate(ErrClass::CliCl, fin);
            return;
        }
        if tick_is_expired(self.cli_rex, now) && !self.req.input_closed() {
            // No requirement to keep waiting for a request that will
            // never finish arriving.
            let fin = self.current_phase();
            self.release_queue_slot(sid, ctx);
            self.terminate(ErrClass::CliTo, fin);
            return;
        }
        if tick_is_expired(self.cli_wex, now) && !self.rep.is_empty() {
            self.release_queue_slot(sid, ctx);
            self.terminate(ErrClass::CliTo, FinState::L);
        }
    }

    /// Which final-state letter the current stage maps to.
    fn current_phase(&self) -> FinState {
        match self.srv_si.state {
            SiState::Ini | SiState::Req => {
                if self.has(SN_TARPIT) {
                    FinState::T
                } else {
                    FinState::R
                }
            }
            SiState::Que => FinState::Q,
            SiState::Tar | SiState::Ass | SiState::Con | SiState::Cer => FinState::C,
            SiState::Est | SiState::Dis | SiState::Clo => {
                if self.rep.total() == 0 {
                    FinState::H
                } else {
                    FinState::D
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Request Analysis & Assignment
    // ------------------------------------------------------------------

    fn run_tarpit(&mut self, now: Tick, ctx: &mut SessionCtx<'_>) {
        if self.tarpit_exp == TICK_ETERNITY {
            let hold = ctx.frontends[self.frontend].timeout_tarpit;
            if hold == 0 {
                self.terminate(ErrClass::PrxCond, FinState::T);
                return;
            }
            self.tarpit_exp = tick_add(now, hold);
        } else if tick_is_expired(self.tarpit_exp, now) {
            self.terminate(ErrClass::PrxCond, FinState::T);
        }
    }

    fn run_request(&mut self, sid: SlotId, now: Tick, ctx: &mut SessionCtx<'_>) {
        if self.analysers & AN_REQ_CONTENT != 0 {
            let fe = &ctx.frontends[self.frontend];
            let inspect_delay = fe.inspect_delay;
            if fe.content_rules.is_empty() {
                self.analysers &= !AN_REQ_CONTENT;
            } else {
                let forced = inspect_delay == 0
                    || tick_is_expired(self.inspect_exp, now)
                    || self.req.is_full()
                    || self.req.input_closed();
                let verdict = rules::eval_content_rules(
                    &fe.content_rules,
                    self.peer.as_ref(),
                    self.req.data(),
                    forced,
                );
                match verdict {
                    RuleVerdict::Miss => {
                        if self.inspect_exp == TICK_ETERNITY {
                            self.inspect_exp = tick_add(now, inspect_delay);
                        }
                        return;
                    }
                    RuleVerdict::Reject => {
                        ctx.frontends[self.frontend].counters.denied_req += 1;
                        self.terminate(ErrClass::PrxCond, FinState::R);
                        return;
                    }
                    RuleVerdict::Tarpit => {
                        ctx.frontends[self.frontend].counters.denied_req += 1;
                        self.set(SN_TARPIT);
                        self.analysers = 0;
                        self.srv_si.state = SiState::Ini;
                        return;
                    }
                    RuleVerdict::Accept => {
                        self.analysers &= !AN_REQ_CONTENT;
                        self.inspect_exp = TICK_ETERNITY;
                    }
                }
            }
        }

        if self.analysers & AN_REQ_SWITCHING != 0 {
            let fe = &ctx.frontends[self.frontend];
            let target = rules::eval_switch_rules(
                &fe.switch_rules,
                self.peer.as_ref(),
                self.req.data(),
                fe.default_backend,
            );
            let Some(be_idx) = target else {
                self.terminate(ErrClass::PrxCond, FinState::R);
                return;
            };
            self.backend = Some(be_idx);
            self.set(SN_BE_ASSIGNED);
            self.analysers &= !AN_REQ_SWITCHING;
            let be = &mut ctx.backends[be_idx];
            self.conn_retries = be.retries;
            be.beconn += 1;
            be.counters.cum_conn += 1;
            let beconn = be.beconn;
            be.counters.note_conn(beconn);
        }

        self.assign_server(sid, now, ctx);
    }

    fn assign_server(&mut self, sid: SlotId, now: Tick, ctx: &mut SessionCtx<'_>) {
        let be_idx = self.backend.expect("assignment without a backend");
        let be = &mut ctx.backends[be_idx];
        if !be.has_usable_server() {
            be.counters.failed_conns += 1;
            self.terminate(ErrClass::Down, FinState::C);
            return;
        }
        let key = be
            .lb
            .hash_source()
            .cloned()
            .and_then(|src| lb::hash::extract_key(&src, self.peer.as_ref(), self.req.data()));
        match lb::pick_server(be, key, self.avoid) {
            Some(idx) => {
                let dyn_max = queue::dynamic_maxconn(&be.servers[idx], be.beconn, be.fullconn);
                let handle = be.servers[idx].handle(be_idx, idx);
                if be.servers[idx].at_capacity(dyn_max) {
                    // The chosen server cannot take one more right now:
                    // wait for a slot in its own queue.
                    self.enter_queue(sid, QueuedAt::Server(idx), Some(handle), now, ctx);
                } else {
                    self.srv = Some(handle);
                    self.set(SN_ASSIGNED | SN_ADDR_SET);
                    self.srv_si.state = SiState::Ass;
                }
            }
            None => {
                self.enter_queue(sid, QueuedAt::Backend, None, now, ctx);
            }
        }
    }

    fn enter_queue(
        &mut self,
        sid: SlotId,
        at: QueuedAt,
        handle: Option<ServerHandle>,
        now: Tick,
        ctx: &mut SessionCtx<'_>,
    ) {
        let be_idx = self.backend.expect("queueing without a backend");
        queue::enqueue(&mut ctx.backends[be_idx], at, sid);
        self.queued_at = Some(at);
        if let Some(h) = handle {
            self.srv = Some(h);
            self.set(SN_ASSIGNED | SN_ADDR_SET);
        }
        self.queue_start = Some(ctx.clock.now_ms());
        let tq = ctx.backends[be_idx].timeout_queue;
        self.srv_si.exp = if tq != 0 {
            tick_add(now, tq)
        } else {
            TICK_ETERNITY
        };
        self.srv_si.state = SiState::Que;
        trace!(backend = be_idx, "session queued");
    }

    fn run_queue_wait(&mut self, sid: SlotId, now: Tick, ctx: &mut SessionCtx<'_>) {
        if tick_is_expired(self.srv_si.exp, now) {
            self.release_queue_slot(sid, ctx);
            self.terminate(ErrClass::SrvTo, FinState::Q);
        }
        // Promotion arrives via assign_from_queue + a message wakeup.
    }

    fn run_turnaround(&mut self, now: Tick) {
        if tick_is_expired(self.srv_si.exp, now) {
            self.srv_si.exp = TICK_ETERNITY;
            self.srv_si.state = if self.has(SN_ASSIGNED) {
                SiState::Ass
            } else {
                SiState::Req
            };
        }
    }

    fn run_assign(&mut self, sid: SlotId, now: Tick, ctx: &mut SessionCtx<'_>) {
        if let Some(start) = self.queue_start.take() {
            self.t_queue += ctx.clock.now_ms().saturating_sub(start);
        }
        let handle = self.srv.expect("ASS without a server");
        let Some(addr) = resolve_handle(ctx, handle).map(|s| s.addr) else {
            // The server vanished or was replaced while we were queued.
            self.terminate(ErrClass::Internal, FinState::C);
            return;
        };
        lb::server_take_conn(&mut ctx.backends[handle.backend], handle.index);
        self.served_counted = true;

        match net::tcp_connect(addr) {
            Ok((fd, _immediate)) => {
                self.srv_si.fd = fd;
                self.srv_si.state = SiState::Con;
                self.srv_si.clr(SI_FL_ERR | SI_FL_CONN_OK);
                let tc = ctx.backends[handle.backend].timeout_connect;
                self.srv_si.exp = if tc != 0 {
                    tick_add(now, tc)
                } else {
                    TICK_ETERNITY
                };
                if self.t_connect.is_none() {
                    self.t_connect = Some(ctx.clock.now_ms());
                }
                ctx.poller.register(fd, crate::fd::FdOwner::SessionServer(sid));
                ctx.poller.want(fd, FdDir::Write);
                if ctx.frontends[self.frontend].nodelay {
                    let _ = net::set_nodelay(fd, true);
                }
            }
            Err(e) => {
                debug!(error = %e, "connect() refused locally");
                self.conn_err_timeout = false;
                self.connect_failed(now, ctx);
            }
        }
    }

    fn run_connect_wait(&mut self, now: Tick, ctx: &mut SessionCtx<'_>) {
        if self.srv_si.has(SI_FL_ERR) {
            self.conn_err_timeout = false;
            self.connect_failed(now, ctx);
            return;
        }
        if self.srv_si.has(SI_FL_CONN_OK) {
            self.establish(now, ctx);
            return;
        }
        if tick_is_expired(self.srv_si.exp, now) {
            self.conn_err_timeout = true;
            self.connect_failed(now, ctx);
        }
    }

    /// Connect failed or timed out: tear the attempt down and decide
    /// between retry, redispatch and giving up.
    fn connect_failed(&mut self, now: Tick, ctx: &mut SessionCtx<'_>) {
        let handle = self.srv.expect("connect failure without a server");
        self.srv_si.state = SiState::Cer;
        if self.srv_si.fd >= 0 {
            ctx.poller.remove(self.srv_si.fd);
            net::close_fd(self.srv_si.fd);
            self.srv_si.fd = -1;
        }
        self.srv_si.clr(SI_FL_ERR | SI_FL_CONN_OK);
        if self.served_counted {
            lb::server_drop_conn(&mut ctx.backends[handle.backend], handle.index);
            self.served_counted = false;
        }
        if let Some(srv) = resolve_handle_mut(ctx, handle) {
            srv.counters.failed_conns += 1;
        }

        if self.conn_retries == 0 {
            ctx.backends[handle.backend].counters.failed_conns += 1;
            let class = if self.conn_err_timeout {
                ErrClass::SrvTo
            } else {
                ErrClass::SrvCl
            };
            self.terminate(class, FinState::C);
            return;
        }
        self.conn_retries -= 1;
        let be = &mut ctx.backends[handle.backend];
        let turnaround = if be.timeout_connect != 0 {
            be.timeout_connect.min(TURNAROUND_MAX_MS)
        } else {
            TURNAROUND_MAX_MS
        };
        if self.conn_retries == 0 && be.redispatch && !self.has(SN_REDISP) {
            // Last chance: rebalance away from the failing server.
            be.counters.redispatches += 1;
            self.set(SN_REDISP);
            self.clr(SN_ASSIGNED | SN_ADDR_SET);
            self.avoid = Some(handle.index);
            self.srv = None;
            self.conn_retries += 1;
        } else {
            be.counters.retries += 1;
            if let Some(srv) = resolve_handle_mut(ctx, handle) {
                srv.counters.retries += 1;
            }
        }
        // Spread reconnections after a failure burst.
        self.srv_si.exp = tick_add(now, turnaround);
        self.srv_si.state = SiState::Tar;
    }

    fn establish(&mut self, now: Tick, ctx: &mut SessionCtx<'_>) {
        let handle = self.srv.expect("established without a server");
        self.srv_si.clr(SI_FL_CONN_OK);
        self.srv_si.state = SiState::Est;
        self.srv_si.exp = TICK_ETERNITY;
        self.established = true;
        if let Some(t) = self.t_connect {
            self.t_connect = Some(ctx.clock.now_ms().saturating_sub(t));
        }
        if let Some(srv) = resolve_handle_mut(ctx, handle) {
            srv.counters.cum_sess += 1;
        }
        let be = &mut ctx.backends[handle.backend];
        be.counters.cum_sess += 1;
        if be.timeout_server != 0 {
            self.srv_rex = tick_add(now, be.timeout_server);
        }
        ctx.frontends[self.frontend].counters.cum_sess += 1;
        // Forwarding opens in both directions.
        self.req.set(BUF_WRITE_ENA);
        self.rep.set(BUF_WRITE_ENA);
        if ctx.frontends[self.frontend].nodelay {
            self.req.set(crate::buffer::BUF_NEVER_WAIT);
            self.rep.set(crate::buffer::BUF_NEVER_WAIT);
        }
        debug!(
            backend = handle.backend,
            server = handle.index,
            "session established"
        );
    }

    // ------------------------------------------------------------------
    // Forwarding
    // ------------------------------------------------------------------

    fn run_established(&mut self, now: Tick, ctx: &mut SessionCtx<'_>) {
        let handle = self.srv.expect("EST without a server");
        let abortonclose = ctx.backends[handle.backend].abortonclose;

        if self.rep.has(BUF_READ_ERROR) || self.req.has(BUF_WRITE_ERROR) {
            ctx.backends[handle.backend].counters.failed_resp += 1;
            let fin = self.current_phase();
            self.terminate(ErrClass::SrvCl, fin);
            return;
        }
        if tick_is_expired(self.srv_rex, now) && !self.rep.input_closed() {
            let fin = self.current_phase();
            self.terminate(ErrClass::SrvTo, fin);
            return;
        }
        if tick_is_expired(self.srv_wex, now) && !self.req.is_empty() {
            self.terminate(ErrClass::SrvTo, FinState::D);
            return;
        }
        if abortonclose && self.req.input_closed() && !self.rep.input_closed() {
            let fin = self.current_phase();
            self.terminate(ErrClass::CliCl, fin);
            return;
        }

        // Half-close propagation: once a direction has no more input and
        // its buffer drained, pass the FIN through.
        if self.req.input_closed() && self.req.is_empty() && !self.req.output_closed() {
            net::shutdown_write(self.srv_si.fd);
            self.req.set(BUF_SHUTW);
        }
        if self.rep.input_closed() && self.rep.is_empty() && !self.rep.output_closed() {
            net::shutdown_write(self.cli.fd);
            self.rep.set(BUF_SHUTW);
        }

        let req_done = self.req.input_closed() && self.req.output_closed();
        let rep_done = self.rep.input_closed() && self.rep.output_closed();
        if req_done && rep_done {
            self.srv_si.state = SiState::Clo;
            self.cli.state = SiState::Clo;
        } else if req_done || rep_done {
            self.srv_si.state = SiState::Dis;
        }
    }

    // ------------------------------------------------------------------
    // Queue Release & Re-Arm
    // ------------------------------------------------------------------

    /// Leave a pending queue without being served.
    fn release_queue_slot(&mut self, sid: SlotId, ctx: &mut SessionCtx<'_>) {
        if let (Some(at), Some(be_idx)) = (self.queued_at.take(), self.backend) {
            queue::remove_pending(&mut ctx.backends[be_idx], at, sid);
        }
        if let Some(start) = self.queue_start.take() {
            self.t_queue += ctx.clock.now_ms().saturating_sub(start);
        }
    }

    /// Re-request poller interest and the wakeup timer. Nothing carries
    /// across suspensions implicitly.
    fn rearm(&mut self, ctx: &mut SessionCtx<'_>) {
        // Disarm deadlines whose wait no longer exists, or an already-due
        // timer would wake the task in a tight loop.
        if self.rep.is_empty() {
            self.cli_wex = TICK_ETERNITY;
        }
        if self.req.is_empty() || !self.req.has(BUF_WRITE_ENA) {
            self.srv_wex = TICK_ETERNITY;
        }
        if self.req.input_closed() {
            self.cli_rex = TICK_ETERNITY;
        }
        if self.rep.input_closed() {
            self.srv_rex = TICK_ETERNITY;
        }

        let poller = &mut *ctx.poller;
        let cli_fd = self.cli.fd;

        // Client reads: wanted while input may arrive and space exists.
        // A tarpitted session deliberately stops reading.
        if !self.req.input_closed() && self.req.space() > 0 && !self.has(SN_TARPIT) {
            poller.want(cli_fd, FdDir::Read);
        } else {
            poller.stop(cli_fd, FdDir::Read);
        }
        // Client writes: wanted while response bytes are pending.
        if !self.rep.is_empty() && !self.rep.output_closed() {
            poller.want(cli_fd, FdDir::Write);
        } else {
            poller.stop(cli_fd, FdDir::Write);
        }

        let srv_fd = self.srv_si.fd;
        if srv_fd >= 0 {
            match self.srv_si.state {
                SiState::Con => {
                    poller.want(srv_fd, FdDir::Write);
                }
                SiState::Est | SiState::Dis => {
                    if !self.rep.input_closed() && self.rep.space() > 0 {
                        poller.want(srv_fd, FdDir::Read);
                    } else {
                        poller.stop(srv_fd, FdDir::Read);
                    }
                    if !self.req.is_empty() && self.req.has(BUF_WRITE_ENA)
                        && !self.req.output_closed()
                    {
                        poller.want(srv_fd, FdDir::Write);
                    } else {
                        poller.stop(srv_fd, FdDir::Write);
                    }
                }
                _ => {}
            }
        }

        let mut exp = tick_first(self.cli_rex, self.cli_wex);
        exp = tick_first(exp, tick_first(self.srv_rex, self.srv_wex));
        exp = tick_first(exp, self.srv_si.exp);
        exp = tick_first(exp, tick_first(self.inspect_exp, self.tarpit_exp));
        if exp == TICK_ETERNITY {
            ctx.sched.clear_timer(self.task);
        } else {
            ctx.sched.set_timer(self.task, ctx.clock.deadline(exp));
        }
    }
}

/// Connect completed (set by the server-side FD callback).
pub const SI_FL_CONN_OK: u32 = 0x04;

fn resolve_handle<'a>(
    ctx: &'a SessionCtx<'_>,
    handle: ServerHandle,
) -> Option<&'a crate::server::Server> {
    ctx.backends
        .get(handle.backend)
        .and_then(|be| be.servers.get(handle.index))
        .filter(|s| s.uid == handle.uid)
}

fn resolve_handle_mut<'a>(
    ctx: &'a mut SessionCtx<'_>,
    handle: ServerHandle,
) -> Option<&'a mut crate::server::Server> {
    ctx.backends
        .get_mut(handle.backend)
        .and_then(|be| be.servers.get_mut(handle.index))
        .filter(|s| s.uid == handle.uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SlotId;

    fn session() -> Session {
        Session::new(
            -1,
            None,
            0,
            5_000,
            3,
            1_000,
            1_000,
            SlotId::from_raw(0, 0),
        )
    }

    #[test]
    fn test_new_session_defaults() {
        let s = session();
        assert_eq!(s.cli.state, SiState::Est);
        assert_eq!(s.srv_si.state, SiState::Ini);
        assert_eq!(s.err_class, ErrClass::None);
        assert_eq!(s.conn_retries, 3);
        assert!(s.analysers & AN_REQ_CONTENT != 0);
        assert!(s.analysers & AN_REQ_SWITCHING != 0);
    }

    #[test]
    fn test_terminate_first_cause_wins() {
        let mut s = session();
        s.terminate(ErrClass::CliTo, FinState::R);
        s.terminate(ErrClass::SrvCl, FinState::D);
        assert_eq!(s.err_class, ErrClass::CliTo);
        assert_eq!(s.fin, Some(FinState::R));
        assert!(s.is_closed());
    }

    #[test]
    fn test_assign_from_queue() {
        let mut s = session();
        s.srv_si.state = SiState::Que;
        let h = ServerHandle {
            backend: 0,
            index: 1,
            uid: 42,
        };
        s.assign_from_queue(h);
        assert_eq!(s.srv_si.state, SiState::Ass);
        assert_eq!(s.srv, Some(h));
        assert!(s.has(SN_ASSIGNED));
        assert!(s.queued_at.is_none());
    }

    #[test]
    fn test_phase_letters() {
        let mut s = session();
        assert_eq!(s.current_phase(), FinState::R);
        s.srv_si.state = SiState::Que;
        assert_eq!(s.current_phase(), FinState::Q);
        s.srv_si.state = SiState::Con;
        assert_eq!(s.current_phase(), FinState::C);
        s.srv_si.state = SiState::Est;
        assert_eq!(s.current_phase(), FinState::H);
    }

    #[test]
    fn test_error_labels() {
        assert_eq!(ErrClass::PrxCond.label(), "PRXCOND");
        assert_eq!(ErrClass::None.label(), "-");
        assert_eq!(FinState::Q.label(), "Q");
    }
}

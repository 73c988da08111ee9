//! The worker: one scheduler, one poller, all the proxy state.
//!
//! Everything mutable lives here and is threaded explicitly into the
//! handlers; there are no globals. One iteration of [`Worker::run_once`]
//! is: drain deferred signals, run the task queue, attempt speculative
//! I/O, block in the poller up to the next timer, dispatch events, then
//! advance the clock and expire timers. Handlers run to completion and
//! re-request their own wakeups.

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::admin::{self, AdminConn, AdminCtx};
use crate::error::{Error, Result};
use crate::fd::{FdDir, FdOwner};
use crate::lb::{self, HashSource, LbState};
use crate::listener::{Listener, ListenerState};
use crate::net;
use crate::poller::{FdEvent, Poller, MAX_DELAY_MS};
use crate::proxy::{Backend, Frontend, ProxyState};
use crate::queue;
use crate::rules::{self, IpNet, RuleAction, RuleCond, RuleVerdict, SwitchRule, TcpRule};
use crate::server::{Server, SrvState};
use crate::session::{
    ErrClass, FinState, Session, SessionCtx, SessionStatus, SN_TARPIT,
};
use crate::signal::{ProxySignal, SignalQueue};
use crate::slots::{SlotId, Slots};
use crate::stream::SiState;
use crate::task::{Scheduler, TaskKind, WAKE_INIT, WAKE_IO, WAKE_MSG};
use crate::ticks::{tick_add, tick_is_expired, Clock};

use gantry_config::{
    BalanceConfig, CondConfig, Config, RuleActionConfig, RuleConfig, SwitchConfig,
};

/// Connections accepted from one listener per iteration.
const ACCEPT_BATCH: usize = 64;
/// Tasks run per iteration before yielding to the poller.
const TASK_BATCH: usize = 256;

pub struct Worker {
    clock: Clock,
    sched: Scheduler,
    poller: Poller,
    pub frontends: Vec<Frontend>,
    pub backends: Vec<Backend>,
    sessions: Slots<Session>,
    admin_conns: Slots<AdminConn>,
    signals: Option<SignalQueue>,
    admin_fd: RawFd,
    admin_path: Option<PathBuf>,
    /// Process-wide session cap; zero means unlimited.
    global_maxconn: u32,
    pub stopping: bool,
    pub hard_stop: bool,
}

impl Worker {
    /// Build a worker from a validated configuration: construct backends
    /// and frontends, bind every listener, set up the admin socket.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        gantry_config::validate(cfg)?;
        let mut worker = Worker {
            clock: Clock::new(),
            sched: Scheduler::new(),
            poller: Poller::new().map_err(Error::Poller)?,
            frontends: Vec::new(),
            backends: Vec::new(),
            sessions: Slots::new(),
            admin_conns: Slots::new(),
            signals: None,
            admin_fd: -1,
            admin_path: None,
            global_maxconn: cfg.global.maxconn,
            stopping: false,
            hard_stop: false,
        };

        for (id, bc) in cfg.backend.iter().enumerate() {
            worker.backends.push(build_backend(id, bc));
        }
        for be in worker.backends.iter_mut() {
            lb::init_backend(be);
        }

        let backend_idx = |name: &str| -> Option<usize> {
            cfg.backend.iter().position(|b| b.name == name)
        };
        for (id, fc) in cfg.frontend.iter().enumerate() {
            let mut fe = build_frontend(id, fc, cfg.global.grace, &backend_idx);
            for (li, addr) in fc.bind.iter().enumerate() {
                let mut listener = Listener::new(*addr, fc.backlog);
                listener.bind().map_err(|source| Error::Bind {
                    addr: addr.to_string(),
                    source,
                })?;
                listener.enable(&mut worker.poller, id, li);
                fe.listeners.push(listener);
            }
            fe.mgmt_task = Some(worker.sched.create(TaskKind::Proxy(id)));
            worker.frontends.push(fe);
        }

        if let Some(admin_cfg) = &cfg.admin {
            let fd = if let Some(path) = &admin_cfg.socket {
                let fd = net::unix_listen(path, 16).map_err(|source| Error::Bind {
                    addr: path.display().to_string(),
                    source,
                })?;
                worker.admin_path = Some(path.clone());
                fd
            } else if let Some(addr) = &admin_cfg.tcp {
                net::tcp_listen(*addr, 16).map_err(|source| Error::Bind {
                    addr: addr.to_string(),
                    source,
                })?
            } else {
                -1
            };
            if fd >= 0 {
                worker.poller.register(fd, FdOwner::AdminListener);
                worker.poller.want(fd, FdDir::Read);
                worker.admin_fd = fd;
            }
        }

        info!(
            frontends = worker.frontends.len(),
            backends = worker.backends.len(),
            "worker configured"
        );
        Ok(worker)
    }

    /// Install the process signal handlers and hook the self-pipe into
    /// the poller. Call once, from the process's only worker.
    pub fn install_signals(&mut self) -> Result<()> {
        let queue = SignalQueue::install().map_err(Error::Signals)?;
        self.poller.register(queue.read_fd(), FdOwner::WakePipe);
        self.poller.want(queue.read_fd(), FdDir::Read);
        self.signals = Some(queue);
        Ok(())
    }

    /// Inject a control order programmatically (admin applet, tests).
    pub fn post_signal(&mut self, sig: ProxySignal) {
        match &self.signals {
            Some(q) => q.raise(sig),
            None => self.apply_signal(sig),
        }
    }

    /// Worker has fully drained after a stop order.
    pub fn finished(&self) -> bool {
        (self.stopping || self.hard_stop) && self.sessions.is_empty()
    }

    /// Address the admin applet listens on, if enabled over TCP.
    pub fn admin_addr(&self) -> Option<std::net::SocketAddr> {
        if self.admin_fd < 0 {
            return None;
        }
        net::local_addr(self.admin_fd).ok().flatten()
    }

    #[inline]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Main loop: iterate until a stop order drains the last session.
    pub fn run(&mut self) -> Result<()> {
        info!("worker running");
        while !self.finished() {
            self.run_once()?;
        }
        if let Some(path) = self.admin_path.take() {
            let _ = std::fs::remove_file(path);
        }
        info!("worker exiting");
        Ok(())
    }

    /// One scheduler iteration.
    pub fn run_once(&mut self) -> Result<()> {
        // 1. Deferred signals.
        let sigs = match &self.signals {
            Some(q) => q.drain(),
            None => Vec::new(),
        };
        for sig in sigs {
            self.apply_signal(sig);
        }

        // 2. Run queue.
        let mut budget = TASK_BATCH;
        while budget > 0 {
            let Some((_id, kind, _wake)) = self.sched.pop() else {
                break;
            };
            self.dispatch(kind);
            budget -= 1;
        }

        // 3. Speculative I/O; a second pass batches the first reads of
        // connections accepted in the first one.
        for _ in 0..2 {
            let batch = self.poller.spec_batch();
            if batch.is_empty() {
                break;
            }
            for (fd, dir, owner) in batch {
                let ev = FdEvent {
                    fd,
                    owner,
                    readable: dir == FdDir::Read,
                    writable: dir == FdDir::Write,
                    error: false,
                    hup: false,
                };
                self.handle_event(ev);
            }
        }

        // 4. Kernel wait, bounded by the nearest timer.
        let timeout = self
            .sched
            .timeout_ms(self.clock.now_ms(), MAX_DELAY_MS);
        let events: Vec<FdEvent> = self.poller.wait(timeout)?.to_vec();
        for ev in events {
            self.handle_event(ev);
        }

        // 5. Advance time, collect expired timers.
        self.clock.update();
        self.sched.expire(self.clock.now_ms());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self, kind: TaskKind) {
        match kind {
            TaskKind::Session(sid) => self.process_session(sid),
            TaskKind::Proxy(fe_idx) => self.proxy_manage(fe_idx),
            TaskKind::Admin(aid) => self.admin_process(aid),
        }
    }

    fn handle_event(&mut self, ev: FdEvent) {
        match ev.owner {
            FdOwner::Listener(fe_idx, li) => {
                if ev.readable || ev.error {
                    self.accept_loop(fe_idx, li);
                }
            }
            FdOwner::SessionClient(sid) => self.session_io(sid, true, ev),
            FdOwner::SessionServer(sid) => self.session_io(sid, false, ev),
            FdOwner::AdminListener => self.admin_accept(),
            FdOwner::Admin(aid) => self.admin_io(aid, ev),
            FdOwner::WakePipe => {
                // The pipe is drained with the signal mask; here we only
                // need to stop it from spinning in the SPEC list.
                self.poller.would_block(ev.fd, FdDir::Read);
            }
        }
    }

    fn session_io(&mut self, sid: SlotId, client_side: bool, ev: FdEvent) {
        let Some(mut sess) = self.sessions.take(sid) else {
            return;
        };
        if client_side {
            sess.client_io(ev.readable, ev.writable, ev.error, &mut self.poller);
        } else {
            sess.server_io(ev.readable, ev.writable, ev.error, &mut self.poller);
        }
        let task = sess.task;
        self.sessions.restore(sid, sess);
        self.sched.wake(task, WAKE_IO);
    }

    fn process_session(&mut self, sid: SlotId) {
        let Some(mut sess) = self.sessions.take(sid) else {
            return;
        };
        let mut ctx = SessionCtx {
            clock: &self.clock,
            sched: &mut self.sched,
            poller: &mut self.poller,
            frontends: &mut self.frontends,
            backends: &mut self.backends,
            stopping: self.stopping,
            hard_stop: self.hard_stop,
        };
        let status = sess.process(sid, &mut ctx);
        self.sessions.restore(sid, sess);
        if status == SessionStatus::Closed {
            self.release_session(sid);
        }
    }

    // ------------------------------------------------------------------
    // Accept Path
    // ------------------------------------------------------------------

    fn accept_loop(&mut self, fe_idx: usize, li: usize) {
        let now = self.clock.now();
        for _ in 0..ACCEPT_BATCH {
            let fe = &mut self.frontends[fe_idx];
            if !fe.accepting() {
                return;
            }
            if fe.at_maxconn()
                || (self.global_maxconn != 0
                    && self.sessions.len() as u32 >= self.global_maxconn)
            {
                let mut listeners = std::mem::take(&mut fe.listeners);
                for l in &mut listeners {
                    l.set_full(&mut self.poller);
                }
                self.frontends[fe_idx].listeners = listeners;
                return;
            }
            if fe.rate_limit > 0 {
                let limit = fe.rate_limit;
                let delay = fe.sess_rate.next_event_delay(now, limit);
                if delay > 0 {
                    let mgmt = fe.mgmt_task;
                    let mut listeners = std::mem::take(&mut fe.listeners);
                    for l in &mut listeners {
                        l.set_limited(&mut self.poller);
                    }
                    let fe = &mut self.frontends[fe_idx];
                    fe.listeners = listeners;
                    if let Some(task) = mgmt {
                        let at = self.clock.deadline(tick_add(now, delay));
                        self.sched.set_timer(task, at);
                    }
                    return;
                }
            }

            let lfd = self.frontends[fe_idx].listeners[li].fd;
            match net::accept_stream(lfd) {
                Ok(None) => {
                    self.poller.would_block(lfd, FdDir::Read);
                    return;
                }
                Ok(Some((fd, peer))) => {
                    self.frontends[fe_idx].listeners[li].cum_accepts += 1;
                    self.handle_accept(fe_idx, fd, peer, now);
                }
                Err(e) => {
                    // Out of descriptors or a transient kernel refusal:
                    // never take the worker down for one accept.
                    error!(frontend = fe_idx, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn handle_accept(
        &mut self,
        fe_idx: usize,
        fd: RawFd,
        peer: Option<std::net::SocketAddr>,
        now: crate::ticks::Tick,
    ) {
        let now_ms = self.clock.now_ms();
        let fe = &mut self.frontends[fe_idx];
        fe.counters.cum_conn += 1;
        fe.sess_rate.add(now, 1);
        let rate = fe.sess_rate.events_per_sec(now);
        fe.counters.note_rate(rate);

        let verdict = rules::eval_connection_rules(&fe.conn_rules, peer.as_ref());
        if verdict == RuleVerdict::Reject {
            fe.counters.denied_conn += 1;
            net::close_fd(fd);
            return;
        }
        let tarpit = verdict == RuleVerdict::Tarpit;
        if tarpit {
            fe.counters.denied_conn += 1;
        }

        fe.feconn += 1;
        let feconn = fe.feconn;
        fe.counters.note_conn(feconn);
        if fe.nodelay {
            let _ = net::set_nodelay(fd, true);
        }
        let timeout_client = fe.timeout_client;

        let placeholder = SlotId::from_raw(u32::MAX, u32::MAX);
        let sid = self.sessions.insert(Session::new(
            fd,
            peer,
            fe_idx,
            timeout_client,
            0,
            now,
            now_ms,
            placeholder,
        ));
        let task = self.sched.create(TaskKind::Session(sid));
        {
            let sess = self.sessions.get_mut(sid).expect("fresh session");
            sess.task = task;
            if tarpit {
                sess.flags |= SN_TARPIT;
                sess.analysers = 0;
            }
        }
        self.poller.register(fd, FdOwner::SessionClient(sid));
        self.poller.want(fd, FdDir::Read);
        self.sched.wake(task, WAKE_INIT);
        debug!(frontend = fe_idx, peer = ?peer, "session accepted");
    }

    // ------------------------------------------------------------------
    // Session Release
    // ------------------------------------------------------------------

    fn release_session(&mut self, sid: SlotId) {
        let Some(mut sess) = self.sessions.remove(sid) else {
            return;
        };
        let now_ms = self.clock.now_ms();
        sess.t_close = Some(now_ms);

        let fe = &mut self.frontends[sess.frontend];
        fe.feconn -= 1;
        fe.counters.bytes_in += sess.req.total();
        fe.counters.bytes_out += sess.rep.total();
        if sess.err_class != ErrClass::None {
            let cause = format!(
                "{}/{}",
                sess.err_class.label(),
                sess.fin.map(|f| f.label()).unwrap_or("-")
            );
            fe.errors
                .capture(now_ms, cause, sess.peer, sess.req.data());
        }

        let mut promo: Option<(SlotId, usize, usize)> = None;
        if let Some(be_idx) = sess.backend {
            if let Some(at) = sess.queued_at.take() {
                queue::remove_pending(&mut self.backends[be_idx], at, sid);
            }
            let be = &mut self.backends[be_idx];
            be.beconn -= 1;
            be.counters.bytes_in += sess.req.total();
            be.counters.bytes_out += sess.rep.total();
            if let Some(h) = sess.srv {
                let valid = be.servers.get(h.index).map(|s| s.uid) == Some(h.uid);
                if valid && sess.served_counted {
                    lb::server_drop_conn(be, h.index);
                    sess.served_counted = false;
                    let srv = &mut be.servers[h.index];
                    srv.counters.bytes_in += sess.req.total();
                    srv.counters.bytes_out += sess.rep.total();
                    let dyn_max =
                        queue::dynamic_maxconn(&be.servers[h.index], be.beconn, be.fullconn);
                    if be.servers[h.index].usable()
                        && !be.servers[h.index].at_capacity(dyn_max)
                    {
                        if let Some((next_sid, _)) = queue::next_pending(be, h.index) {
                            promo = Some((next_sid, be_idx, h.index));
                        }
                    }
                }
            }
        }
        if let Some((next_sid, be_idx, srv_idx)) = promo {
            let handle = self.backends[be_idx].servers[srv_idx].handle(be_idx, srv_idx);
            if let Some(next) = self.sessions.get_mut(next_sid) {
                next.assign_from_queue(handle);
                let task = next.task;
                self.sched.wake(task, WAKE_MSG);
            }
        }

        if sess.cli.fd >= 0 {
            self.poller.remove(sess.cli.fd);
            net::close_fd(sess.cli.fd);
        }
        if sess.srv_si.fd >= 0 {
            self.poller.remove(sess.srv_si.fd);
            net::close_fd(sess.srv_si.fd);
        }
        self.sched.remove(sess.task);

        // Whatever was throttled by connection counts may resume.
        self.resume_full_listeners();

        debug!(
            frontend = sess.frontend,
            class = sess.err_class.label(),
            fin = sess.fin.map(|f| f.label()).unwrap_or("-"),
            bytes_in = sess.req.total(),
            bytes_out = sess.rep.total(),
            t_queue = sess.t_queue,
            "session closed"
        );
    }

    fn resume_full_listeners(&mut self) {
        let under_global = self.global_maxconn == 0
            || (self.sessions.len() as u32) < self.global_maxconn;
        if !under_global {
            return;
        }
        for fe_idx in 0..self.frontends.len() {
            let fe = &mut self.frontends[fe_idx];
            if !fe.accepting() || fe.at_maxconn() {
                continue;
            }
            let mut listeners = std::mem::take(&mut fe.listeners);
            for l in &mut listeners {
                if l.state == ListenerState::Full {
                    l.resume(&mut self.poller);
                }
            }
            self.frontends[fe_idx].listeners = listeners;
        }
    }

    // ------------------------------------------------------------------
    // Frontend Management Task
    // ------------------------------------------------------------------

    fn proxy_manage(&mut self, fe_idx: usize) {
        let now = self.clock.now();

        // Rate-limit resume.
        let fe = &mut self.frontends[fe_idx];
        if fe.accepting() && fe.rate_limit > 0 {
            let limit = fe.rate_limit;
            let delay = fe.sess_rate.next_event_delay(now, limit);
            let mgmt = fe.mgmt_task;
            if delay == 0 {
                let mut listeners = std::mem::take(&mut fe.listeners);
                for l in &mut listeners {
                    if l.state == ListenerState::Limited {
                        l.resume(&mut self.poller);
                    }
                }
                self.frontends[fe_idx].listeners = listeners;
            } else if let Some(task) = mgmt {
                let at = self.clock.deadline(tick_add(now, delay));
                self.sched.set_timer(task, at);
            }
        }

        // Grace expiry after a soft stop.
        let fe = &mut self.frontends[fe_idx];
        if let Some(stop) = fe.stop_time {
            if tick_is_expired(stop, now) {
                fe.stop_time = None;
                let mut listeners = std::mem::take(&mut fe.listeners);
                for l in &mut listeners {
                    l.unbind(&mut self.poller);
                }
                self.frontends[fe_idx].listeners = listeners;
                warn!(frontend = fe_idx, "grace expired, closing remaining sessions");
                self.force_close_frontend(fe_idx);
            } else if let Some(task) = fe.mgmt_task {
                let at = self.clock.deadline(stop);
                self.sched.set_timer(task, at);
            }
        }
    }

    fn force_close_frontend(&mut self, fe_idx: usize) {
        for sid in self.sessions.ids() {
            let Some(mut sess) = self.sessions.take(sid) else {
                continue;
            };
            if sess.frontend != fe_idx || sess.is_closed() {
                self.sessions.restore(sid, sess);
                continue;
            }
            let class = if sess.srv_si.state == SiState::Est {
                ErrClass::SrvCl
            } else {
                ErrClass::CliCl
            };
            let fin = if sess.established {
                FinState::D
            } else {
                FinState::R
            };
            // Leave any queue before tearing down.
            if let (Some(at), Some(be_idx)) = (sess.queued_at.take(), sess.backend) {
                queue::remove_pending(&mut self.backends[be_idx], at, sid);
            }
            sess.terminate(class, fin);
            self.sessions.restore(sid, sess);
            self.release_session(sid);
        }
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    fn apply_signal(&mut self, sig: ProxySignal) {
        match sig {
            ProxySignal::SoftStop => self.soft_stop(),
            ProxySignal::Pause => self.pause_listeners(),
            ProxySignal::Resume => self.resume_listeners(),
            ProxySignal::HardStop => self.hard_stop_now(),
            ProxySignal::Broadcast => self.broadcast_manage(),
        }
    }

    /// Wake every frontend management task immediately.
    fn broadcast_manage(&mut self) {
        for fe_idx in 0..self.frontends.len() {
            if let Some(task) = self.frontends[fe_idx].mgmt_task {
                self.sched.wake(task, WAKE_MSG);
            }
        }
    }

    fn soft_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        info!("soft stop: draining sessions");
        let now = self.clock.now();
        for fe_idx in 0..self.frontends.len() {
            let fe = &mut self.frontends[fe_idx];
            fe.state = ProxyState::Stopped;
            let grace = fe.grace_ms;
            let mgmt = fe.mgmt_task;
            let mut listeners = std::mem::take(&mut fe.listeners);
            if grace == 0 {
                for l in &mut listeners {
                    l.unbind(&mut self.poller);
                }
            } else {
                for l in &mut listeners {
                    l.pause(&mut self.poller);
                }
            }
            let fe = &mut self.frontends[fe_idx];
            fe.listeners = listeners;
            if grace != 0 {
                fe.stop_time = Some(tick_add(now, grace));
                if let Some(task) = mgmt {
                    let at = self.clock.deadline(tick_add(now, grace));
                    self.sched.set_timer(task, at);
                }
            }
        }
    }

    fn pause_listeners(&mut self) {
        if self.stopping {
            return;
        }
        info!("pausing listeners");
        for fe_idx in 0..self.frontends.len() {
            self.frontends[fe_idx].state = ProxyState::Paused;
            let mut listeners = std::mem::take(&mut self.frontends[fe_idx].listeners);
            for l in &mut listeners {
                l.pause(&mut self.poller);
            }
            self.frontends[fe_idx].listeners = listeners;
        }
    }

    fn resume_listeners(&mut self) {
        if self.stopping {
            return;
        }
        info!("resuming listeners");
        for fe_idx in 0..self.frontends.len() {
            self.frontends[fe_idx].state = ProxyState::Ready;
            let mut listeners = std::mem::take(&mut self.frontends[fe_idx].listeners);
            for l in &mut listeners {
                l.resume(&mut self.poller);
            }
            self.frontends[fe_idx].listeners = listeners;
        }
    }

    fn hard_stop_now(&mut self) {
        info!("hard stop: terminating all sessions");
        self.stopping = true;
        self.hard_stop = true;
        for fe_idx in 0..self.frontends.len() {
            self.frontends[fe_idx].state = ProxyState::Stopped;
            self.frontends[fe_idx].stop_time = None;
            let mut listeners = std::mem::take(&mut self.frontends[fe_idx].listeners);
            for l in &mut listeners {
                l.unbind(&mut self.poller);
            }
            self.frontends[fe_idx].listeners = listeners;
        }
        for sid in self.sessions.ids() {
            if let Some(sess) = self.sessions.get(sid) {
                let task = sess.task;
                self.sched.wake(task, WAKE_MSG);
            }
        }
    }

    // ------------------------------------------------------------------
    // Admin Applet
    // ------------------------------------------------------------------

    fn admin_accept(&mut self) {
        loop {
            match net::accept_stream(self.admin_fd) {
                Ok(Some((fd, _peer))) => {
                    let placeholder = SlotId::from_raw(u32::MAX, u32::MAX);
                    let aid = self.admin_conns.insert(AdminConn::new(fd, placeholder));
                    let task = self.sched.create(TaskKind::Admin(aid));
                    self.admin_conns.get_mut(aid).expect("fresh conn").task = task;
                    self.poller.register(fd, FdOwner::Admin(aid));
                    self.poller.want(fd, FdDir::Read);
                }
                Ok(None) => {
                    self.poller.would_block(self.admin_fd, FdDir::Read);
                    return;
                }
                Err(e) => {
                    error!(error = %e, "admin accept failed");
                    return;
                }
            }
        }
    }

    fn admin_io(&mut self, aid: SlotId, ev: FdEvent) {
        let Some(mut conn) = self.admin_conns.take(aid) else {
            return;
        };
        let mut alive = !ev.error;
        if alive && ev.readable {
            alive = conn.read_input(&mut self.poller);
        }
        if alive && ev.writable && conn.has_output() {
            alive = conn.flush(&mut self.poller);
        }
        let task = conn.task;
        self.admin_conns.restore(aid, conn);
        if alive {
            self.sched.wake(task, WAKE_MSG);
        } else {
            self.admin_release(aid);
        }
    }

    fn admin_process(&mut self, aid: SlotId) {
        let Some(mut conn) = self.admin_conns.take(aid) else {
            return;
        };
        for line in conn.take_lines() {
            let mut ctx = AdminCtx {
                backends: &mut self.backends,
                clock: &self.clock,
            };
            let response = admin::execute(&line, &mut ctx);
            conn.push_response(response);
        }
        let alive = conn.flush(&mut self.poller);
        self.admin_conns.restore(aid, conn);
        if !alive {
            self.admin_release(aid);
        }
    }

    fn admin_release(&mut self, aid: SlotId) {
        if let Some(conn) = self.admin_conns.remove(aid) {
            self.poller.remove(conn.fd);
            net::close_fd(conn.fd);
            self.sched.remove(conn.task);
        }
    }
}

// ============================================================================
// Configuration Translation
// ============================================================================

fn ms32(ms: u64) -> u32 {
    ms.min(u32::MAX as u64 - 1) as u32
}

fn build_balance(balance: &BalanceConfig) -> LbState {
    match balance {
        BalanceConfig::Roundrobin => LbState::new_roundrobin(),
        BalanceConfig::Leastconn => LbState::new_leastconn(),
        BalanceConfig::StaticRr => LbState::new_static(),
        BalanceConfig::Source => LbState::new_chash(HashSource::SrcAddr),
        BalanceConfig::Uri => LbState::new_chash(HashSource::Uri),
        BalanceConfig::UrlParam { param } => {
            LbState::new_chash(HashSource::UrlParam(param.clone()))
        }
        BalanceConfig::Hdr { header } => LbState::new_chash(HashSource::Header(header.clone())),
        BalanceConfig::RdpCookie { cookie } => {
            LbState::new_chash(HashSource::RdpCookie(cookie.clone()))
        }
    }
}

fn build_cond(cond: &CondConfig) -> RuleCond {
    match cond {
        CondConfig::Always => RuleCond::Always,
        CondConfig::SrcIp { blocks } => RuleCond::SrcIp(
            blocks
                .iter()
                .map(|b| {
                    // Validation already proved these parse.
                    let (ip, prefix) = gantry_config::validation::parse_cidr(b)
                        .expect("validated CIDR");
                    IpNet::new(ip, prefix)
                })
                .collect(),
        ),
        CondConfig::PayloadLen { at_least } => RuleCond::PayloadLenAtLeast(*at_least),
        CondConfig::PayloadPrefix { prefix } => {
            RuleCond::PayloadPrefix(prefix.as_bytes().to_vec())
        }
    }
}

fn build_rules(rules: &[RuleConfig]) -> Vec<TcpRule> {
    rules
        .iter()
        .map(|r| TcpRule {
            cond: build_cond(&r.cond),
            action: match r.action {
                RuleActionConfig::Accept => RuleAction::Accept,
                RuleActionConfig::Reject => RuleAction::Reject,
                RuleActionConfig::Tarpit => RuleAction::Tarpit,
            },
        })
        .collect()
}

fn build_switches(
    rules: &[SwitchConfig],
    backend_idx: &dyn Fn(&str) -> Option<usize>,
) -> Vec<SwitchRule> {
    rules
        .iter()
        .map(|r| SwitchRule {
            cond: build_cond(&r.cond),
            backend: backend_idx(&r.backend).expect("validated backend reference"),
        })
        .collect()
}

fn build_backend(id: usize, bc: &gantry_config::BackendConfig) -> Backend {
    let mut be = Backend::new(&bc.name, id, build_balance(&bc.balance));
    be.fullconn = bc.fullconn;
    be.timeout_connect = ms32(bc.timeout_connect);
    be.timeout_server = ms32(bc.timeout_server);
    be.timeout_queue = ms32(bc.timeout_queue);
    be.retries = bc.retries;
    be.redispatch = bc.redispatch;
    be.abortonclose = bc.abortonclose;
    be.allbackups = bc.allbackups;
    be.independent_streams = bc.independent_streams;
    for sc in &bc.server {
        let uid = be.alloc_srv_uid();
        let mut srv = Server::new(&sc.name, uid, sc.addr, sc.weight);
        srv.maxconn = sc.maxconn;
        srv.backup = sc.backup;
        if sc.disabled {
            srv.state = SrvState::Maintenance;
            srv.prev_state = SrvState::Maintenance;
        }
        if let Some(check) = &sc.check {
            srv.check = crate::server::CheckParams {
                enabled: check.enabled,
                addr: check.addr,
                port: check.port,
                inter_ms: ms32(check.inter),
                rise: check.rise,
                fall: check.fall,
            };
        }
        be.servers.push(srv);
    }
    be
}

fn build_frontend(
    id: usize,
    fc: &gantry_config::FrontendConfig,
    global_grace: u64,
    backend_idx: &dyn Fn(&str) -> Option<usize>,
) -> Frontend {
    let mut fe = Frontend::new(&fc.name, id);
    fe.maxconn = fc.maxconn;
    fe.rate_limit = fc.rate_limit_sessions;
    fe.default_backend = fc
        .default_backend
        .as_deref()
        .and_then(|name| backend_idx(name));
    fe.timeout_client = ms32(fc.timeout_client);
    fe.timeout_tarpit = ms32(fc.timeout_tarpit);
    fe.inspect_delay = ms32(fc.inspect_delay);
    fe.nodelay = fc.nodelay;
    fe.grace_ms = ms32(fc.grace.unwrap_or(global_grace));
    fe.conn_rules = build_rules(&fc.tcp_request_connection);
    fe.content_rules = build_rules(&fc.tcp_request_content);
    fe.switch_rules = build_switches(&fc.use_backend, backend_idx);
    fe
}

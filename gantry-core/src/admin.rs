//! Admin applet.
//!
//! A line-oriented control channel served over a Unix or TCP stream
//! socket inside the event loop. Each input line is one command; each
//! response is one JSON object on its own line, so both humans with
//! `socat` and tooling can drive it.
//!
//! Server transitions ordered here run between scheduler iterations like
//! any other task, never in the middle of a load-balancer selection.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use serde_json::json;
use tracing::info;

use crate::fd::FdDir;
use crate::lb;
use crate::net::{self, ReadStatus, WriteStatus};
use crate::proxy::Backend;
use crate::server::{CheckParams, Server, SrvState};
use crate::task::TaskId;
use crate::ticks::Clock;

/// Largest accepted command line; anything longer closes the connection.
const MAX_LINE: usize = 4096;

// ============================================================================
// Connection
// ============================================================================

/// One accepted admin connection.
pub struct AdminConn {
    pub fd: RawFd,
    pub task: TaskId,
    inbuf: Vec<u8>,
    out: Vec<u8>,
}

impl AdminConn {
    pub fn new(fd: RawFd, task: TaskId) -> Self {
        Self {
            fd,
            task,
            inbuf: Vec::new(),
            out: Vec::new(),
        }
    }

    /// Pull whatever the peer sent. Returns false when the peer is gone.
    pub fn read_input(&mut self, poller: &mut crate::poller::Poller) -> bool {
        let mut buf = crate::buffer::Buffer::new(1024);
        loop {
            match net::read_to_buffer(self.fd, &mut buf) {
                Ok(ReadStatus::Data(_)) => {
                    self.inbuf.extend_from_slice(buf.data());
                    buf.clear();
                    if self.inbuf.len() > MAX_LINE {
                        return false;
                    }
                }
                Ok(ReadStatus::WouldBlock) => {
                    poller.would_block(self.fd, FdDir::Read);
                    return true;
                }
                Ok(ReadStatus::Eof) | Err(_) => return false,
            }
        }
    }

    /// Complete lines received so far.
    pub fn take_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.inbuf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.inbuf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    pub fn push_response(&mut self, json_line: String) {
        self.out.extend_from_slice(json_line.as_bytes());
        self.out.push(b'\n');
    }

    /// Write as much buffered output as the socket accepts.
    pub fn flush(&mut self, poller: &mut crate::poller::Poller) -> bool {
        while !self.out.is_empty() {
            match net::write_slice(self.fd, &self.out) {
                Ok(WriteStatus::Data(n)) => {
                    self.out.drain(..n);
                }
                Ok(WriteStatus::WouldBlock) => {
                    poller.would_block(self.fd, FdDir::Write);
                    poller.want(self.fd, FdDir::Write);
                    return true;
                }
                Err(_) => return false,
            }
        }
        poller.stop(self.fd, FdDir::Write);
        true
    }

    #[inline]
    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }
}

// ============================================================================
// Command Execution
// ============================================================================

/// Worker state the commands may touch.
pub struct AdminCtx<'a> {
    pub backends: &'a mut Vec<Backend>,
    pub clock: &'a Clock,
}

fn err(msg: impl std::fmt::Display) -> String {
    json!({"ok": false, "error": msg.to_string()}).to_string()
}

/// Execute one command line and render the response.
pub fn execute(line: &str, ctx: &mut AdminCtx<'_>) -> String {
    let mut parts = line.split_whitespace();
    let cmd = match parts.next() {
        Some(c) => c,
        None => return err("empty command"),
    };
    let args: Vec<&str> = parts.collect();
    match cmd {
        "version" => json!({
            "ok": true,
            "version": env!("CARGO_PKG_VERSION"),
            "api": "pool.v1",
        })
        .to_string(),
        "pool.add" => cmd_add(&args, ctx),
        "pool.disable" => cmd_set_state(&args, ctx, SrvState::Maintenance),
        "pool.enable" => cmd_set_state(&args, ctx, SrvState::Running),
        "pool.weight" => cmd_weight(&args, ctx),
        "pool.status" => cmd_status(&args, ctx),
        "pool.contents" => cmd_contents(&args, ctx),
        "pool.errors" => cmd_errors(&args, ctx),
        "pool.remove" => err("unsupported command: servers cannot be removed at runtime"),
        other => err(format!("unknown command '{other}'")),
    }
}

fn find_backend<'a>(
    backends: &'a mut Vec<Backend>,
    name: &str,
) -> Result<&'a mut Backend, String> {
    backends
        .iter_mut()
        .find(|be| be.name == name)
        .ok_or_else(|| format!("unknown backend '{name}'"))
}

fn find_server(be: &Backend, name: &str) -> Result<usize, String> {
    be.server_named(name)
        .ok_or_else(|| format!("unknown server '{}/{name}'", be.name))
}

fn cmd_add(args: &[&str], ctx: &mut AdminCtx<'_>) -> String {
    let [backend, name, addr, opts @ ..] = args else {
        return err("usage: pool.add <backend> <name> <addr:port> [options]");
    };
    let addr: SocketAddr = match addr.parse() {
        Ok(a) => a,
        Err(_) => return err(format!("bad address '{addr}'")),
    };
    let be = match find_backend(ctx.backends, backend) {
        Ok(be) => be,
        Err(e) => return err(e),
    };
    if be.server_named(name).is_some() {
        return err(format!("server '{backend}/{name}' already exists"));
    }

    let mut weight: u32 = 1;
    let mut maxconn: u32 = 0;
    let mut backup = false;
    let mut disabled = false;
    let mut check = CheckParams::default();
    for opt in opts {
        let (key, value) = match opt.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (*opt, None),
        };
        let parsed = match (key, value) {
            ("backup", None) => {
                backup = true;
                Ok(())
            }
            ("disabled", None) => {
                disabled = true;
                Ok(())
            }
            ("check", None) => {
                check.enabled = true;
                Ok(())
            }
            ("weight", Some(v)) => v.parse().map(|w| weight = w).map_err(|_| key),
            ("maxconn", Some(v)) => v.parse().map(|m| maxconn = m).map_err(|_| key),
            ("check.addr", Some(v)) => v.parse().map(|a| check.addr = Some(a)).map_err(|_| key),
            ("check.port", Some(v)) => v.parse().map(|p| check.port = Some(p)).map_err(|_| key),
            ("inter", Some(v)) => v.parse().map(|i| check.inter_ms = i).map_err(|_| key),
            ("rise", Some(v)) => v.parse().map(|r| check.rise = r).map_err(|_| key),
            ("fall", Some(v)) => v.parse().map(|f| check.fall = f).map_err(|_| key),
            _ => Err(key),
        };
        if let Err(key) = parsed {
            return err(format!("bad option '{key}'"));
        }
    }

    let uid = be.alloc_srv_uid();
    let mut srv = Server::new(*name, uid, addr, weight);
    srv.maxconn = maxconn;
    srv.backup = backup;
    srv.check = check;
    if disabled {
        srv.state = SrvState::Maintenance;
    }
    be.servers.push(srv);
    let idx = be.servers.len() - 1;
    lb::server_added(be, idx);
    info!(backend, server = name, %addr, weight, "server added");
    json!({"ok": true, "backend": backend, "server": name, "uid": uid}).to_string()
}

fn cmd_set_state(args: &[&str], ctx: &mut AdminCtx<'_>, state: SrvState) -> String {
    let [backend, server] = args else {
        return err("usage: pool.<enable|disable> <backend> <server>");
    };
    let be = match find_backend(ctx.backends, backend) {
        Ok(be) => be,
        Err(e) => return err(e),
    };
    let idx = match find_server(be, server) {
        Ok(i) => i,
        Err(e) => return err(e),
    };
    lb::set_server_state(be, idx, state);
    info!(backend, server, state = state.label(), "server state set");
    json!({"ok": true, "backend": backend, "server": server, "state": state.label()})
        .to_string()
}

fn cmd_weight(args: &[&str], ctx: &mut AdminCtx<'_>) -> String {
    let [backend, server, weight] = args else {
        return err("usage: pool.weight <backend> <server> <weight>");
    };
    let weight: u32 = match weight.parse() {
        Ok(w) if w <= crate::server::UWEIGHT_MAX => w,
        _ => return err("weight must be 0..=256"),
    };
    let be = match find_backend(ctx.backends, backend) {
        Ok(be) => be,
        Err(e) => return err(e),
    };
    let idx = match find_server(be, server) {
        Ok(i) => i,
        Err(e) => return err(e),
    };
    lb::set_server_weight(be, idx, weight);
    info!(backend, server, weight, "server weight set");
    json!({"ok": true, "backend": backend, "server": server, "weight": weight}).to_string()
}

fn server_json(be: &Backend, idx: usize) -> serde_json::Value {
    let s = &be.servers[idx];
    json!({
        "name": s.name,
        "uid": s.uid,
        "addr": s.addr.to_string(),
        "state": s.state.label(),
        "backup": s.backup,
        "weight": s.eweight / be.wdiv.max(1),
        "served": s.served,
        "maxconn": s.maxconn,
        "pending": s.nbpend(),
        "cum_sess": s.counters.cum_sess,
        "failed_conns": s.counters.failed_conns,
    })
}

fn cmd_status(args: &[&str], ctx: &mut AdminCtx<'_>) -> String {
    let [backend, server] = args else {
        return err("usage: pool.status <backend> <server>");
    };
    let be = match find_backend(ctx.backends, backend) {
        Ok(be) => be,
        Err(e) => return err(e),
    };
    let idx = match find_server(be, server) {
        Ok(i) => i,
        Err(e) => return err(e),
    };
    let mut body = json!({"ok": true, "backend": backend});
    body["server"] = server_json(be, idx);
    body.to_string()
}

fn cmd_contents(args: &[&str], ctx: &mut AdminCtx<'_>) -> String {
    let [backend] = args else {
        return err("usage: pool.contents <backend>");
    };
    let be = match find_backend(ctx.backends, backend) {
        Ok(be) => be,
        Err(e) => return err(e),
    };
    let servers: Vec<serde_json::Value> =
        (0..be.servers.len()).map(|i| server_json(be, i)).collect();
    json!({
        "ok": true,
        "backend": backend,
        "beconn": be.beconn,
        "queued": be.nbpend(),
        "srv_act": be.srv_act,
        "srv_bck": be.srv_bck,
        "servers": servers,
    })
    .to_string()
}

fn cmd_errors(args: &[&str], ctx: &mut AdminCtx<'_>) -> String {
    let [backend] = args else {
        return err("usage: pool.errors <backend>");
    };
    let be = match find_backend(ctx.backends, backend) {
        Ok(be) => be,
        Err(e) => return err(e),
    };
    let errors: Vec<serde_json::Value> = be
        .errors
        .iter()
        .map(|snap| {
            json!({
                "when_ms": snap.when_ms,
                "cause": snap.cause,
                "peer": snap.peer.map(|p| p.to_string()),
                "excerpt": String::from_utf8_lossy(&snap.excerpt),
            })
        })
        .collect();
    json!({"ok": true, "backend": backend, "errors": errors}).to_string()
}

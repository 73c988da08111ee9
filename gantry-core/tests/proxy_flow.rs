//! End-to-end forwarding scenarios.
//!
//! Each test stands up real backend listeners on ephemeral ports, builds
//! a worker from a rendered configuration, and drives it iteration by
//! iteration while plain blocking clients run in helper threads.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gantry_config::ConfigLoader;
use gantry_core::lb;
use gantry_core::server::SrvState;
use gantry_core::{ProxySignal, Worker};

// ============================================================================
// Harness
// ============================================================================

/// A backend that answers "pong" and closes once the client is done.
struct EchoBackend {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

fn spawn_echo() -> EchoBackend {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let thread_hits = hits.clone();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread_hits.fetch_add(1, Ordering::SeqCst);
            std::thread::spawn(move || {
                let mut buf = [0u8; 512];
                // Consume the request until the client half-closes.
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(_) => return,
                    }
                }
                let _ = stream.write_all(b"pong");
                let _ = stream.shutdown(Shutdown::Write);
            });
        }
    });
    EchoBackend { addr, hits }
}

/// A backend that accepts and holds the connection until the client
/// closes, never sending anything.
fn spawn_holder() -> EchoBackend {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let thread_hits = hits.clone();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread_hits.fetch_add(1, Ordering::SeqCst);
            std::thread::spawn(move || {
                let mut buf = [0u8; 512];
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });
    EchoBackend { addr, hits }
}

/// An address that refuses connections: port 1 needs privileges to bind,
/// so nothing listens there and connects fail immediately.
fn refused_addr() -> SocketAddr {
    "127.0.0.1:1".parse().unwrap()
}

fn worker_from(toml: &str) -> Worker {
    let cfg = ConfigLoader::load_str(toml).unwrap();
    Worker::from_config(&cfg).unwrap()
}

fn front_addr(worker: &Worker) -> SocketAddr {
    worker.frontends[0].listeners[0].addr
}

/// Drive the worker until the predicate holds or the deadline passes.
fn spin(worker: &mut Worker, deadline: Duration, mut pred: impl FnMut(&Worker) -> bool) -> bool {
    let start = Instant::now();
    loop {
        if pred(worker) {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        worker.run_once().unwrap();
    }
}

/// One blocking ping/pong exchange through the proxy.
fn run_client(worker: &mut Worker, addr: SocketAddr) -> Vec<u8> {
    let client = std::thread::spawn(move || {
        let mut c = TcpStream::connect(addr).unwrap();
        c.write_all(b"ping").unwrap();
        c.shutdown(Shutdown::Write).unwrap();
        let mut buf = Vec::new();
        c.read_to_end(&mut buf).unwrap();
        buf
    });
    assert!(
        spin(worker, Duration::from_secs(10), |_| client.is_finished()),
        "client did not finish"
    );
    let out = client.join().unwrap();
    assert!(
        spin(worker, Duration::from_secs(5), |w| w.session_count() == 0),
        "session did not close"
    );
    out
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_simple_proxy_round_robin() {
    let a = spawn_echo();
    let b = spawn_echo();
    let mut worker = worker_from(&format!(
        r#"
        [[frontend]]
        name = "fe"
        bind = ["127.0.0.1:0"]
        maxconn = 10
        default-backend = "pool"
        timeout-client = 10000

        [[backend]]
        name = "pool"
        timeout-connect = 3000
        timeout-server = 10000

        [[backend.server]]
        name = "a"
        addr = "{}"

        [[backend.server]]
        name = "b"
        addr = "{}"
        "#,
        a.addr, b.addr
    ));
    let front = front_addr(&worker);

    for _ in 0..20 {
        let reply = run_client(&mut worker, front);
        assert_eq!(reply, b"pong");
    }
    assert_eq!(a.hits.load(Ordering::SeqCst), 10);
    assert_eq!(b.hits.load(Ordering::SeqCst), 10);
    assert_eq!(worker.backends[0].counters.cum_sess, 20);
    assert_eq!(worker.frontends[0].counters.cum_conn, 20);
    // Clean closes: no error snapshots captured.
    assert!(worker.frontends[0].errors.is_empty());
}

#[test]
fn test_server_down_mid_flight() {
    let a = spawn_echo();
    let b = spawn_echo();
    let c = spawn_echo();
    let mut worker = worker_from(&format!(
        r#"
        [[frontend]]
        name = "fe"
        bind = ["127.0.0.1:0"]
        default-backend = "pool"
        timeout-client = 10000

        [[backend]]
        name = "pool"
        timeout-connect = 3000
        timeout-server = 10000

        [[backend.server]]
        name = "a"
        addr = "{}"
        weight = 2

        [[backend.server]]
        name = "b"
        addr = "{}"

        [[backend.server]]
        name = "c"
        addr = "{}"
        "#,
        a.addr, b.addr, c.addr
    ));
    let front = front_addr(&worker);

    for _ in 0..8 {
        run_client(&mut worker, front);
    }
    let b_before = b.hits.load(Ordering::SeqCst);
    assert!(b_before > 0);

    // The transition applies between iterations, never mid-selection.
    lb::set_server_state(&mut worker.backends[0], 1, SrvState::DownByCheck);

    for _ in 0..12 {
        run_client(&mut worker, front);
    }
    assert_eq!(b.hits.load(Ordering::SeqCst), b_before);
    let a_after = a.hits.load(Ordering::SeqCst);
    let c_after = c.hits.load(Ordering::SeqCst);
    // All 20 sessions accounted for, the 12 post-transition ones split
    // 2:1 over a and c with one pass of slack.
    assert_eq!(a_after + c_after + b_before, 20);
    assert!((11..=13).contains(&a_after), "a={a_after} c={c_after}");
    assert_eq!(worker.backends[0].servers[1].served, 0);
}

#[test]
fn test_saturation_queues_third_session() {
    let holder = spawn_holder();
    let mut worker = worker_from(&format!(
        r#"
        [[frontend]]
        name = "fe"
        bind = ["127.0.0.1:0"]
        default-backend = "pool"
        timeout-client = 30000

        [[backend]]
        name = "pool"
        timeout-connect = 3000
        timeout-queue = 30000

        [[backend.server]]
        name = "only"
        addr = "{}"
        maxconn = 2
        "#,
        holder.addr
    ));
    let front = front_addr(&worker);

    let c0 = TcpStream::connect(front).unwrap();
    let c1 = TcpStream::connect(front).unwrap();
    let c2 = TcpStream::connect(front).unwrap();

    assert!(
        spin(&mut worker, Duration::from_secs(5), |w| {
            w.backends[0].servers[0].served == 2 && w.backends[0].nbpend() == 1
        }),
        "third session never queued: served={} nbpend={}",
        worker.backends[0].servers[0].served,
        worker.backends[0].nbpend()
    );
    assert_eq!(holder.hits.load(Ordering::SeqCst), 2);
    // Conservation: routed sessions are either served or queued.
    let be = &worker.backends[0];
    assert_eq!(
        be.beconn,
        be.servers[0].served + be.total_pending() as u32
    );

    // Releasing one slot promotes the queued session.
    drop(c0);
    assert!(
        spin(&mut worker, Duration::from_secs(5), |w| {
            w.backends[0].nbpend() == 0
                && w.backends[0].servers[0].served == 2
                && w.session_count() == 2
        }),
        "queued session was not promoted"
    );
    assert_eq!(holder.hits.load(Ordering::SeqCst), 3);

    drop(c1);
    drop(c2);
    assert!(spin(&mut worker, Duration::from_secs(5), |w| w
        .session_count()
        == 0));
}

#[test]
fn test_connect_failure_redispatch() {
    let dead = refused_addr();
    let live = spawn_echo();
    let mut worker = worker_from(&format!(
        r#"
        [[frontend]]
        name = "fe"
        bind = ["127.0.0.1:0"]
        default-backend = "pool"
        timeout-client = 30000

        [[backend]]
        name = "pool"
        timeout-connect = 300
        timeout-server = 10000
        retries = 2
        redispatch = true

        [[backend.server]]
        name = "dead"
        addr = "{}"
        weight = 256

        [[backend.server]]
        name = "live"
        addr = "{}"
        weight = 1
        "#,
        dead, live.addr
    ));
    let front = front_addr(&worker);

    // The heavy weight forces the first pick onto the dead server; after
    // the retries burn down, redispatch lands on the live one.
    let reply = run_client(&mut worker, front);
    assert_eq!(reply, b"pong");
    assert_eq!(live.hits.load(Ordering::SeqCst), 1);
    let be = &worker.backends[0];
    assert_eq!(be.counters.redispatches, 1);
    assert!(be.counters.retries >= 1);
    assert!(be.servers[0].counters.failed_conns >= 2);
    assert_eq!(be.servers[0].served, 0);
}

#[test]
fn test_weight_change_under_traffic() {
    let a = spawn_echo();
    let b = spawn_echo();
    let mut worker = worker_from(&format!(
        r#"
        [[frontend]]
        name = "fe"
        bind = ["127.0.0.1:0"]
        default-backend = "pool"
        timeout-client = 10000

        [[backend]]
        name = "pool"
        timeout-connect = 3000
        timeout-server = 10000

        [[backend.server]]
        name = "a"
        addr = "{}"

        [[backend.server]]
        name = "b"
        addr = "{}"
        "#,
        a.addr, b.addr
    ));
    let front = front_addr(&worker);

    for _ in 0..8 {
        run_client(&mut worker, front);
    }
    assert_eq!(a.hits.load(Ordering::SeqCst), 4);

    lb::set_server_weight(&mut worker.backends[0], 0, 3);

    // Let the transient pass settle, then measure steady state.
    for _ in 0..8 {
        run_client(&mut worker, front);
    }
    let a_base = a.hits.load(Ordering::SeqCst);
    let b_base = b.hits.load(Ordering::SeqCst);
    for _ in 0..16 {
        run_client(&mut worker, front);
    }
    let a_got = a.hits.load(Ordering::SeqCst) - a_base;
    let b_got = b.hits.load(Ordering::SeqCst) - b_base;
    assert!(
        (a_got as i64 - 12).abs() <= 1 && (b_got as i64 - 4).abs() <= 1,
        "expected ~3:1, got a={a_got} b={b_got}"
    );
}

#[test]
fn test_graceful_stop_drains_then_forces() {
    let holder = spawn_holder();
    let mut worker = worker_from(&format!(
        r#"
        [global]
        grace = 400

        [[frontend]]
        name = "fe"
        bind = ["127.0.0.1:0"]
        default-backend = "pool"
        timeout-client = 30000

        [[backend]]
        name = "pool"
        timeout-connect = 3000

        [[backend.server]]
        name = "only"
        addr = "{}"
        "#,
        holder.addr
    ));
    let front = front_addr(&worker);

    let _held: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(front).unwrap()).collect();
    assert!(spin(&mut worker, Duration::from_secs(5), |w| w
        .session_count()
        == 3));

    worker.post_signal(ProxySignal::SoftStop);
    assert!(worker.stopping);
    assert_eq!(worker.session_count(), 3);

    // Accepting stopped immediately: this connect lands in the kernel
    // backlog but is never serviced.
    let _ignored = TcpStream::connect(front);

    // Grace expiry force-closes the stragglers and the worker drains.
    let start = Instant::now();
    let drained = spin(&mut worker, Duration::from_secs(5), |w| w.finished());
    assert!(drained, "worker never drained after grace");
    assert!(start.elapsed() >= Duration::from_millis(300), "closed early");
    assert_eq!(worker.session_count(), 0);
    // Only the original three sessions ever existed.
    assert_eq!(worker.frontends[0].counters.cum_conn, 3);
}

#[test]
fn test_content_rule_rejects_payload() {
    let echo = spawn_echo();
    let mut worker = worker_from(&format!(
        r#"
        [[frontend]]
        name = "fe"
        bind = ["127.0.0.1:0"]
        default-backend = "pool"
        timeout-client = 10000
        inspect-delay = 2000

        [[frontend.tcp-request-content]]
        action = "reject"
        cond = {{ match = "payload-prefix", prefix = "EVIL" }}

        [[backend]]
        name = "pool"
        timeout-connect = 3000
        timeout-server = 10000

        [[backend.server]]
        name = "a"
        addr = "{}"
        "#,
        echo.addr
    ));
    let front = front_addr(&worker);

    // Offending payload: rejected before any server is contacted.
    let bad = std::thread::spawn(move || {
        let mut c = TcpStream::connect(front).unwrap();
        c.write_all(b"EVIL stuff").unwrap();
        let mut buf = Vec::new();
        let _ = c.read_to_end(&mut buf);
        buf
    });
    assert!(spin(&mut worker, Duration::from_secs(5), |_| bad
        .is_finished()));
    assert_eq!(bad.join().unwrap(), b"");
    assert!(spin(&mut worker, Duration::from_secs(5), |w| w
        .session_count()
        == 0));
    assert_eq!(echo.hits.load(Ordering::SeqCst), 0);
    assert_eq!(worker.frontends[0].counters.denied_req, 1);
    assert_eq!(worker.frontends[0].errors.len(), 1);

    // Innocent payload passes the same rule set.
    let reply = run_client(&mut worker, front);
    assert_eq!(reply, b"pong");
    assert_eq!(echo.hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_queue_timeout_expires_waiting_session() {
    let holder = spawn_holder();
    let mut worker = worker_from(&format!(
        r#"
        [[frontend]]
        name = "fe"
        bind = ["127.0.0.1:0"]
        default-backend = "pool"
        timeout-client = 30000

        [[backend]]
        name = "pool"
        timeout-connect = 3000
        timeout-queue = 300

        [[backend.server]]
        name = "only"
        addr = "{}"
        maxconn = 1
        "#,
        holder.addr
    ));
    let front = front_addr(&worker);

    let _c0 = TcpStream::connect(front).unwrap();
    let _c1 = TcpStream::connect(front).unwrap();
    assert!(spin(&mut worker, Duration::from_secs(5), |w| {
        w.backends[0].servers[0].served == 1 && w.backends[0].nbpend() == 1
    }));

    // The queued session gives up after timeout-queue.
    assert!(
        spin(&mut worker, Duration::from_secs(5), |w| w.session_count() == 1),
        "queued session did not time out"
    );
    assert_eq!(worker.backends[0].nbpend(), 0);
    let snap: Vec<String> = worker.frontends[0]
        .errors
        .iter()
        .map(|s| s.cause.clone())
        .collect();
    assert_eq!(snap, vec!["SRVTO/Q".to_string()]);
}

//! Admin applet over a real socket.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use gantry_config::ConfigLoader;
use gantry_core::Worker;

fn worker_with_admin() -> Worker {
    let cfg = ConfigLoader::load_str(
        r#"
        [admin]
        tcp = "127.0.0.1:0"

        [[backend]]
        name = "pool"

        [[backend.server]]
        name = "s1"
        addr = "127.0.0.1:9000"
        weight = 2
        "#,
    )
    .unwrap();
    Worker::from_config(&cfg).unwrap()
}

/// Send command lines, drive the worker, return one JSON value per line.
fn admin_round(worker: &mut Worker, commands: &[&str]) -> Vec<serde_json::Value> {
    let addr = worker.admin_addr().expect("admin socket");
    let expected = commands.len();
    let script: String = commands
        .iter()
        .map(|c| format!("{c}\n"))
        .collect::<Vec<_>>()
        .join("");
    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(script.as_bytes()).unwrap();
        let mut reader = BufReader::new(stream);
        let mut out = Vec::new();
        for _ in 0..expected {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    });
    let start = Instant::now();
    while !client.is_finished() {
        assert!(start.elapsed() < Duration::from_secs(10), "admin stalled");
        worker.run_once().unwrap();
    }
    client.join().unwrap()
}

#[test]
fn test_version_and_status() {
    let mut worker = worker_with_admin();
    let replies = admin_round(&mut worker, &["version", "pool.status pool s1"]);
    assert_eq!(replies[0]["ok"], true);
    assert_eq!(replies[0]["api"], "pool.v1");
    assert_eq!(replies[1]["server"]["name"], "s1");
    assert_eq!(replies[1]["server"]["weight"], 2);
    assert_eq!(replies[1]["server"]["state"], "up");
}

#[test]
fn test_live_pool_mutation() {
    let mut worker = worker_with_admin();
    let replies = admin_round(
        &mut worker,
        &[
            "pool.add pool s2 127.0.0.1:9001 weight=4 check inter=2000 rise=2 fall=3",
            "pool.weight pool s1 8",
            "pool.disable pool s2",
            "pool.contents pool",
        ],
    );
    assert_eq!(replies[0]["ok"], true, "{}", replies[0]);
    assert_eq!(replies[1]["ok"], true);
    assert_eq!(replies[2]["state"], "maint");

    let servers = replies[3]["servers"].as_array().unwrap();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0]["weight"], 8);
    assert_eq!(servers[1]["state"], "maint");

    // The worker state reflects it all.
    assert_eq!(worker.backends[0].servers.len(), 2);
    assert_eq!(worker.backends[0].srv_act, 1);
    assert!(worker.backends[0].servers[1].check.enabled);
    assert_eq!(worker.backends[0].servers[1].check.rise, 2);
}

#[test]
fn test_remove_rejected_and_unknown() {
    let mut worker = worker_with_admin();
    let replies = admin_round(
        &mut worker,
        &["pool.remove pool s1", "pool.status ghost s1", "nonsense"],
    );
    for reply in &replies {
        assert_eq!(reply["ok"], false, "{reply}");
    }
    assert!(replies[0]["error"]
        .as_str()
        .unwrap()
        .contains("unsupported"));
    // The server is untouched.
    assert_eq!(worker.backends[0].servers.len(), 1);
}

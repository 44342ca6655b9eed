//! Client-vs-live-server roundtrips (§4.8), exercising `DataSource` and
//! `DataSink` together rather than the raw wire protocol (see
//! `dataserv-core`'s own `end_to_end.rs` for that).

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use dataserv_client::{DataSink, DataSource};
use dataserv_core::{DataMode, Server};
use serde_json::json;

fn spawn_server() -> (SocketAddr, Arc<AtomicBool>, thread::JoinHandle<()>) {
    let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let server = Server::bind(addr).expect("failed to bind test server");
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let handle = thread::spawn(move || server.run(&shutdown_clone));
    thread::sleep(Duration::from_millis(20));
    (addr, shutdown, handle)
}

fn stop_server(shutdown: Arc<AtomicBool>, handle: thread::JoinHandle<()>) {
    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn source_push_reaches_sink_pop() {
    let (addr, shutdown, handle) = spawn_server();

    let mut source = DataSource::new("bench", "127.0.0.1", addr.port(), true).unwrap();
    source.start().expect("source failed to start");

    let mut sink = DataSink::new("bench", "127.0.0.1", addr.port(), DataMode::Default, true).unwrap();
    sink.start().expect("sink failed to start");

    source.push(&json!({"freq": 42.0})).unwrap();

    let got = sink.pop(Some(Duration::from_secs(5))).expect("pop failed");
    assert!(got);
    assert_eq!(sink.field("freq"), Some(&json!(42.0)));

    source.stop().unwrap();
    sink.stop().unwrap();
    stop_server(shutdown, handle);
}

#[test]
fn delta_mode_sink_reconstructs_successive_snapshots() {
    let (addr, shutdown, handle) = spawn_server();

    let mut source = DataSource::new("trace", "127.0.0.1", addr.port(), true).unwrap();
    source.start().unwrap();

    let mut sink = DataSink::new("trace", "127.0.0.1", addr.port(), DataMode::Delta, true).unwrap();
    sink.start().unwrap();

    source.push(&json!({"series": [0, 0, 0]})).unwrap();
    assert!(sink.pop(Some(Duration::from_secs(5))).unwrap());
    assert_eq!(sink.field("series"), Some(&json!([0, 0, 0])));

    source.push(&json!({"series": [1, 0, 0]})).unwrap();
    assert!(sink.pop(Some(Duration::from_secs(5))).unwrap());
    assert_eq!(sink.field("series"), Some(&json!([1, 0, 0])));

    source.stop().unwrap();
    sink.stop().unwrap();
    stop_server(shutdown, handle);
}

#[test]
fn sink_pop_times_out_when_source_is_idle() {
    let (addr, shutdown, handle) = spawn_server();

    let mut source = DataSource::new("idle", "127.0.0.1", addr.port(), true).unwrap();
    source.start().unwrap();

    let mut sink = DataSink::new("idle", "127.0.0.1", addr.port(), DataMode::Default, true).unwrap();
    sink.start().unwrap();

    let err = sink.pop(Some(Duration::from_millis(200))).unwrap_err();
    assert!(matches!(err, dataserv_client::ClientError::Timeout));

    source.stop().unwrap();
    sink.stop().unwrap();
    stop_server(shutdown, handle);
}

#[test]
fn start_fails_fast_when_no_server_is_listening_and_auto_reconnect_is_off() {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 1);
    let mut source = DataSource::new("unreachable", "127.0.0.1", addr.port(), false).unwrap();
    let result = source.start();
    assert!(result.is_err());

    let mut sink = DataSink::new("unreachable", "127.0.0.1", addr.port(), DataMode::Default, false).unwrap();
    let result = sink.start();
    assert!(result.is_err());
}

#[test]
fn sink_reconnects_and_resynchronizes_after_server_restart() {
    let (addr, shutdown, handle) = spawn_server();

    let mut source = DataSource::new("restart", "127.0.0.1", addr.port(), true).unwrap();
    source.start().unwrap();

    let mut sink = DataSink::new("restart", "127.0.0.1", addr.port(), DataMode::Default, true).unwrap();
    sink.start().unwrap();

    source.push(&json!({"n": 1})).unwrap();
    assert!(sink.pop(Some(Duration::from_secs(5))).unwrap());
    assert_eq!(sink.field("n"), Some(&json!(1)));

    // Bounce the server out from under both clients; auto_reconnect on both
    // sides should re-handshake once a new server comes up on the same port.
    stop_server(shutdown, handle);

    let server = dataserv_core::Server::bind(addr).expect("failed to rebind on the same port");
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let handle = thread::spawn(move || server.run(&shutdown_clone));
    thread::sleep(Duration::from_millis(20));

    source.push(&json!({"n": 2})).unwrap();
    let mut saw_two = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        if sink.pop(Some(Duration::from_millis(200))).unwrap_or(false)
            && sink.field("n") == Some(&json!(2))
        {
            saw_two = true;
            break;
        }
        let _ = source.push(&json!({"n": 2}));
    }
    assert!(saw_two, "sink never resynchronized after the server restarted");

    source.stop().unwrap();
    sink.stop().unwrap();
    stop_server(shutdown, handle);
}

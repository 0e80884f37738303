//! Read and connect timeout delivery.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use netmgr::{ConnectOpts, Error, ListenOpts, Manager, RecvFn, Timeouts};

/// A connection that never sends anything times out: the server's receive
/// callback observes `TimedOut` no earlier than the configured idle time,
/// and the connection is torn down.
#[test]
fn server_read_timeout() {
    common::init_logging();
    let mgr = Manager::new(1).unwrap();
    mgr.set_timeouts(Timeouts {
        init: 200,
        idle: 200,
        keepalive: 300,
        advertised: 0,
    });

    let (seen_tx, seen_rx) = unbounded();
    let recv: RecvFn = Arc::new(move |_h, msg| {
        seen_tx
            .send(msg.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .unwrap();
    });
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            recv,
            None,
            ListenOpts::default(),
        )
        .unwrap();

    let started = Instant::now();
    let sock = std::net::TcpStream::connect(listener.local_addr()).unwrap();

    let got = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let elapsed = started.elapsed();
    assert_eq!(got.unwrap_err(), Error::TimedOut.to_string());
    assert!(elapsed >= Duration::from_millis(200), "fired early: {elapsed:?}");

    // Torn down: the kernel reports the close to the peer.
    drop(sock);
    assert!(seen_rx.recv_timeout(Duration::from_millis(300)).is_err());
}

/// Connecting to a blackholed address fails the connect callback with an
/// explicit result once the timer expires.
#[test]
fn connect_timeout() {
    common::init_logging();
    let mgr = Manager::new(1).unwrap();

    let (conn_tx, conn_rx) = unbounded();
    // 192.0.2.0/24 is TEST-NET-1, never routed.
    mgr.connect_tcpdns(
        None,
        "192.0.2.1:53".parse().unwrap(),
        Box::new(move |res| conn_tx.send(res.map(|_| ())).unwrap()),
        ConnectOpts {
            timeout_ms: 250,
            extra_handle_size: 0,
        },
    )
    .unwrap();

    let res = conn_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(res.is_err());
}

/// A per-handle timeout override takes precedence over the manager-wide
/// idle timeout.
#[test]
fn handle_timeout_override() {
    common::init_logging();
    let mgr = Manager::new(1).unwrap();
    // Long manager-wide timeouts; the override is what must fire.
    mgr.set_timeouts(Timeouts {
        init: 60_000,
        idle: 60_000,
        keepalive: 60_000,
        advertised: 0,
    });

    let recv: RecvFn = Arc::new(|_h, _msg| {});
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            recv,
            None,
            ListenOpts::default(),
        )
        .unwrap();

    let (conn_tx, conn_rx) = unbounded();
    mgr.connect_tcpdns(
        None,
        listener.local_addr(),
        Box::new(move |res| conn_tx.send(res).unwrap()),
        ConnectOpts::default(),
    )
    .unwrap();
    let handle = conn_rx
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();

    handle.set_timeout(200);
    let started = Instant::now();
    let (read_tx, read_rx) = unbounded();
    handle.read(Arc::new(move |_h, res| {
        read_tx
            .send(res.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .unwrap();
    }));

    let got = read_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got.unwrap_err(), Error::TimedOut.to_string());
    assert!(started.elapsed() >= Duration::from_millis(200));
}

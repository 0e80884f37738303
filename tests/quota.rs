//! Connection quota admission control.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use netmgr::{ListenOpts, Manager, Quota, RecvFn};

/// With a quota of one, the second connection is not served until the
/// first one goes away, and no connection is ever lost.
#[test]
fn second_connection_deferred_until_release() {
    common::init_logging();
    let mgr = Manager::new(1).unwrap();
    let quota = Quota::new(1);

    let (seen_tx, seen_rx) = unbounded();
    let recv: RecvFn = Arc::new(move |_h, msg| {
        if let Ok(msg) = msg {
            seen_tx.send(msg.to_vec()).unwrap();
        }
    });
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            recv,
            None,
            ListenOpts {
                quota: Some(quota.clone()),
                ..ListenOpts::default()
            },
        )
        .unwrap();

    let mut first = std::net::TcpStream::connect(listener.local_addr()).unwrap();
    first.write_all(&common::frame(b"one")).unwrap();
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"one"
    );
    assert_eq!(quota.used(), 1);

    let mut second = std::net::TcpStream::connect(listener.local_addr()).unwrap();
    second.write_all(&common::frame(b"two")).unwrap();
    // The second connection sits in the backlog while the first holds the
    // quota.
    assert!(seen_rx.recv_timeout(Duration::from_millis(400)).is_err());

    drop(first);
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"two"
    );
    drop(second);
}

/// The concurrent admission count never exceeds the quota even when many
/// clients pile in at once.
#[test]
fn admissions_never_exceed_quota() {
    common::init_logging();
    let mgr = Manager::new(2).unwrap();
    let quota = Quota::new(3);

    let (seen_tx, seen_rx) = unbounded();
    let recv: RecvFn = {
        let quota = quota.clone();
        Arc::new(move |_h, msg| {
            if msg.is_ok() {
                assert!(quota.used() <= 3, "quota exceeded");
                seen_tx.send(()).unwrap();
            }
        })
    };
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            recv,
            None,
            ListenOpts {
                quota: Some(quota.clone()),
                ..ListenOpts::default()
            },
        )
        .unwrap();

    let mut socks = Vec::new();
    for i in 0..8u8 {
        let mut sock = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        sock.write_all(&common::frame(&[i])).unwrap();
        socks.push(sock);
    }

    // Serve the herd by closing connections as their messages arrive.
    let mut served = 0;
    while served < 8 {
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        served += 1;
        assert!(quota.used() <= 3);
        socks.remove(0);
    }
}

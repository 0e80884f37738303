//! Manager and listener lifecycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use netmgr::{ConnectOpts, ListenOpts, Manager, RecvFn};

/// Construction and destruction with no traffic terminates cleanly.
#[test]
fn start_and_drop() {
    common::init_logging();
    let mgr = Manager::new(4).unwrap();
    assert_eq!(mgr.workers(), 4);
    drop(mgr);
}

/// A stopped listener accepts no further connections, while established
/// connections keep working.
#[test]
fn stop_listening_quiesces() {
    common::init_logging();
    let mgr = Manager::new(1).unwrap();

    let (seen_tx, seen_rx) = unbounded();
    let recv: RecvFn = Arc::new(move |handle, msg| {
        if let Ok(msg) = msg {
            seen_tx.send(msg.to_vec()).unwrap();
            handle.send(msg.to_vec(), None);
        }
    });
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            recv,
            None,
            ListenOpts::default(),
        )
        .unwrap();
    let addr = listener.local_addr();

    let (conn_tx, conn_rx) = unbounded();
    mgr.connect_tcpdns(
        None,
        addr,
        Box::new(move |res| conn_tx.send(res).unwrap()),
        ConnectOpts::default(),
    )
    .unwrap();
    let handle = conn_rx
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();

    listener.stop_listening();

    // The established connection still serves traffic.
    let (reply_tx, reply_rx) = unbounded();
    handle.send(b"still here".to_vec(), None);
    handle.read(Arc::new(move |_h, res| {
        reply_tx.send(res.map(|b| b.to_vec())).unwrap();
    }));
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"still here"
    );
    assert_eq!(
        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap(),
        b"still here"
    );

    // New connections are refused or go unanswered; either way no accept
    // happens and nothing is delivered.
    if let Ok(mut sock) = std::net::TcpStream::connect(addr) {
        use std::io::Write;
        let _ = sock.write_all(&common::frame(b"late"));
    }
    assert!(seen_rx.recv_timeout(Duration::from_millis(400)).is_err());
}

/// Shutdown cancels in-flight reads with an explicit result.
#[test]
fn shutdown_cancels_pending_reads() {
    common::init_logging();
    let mgr = Manager::new(1).unwrap();

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

    let (read_tx, read_rx) = unbounded();
    handle.read(Arc::new(move |_h, res| {
        read_tx.send(res.map(|_| ()).is_err()).unwrap();
    }));

    mgr.shutdown();
    assert!(read_rx.recv_timeout(Duration::from_secs(5)).unwrap());
}

/// Handle clones keep the conversation alive; the last drop releases it
/// and a fresh connection still works afterwards.
#[test]
fn handle_clones_and_release() {
    common::init_logging();
    let mgr = Manager::new(1).unwrap();

    let (seen_tx, seen_rx) = unbounded();
    let recv: RecvFn = Arc::new(move |handle, msg| {
        if let Ok(msg) = msg {
            seen_tx.send((handle.clone(), msg.to_vec())).unwrap();
        }
    });
    let listener = mgr
        .listen_tcpdns(
            "127.0.0.1:0".parse().unwrap(),
            recv,
            None,
            ListenOpts::default(),
        )
        .unwrap();

    use std::io::Write;
    let mut sock = std::net::TcpStream::connect(listener.local_addr()).unwrap();
    sock.write_all(&common::frame(b"kept")).unwrap();

    let (held, msg) = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(msg, b"kept");

    // The held handle can still address the peer after the callback
    // returned, and extra clones are interchangeable.
    let clone = held.clone();
    assert_eq!(clone.peer(), held.peer());
    clone.send(b"reply".to_vec(), None);

    let mut buf = [0u8; 16];
    use std::io::Read;
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    sock.read_exact(&mut buf[..7]).unwrap();
    assert_eq!(&buf[..2], &[0x00, 0x05]);
    assert_eq!(&buf[2..7], b"reply");

    drop(held);
    drop(clone);
}

//! Plain TCP byte-stream end-to-end behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use netmgr::{ConnectOpts, ListenOpts, Manager, RecvFn};

/// One worker, one echo round trip over the unframed stream. Client reads
/// are one-shot: each `read` call delivers exactly one region, and nothing
/// more arrives until the next call.
#[test]
fn echo_round_trip() {
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
        .listen_tcp(
            "127.0.0.1:0".parse().unwrap(),
            recv,
            None,
            ListenOpts::default(),
        )
        .unwrap();

    let (conn_tx, conn_rx) = unbounded();
    mgr.connect_tcp(
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

    let payload = *b"raw byte stream!";
    let (sent_tx, sent_rx) = unbounded();
    handle.send(
        payload.to_vec(),
        Some(Box::new(move |_h, res| sent_tx.send(res.is_ok()).unwrap())),
    );
    let (reply_tx, reply_rx) = unbounded();
    handle.read(Arc::new(move |_h, res| {
        reply_tx.send(res.map(|b| b.to_vec())).unwrap();
    }));

    assert!(sent_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        payload
    );
    let reply = reply_rx
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    assert_eq!(reply, payload);

    // Exactly one callback on each side.
    assert!(seen_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(reply_rx.recv_timeout(Duration::from_millis(200)).is_err());

    // A second echo reaches the client only once a new read is armed; the
    // spent callback from the first read never fires again.
    handle.send(b"again".to_vec(), None);
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"again"
    );
    assert!(reply_rx.recv_timeout(Duration::from_millis(400)).is_err());

    let (reply2_tx, reply2_rx) = unbounded();
    handle.read(Arc::new(move |_h, res| {
        reply2_tx.send(res.map(|b| b.to_vec())).unwrap();
    }));
    assert_eq!(
        reply2_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap(),
        b"again"
    );
    assert!(reply_rx.recv_timeout(Duration::from_millis(200)).is_err());
}

/// No framing on this variant: bytes arrive exactly as written, length
/// prefix and all.
#[test]
fn delivers_raw_chunks() {
    common::init_logging();
    let mgr = Manager::new(1).unwrap();

    let (seen_tx, seen_rx) = unbounded();
    let recv: RecvFn = Arc::new(move |_h, msg| {
        if let Ok(msg) = msg {
            seen_tx.send(msg.to_vec()).unwrap();
        }
    });
    let listener = mgr
        .listen_tcp(
            "127.0.0.1:0".parse().unwrap(),
            recv,
            None,
            ListenOpts::default(),
        )
        .unwrap();

    use std::io::Write;
    let wire = [0x00, 0x05, b'h', b'e', b'l', b'l', b'o'];
    let mut sock = std::net::TcpStream::connect(listener.local_addr()).unwrap();
    sock.write_all(&wire).unwrap();

    // What a DNS variant would strip as a length prefix comes through
    // verbatim here.
    let mut got = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    while got.len() < wire.len() {
        let more = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        got.extend_from_slice(&more);
    }
    assert_eq!(got, wire);
}

//! Stream plumbing shared by the TCP-based variants, plus the plain TCP
//! byte-stream variant itself.
//!
//! The accept path, the non-blocking connect dance, and the queued
//! partial-write machinery live here; `tcpdns` and `tlsdns` layer framing
//! and the TLS engine on top.

use std::io::{ErrorKind, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, trace, warn};
use mio::Interest;

use crate::errors::{Error, Result};
use crate::event::{ConnectCmd, ConnectProto, ListenCmd, ListenProto, SendCmd};
use crate::listener::ChildRef;
use crate::manager::StatEvent;
use crate::quota::{Admission, Quota, Waiter};
use crate::socket::{self, ChildCfg, SendReq, Socket, SocketKind, Variant};
use crate::tlsdns::TlsState;
use crate::worker::WorkerCore;
use crate::{tcpdns, tlsdns, RecvFn, MAX_MESSAGE_SIZE};

/// Adopts one pre-bound listening socket (any stream variant).
pub(crate) fn listen(core: &mut WorkerCore, cmd: Box<ListenCmd>) -> Result<()> {
    let ListenCmd {
        proto,
        tcp,
        recv,
        accept,
        quota,
        extra,
        parent,
        ..
    } = *cmd;
    let std_sock = tcp.ok_or(Error::Unexpected("stream listen without a socket"))?;
    let local = std_sock.local_addr()?;
    let msock = mio::net::TcpListener::from_std(std_sock);
    let child = Arc::new(ChildCfg {
        recv,
        accept,
        quota,
        extra,
    });
    let (variant, kind) = match proto {
        ListenProto::Tcp => (
            Variant::TcpListen,
            SocketKind::TcpListen { sock: msock, child },
        ),
        ListenProto::TcpDns => (
            Variant::TcpDnsListen,
            SocketKind::TcpDnsListen { sock: msock, child },
        ),
        ListenProto::TlsDns(tls) => (
            Variant::TlsDnsListen,
            SocketKind::TlsDnsListen {
                sock: msock,
                child,
                tls,
            },
        ),
        ListenProto::Udp => unreachable!("udp listen routed to the stream path"),
    };

    let mut s = Socket::new(variant, kind, core.tid);
    s.listening = true;
    s.local = Some(local);
    s.parent = Some(parent.clone());

    let (key, gen) = core.insert_socket(s);
    {
        let core_ref = &mut *core;
        let registry = core_ref.poll.registry();
        let s = core_ref.sockets.get_mut(key).unwrap();
        if let Err(err) = socket::register(registry, &mut s.kind, key, Interest::READABLE) {
            core.sockets.remove(key);
            return Err(err.into());
        }
    }
    parent.register_child(ChildRef {
        worker: core.shared.clone(),
        key,
        gen,
    });
    debug!("worker {}: {:?} listener on {}", core.tid, variant, local);
    Ok(())
}

fn listener_quota(core: &WorkerCore, key: usize) -> Option<Arc<Quota>> {
    match &core.sockets.get(key)?.kind {
        SocketKind::TcpListen { child, .. }
        | SocketKind::TcpDnsListen { child, .. }
        | SocketKind::TlsDnsListen { child, .. } => child.quota.clone(),
        _ => None,
    }
}

/// Accepts until the backlog runs dry. Admission control runs before each
/// accept: an over-hard-quota listener pauses itself and is handed back by
/// a `QuotaFreed` event when a connection releases its share.
pub(crate) fn stream_accept(core: &mut WorkerCore, key: usize) {
    loop {
        {
            let Some(s) = core.sockets.get(key) else { return };
            if s.closing || s.accept_paused {
                return;
            }
        }
        let quota = listener_quota(core, key);
        let mut soft = false;
        if let Some(quota) = &quota {
            match quota.attach() {
                Admission::Ok => {}
                Admission::Soft => {
                    trace!("worker {}: {}, serving one response", core.tid, Error::SoftQuota);
                    soft = true;
                }
                Admission::Deferred => {
                    let worker = core.shared.clone();
                    let s = core.sockets.get_mut(key).unwrap();
                    s.accept_paused = true;
                    quota.add_waiter(Waiter {
                        worker,
                        key,
                        gen: s.gen,
                    });
                    if s.should_log_quota() {
                        warn!(
                            "worker {}: {} on {:?}, accepts deferred",
                            core.tid,
                            Error::Quota,
                            s.local
                        );
                    }
                    core.mgr.record(StatEvent::QuotaDeferred);
                    return;
                }
            }
        }

        let res = {
            let Some(s) = core.sockets.get_mut(key) else { return };
            match &mut s.kind {
                SocketKind::TcpListen { sock, .. }
                | SocketKind::TcpDnsListen { sock, .. }
                | SocketKind::TlsDnsListen { sock, .. } => sock.accept(),
                _ => return,
            }
        };
        match res {
            Ok((stream, peer)) => accept_child(core, key, stream, peer, soft, quota),
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                if let Some(quota) = &quota {
                    quota.release_and_wake();
                }
                return;
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => {
                if let Some(quota) = &quota {
                    quota.release_and_wake();
                }
            }
            Err(err) => {
                if let Some(quota) = &quota {
                    quota.release_and_wake();
                }
                core.mgr.record(StatEvent::AcceptFail);
                warn!("worker {}: accept failed: {}", core.tid, err);
                return;
            }
        }
    }
}

fn accept_child(
    core: &mut WorkerCore,
    lkey: usize,
    stream: mio::net::TcpStream,
    peer: SocketAddr,
    soft: bool,
    quota: Option<Arc<Quota>>,
) {
    let (variant, child, tls_cfg, parent) = {
        let Some(listener) = core.sockets.get(lkey) else { return };
        match &listener.kind {
            SocketKind::TcpListen { child, .. } => {
                (Variant::Tcp, child.clone(), None, listener.parent.clone())
            }
            SocketKind::TcpDnsListen { child, .. } => {
                (Variant::TcpDns, child.clone(), None, listener.parent.clone())
            }
            SocketKind::TlsDnsListen { child, tls, .. } => (
                Variant::TlsDns,
                child.clone(),
                Some(tls.clone()),
                listener.parent.clone(),
            ),
            _ => return,
        }
    };

    let _ = stream.set_nodelay(true);
    let local = stream.local_addr().ok();
    let kind = match variant {
        Variant::Tcp => SocketKind::Tcp(stream),
        Variant::TcpDns => SocketKind::TcpDns(stream),
        Variant::TlsDns => {
            let cfg = tls_cfg.unwrap();
            match rustls::ServerConnection::new(cfg) {
                Ok(conn) => SocketKind::TlsDns {
                    stream,
                    tls: TlsState::server(conn),
                },
                Err(err) => {
                    warn!("worker {}: TLS engine setup failed: {}", core.tid, err);
                    core.mgr.record(StatEvent::AcceptFail);
                    if let Some(quota) = &quota {
                        quota.release_and_wake();
                    }
                    return;
                }
            }
        }
        _ => unreachable!(),
    };

    let mut s = Socket::new(variant, kind, core.tid);
    s.connected = true;
    s.reading = true;
    s.peer = Some(peer);
    s.local = local;
    s.recv_cb = Some(child.recv.clone());
    s.accept_cb = child.accept.clone();
    s.extra_size = child.extra;
    s.quota = quota;
    s.overquota = soft;
    s.parent = parent;

    let (key, _gen) = core.insert_socket(s);
    {
        let core_ref = &mut *core;
        let registry = core_ref.poll.registry();
        let s = core_ref.sockets.get_mut(key).unwrap();
        if let Err(err) = socket::register(
            registry,
            &mut s.kind,
            key,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!("worker {}: register failed for accepted socket: {}", core.tid, err);
            core.mgr.record(StatEvent::AcceptFail);
            socket::shutdown_socket(core, key);
            return;
        }
    }

    trace!("worker {}: accepted {:?} from {}", core.tid, variant, peer);
    core.mgr.record(StatEvent::Accept);
    socket::restart_read_timer(core, key);

    match variant {
        Variant::Tcp | Variant::TcpDns => {
            let cb = core.sockets.get_mut(key).and_then(|s| s.accept_cb.take());
            if let Some(cb) = cb {
                let Some(handle) = socket::stream_handle(core, key) else { return };
                if cb(&handle).is_err() {
                    socket::shutdown_socket(core, key);
                    return;
                }
            }
            if variant == Variant::Tcp {
                try_read(core, key);
            } else {
                tcpdns::try_read(core, key);
            }
        }
        Variant::TlsDns => {
            // The first cycle arms the handshake.
            tlsdns::cycle(core, key);
        }
        _ => unreachable!(),
    }
}

/// Starts an outgoing stream connection of any flavor.
pub(crate) fn connect(core: &mut WorkerCore, cmd: Box<ConnectCmd>) {
    let ConnectCmd {
        proto,
        local,
        peer,
        cb,
        timeout_ms,
        extra,
    } = *cmd;
    let sizes = core.mgr.tcp_buf_sizes();
    let stream = match crate::sys::tcp_connect(local, peer, sizes, timeout_ms) {
        Ok(stream) => stream,
        Err(err) => {
            core.mgr.record(StatEvent::ConnectFail);
            cb(Err(err.into()));
            return;
        }
    };
    let mstream = mio::net::TcpStream::from_std(stream);
    let (variant, kind) = match proto {
        ConnectProto::Tcp => (Variant::Tcp, SocketKind::Tcp(mstream)),
        ConnectProto::TcpDns => (Variant::TcpDns, SocketKind::TcpDns(mstream)),
        ConnectProto::TlsDns {
            config,
            server_name,
        } => match rustls::ClientConnection::new(config, server_name) {
            Ok(conn) => (
                Variant::TlsDns,
                SocketKind::TlsDns {
                    stream: mstream,
                    tls: TlsState::client(conn),
                },
            ),
            Err(err) => {
                core.mgr.record(StatEvent::ConnectFail);
                cb(Err(err.into()));
                return;
            }
        },
        ConnectProto::Udp => unreachable!("udp connect routed to the stream path"),
    };

    let mut s = Socket::new(variant, kind, core.tid);
    s.client = true;
    s.connecting = true;
    s.peer = Some(peer);
    s.connect_cb = Some(cb);
    s.connect_timeout_ms = timeout_ms;
    s.extra_size = extra;

    let (key, _gen) = core.insert_socket(s);
    {
        let core_ref = &mut *core;
        let registry = core_ref.poll.registry();
        let s = core_ref.sockets.get_mut(key).unwrap();
        if let Err(err) = socket::register(
            registry,
            &mut s.kind,
            key,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            let cb = s.connect_cb.take();
            core.sockets.remove(key);
            core.mgr.record(StatEvent::ConnectFail);
            if let Some(cb) = cb {
                cb(Err(err.into()));
            }
            return;
        }
    }
    socket::arm_connect_timer(core, key);
}

fn stream_of(kind: &mut SocketKind) -> Option<&mut mio::net::TcpStream> {
    match kind {
        SocketKind::Tcp(stream) | SocketKind::TcpDns(stream) => Some(stream),
        SocketKind::TlsDns { stream, .. } => Some(stream),
        _ => None,
    }
}

/// Writability on a connecting socket: check whether the connect finished,
/// the standard non-blocking dance of `take_error` plus `peer_addr`.
pub(crate) fn connect_ready(core: &mut WorkerCore, key: usize) {
    let outcome = {
        let Some(s) = core.sockets.get_mut(key) else { return };
        if !s.connecting || s.connected {
            return;
        }
        let Some(stream) = stream_of(&mut s.kind) else { return };
        match stream.take_error() {
            Ok(Some(err)) | Err(err) => Err(err),
            Ok(None) => match stream.peer_addr() {
                Ok(_) => Ok(stream.local_addr().ok()),
                Err(ref err)
                    if err.kind() == ErrorKind::NotConnected
                        || err.raw_os_error() == Some(libc::EINPROGRESS) =>
                {
                    // Spurious wake-up; the connect is still in flight.
                    return;
                }
                Err(err) => Err(err),
            },
        }
    };

    match outcome {
        Ok(local) => {
            let s = core.sockets.get_mut(key).unwrap();
            s.connected = true;
            s.local = local;
            match s.variant {
                Variant::Tcp | Variant::TcpDns => {
                    s.connecting = false;
                    let cb = s.connect_cb.take();
                    socket::stop_timer(core, key);
                    core.mgr.record(StatEvent::Connect);
                    let Some(handle) = socket::stream_handle(core, key) else { return };
                    if let Some(cb) = cb {
                        cb(Ok(handle));
                    }
                }
                Variant::TlsDns => {
                    // Still `connecting` until the handshake completes; the
                    // connect timer covers it and the connect callback
                    // fires from the cycle pump.
                    tlsdns::cycle(core, key);
                }
                _ => unreachable!(),
            }
        }
        Err(err) => {
            core.mgr.record(StatEvent::ConnectFail);
            let cb = core.sockets.get_mut(key).and_then(|s| s.connect_cb.take());
            if let Some(cb) = cb {
                cb(Err(err.into()));
            }
            socket::shutdown_socket(core, key);
        }
    }
}

pub(crate) fn io_event(core: &mut WorkerCore, key: usize, readable: bool, writable: bool) {
    let connecting = core.sockets.get(key).map_or(false, |s| s.connecting);
    if connecting {
        if writable {
            connect_ready(core, key);
        }
        if core.sockets.get(key).map_or(true, |s| s.connecting) {
            return;
        }
    }
    if writable {
        flush_sends(core, key);
    }
    if readable {
        try_read(core, key);
    }
}

/// Unframed reads: whatever arrived is handed to the receive callback as
/// one region out of the worker buffer.
fn try_read(core: &mut WorkerCore, key: usize) {
    loop {
        let core_ref = &mut *core;
        let Some(s) = core_ref.sockets.get_mut(key) else { return };
        if s.closing || !s.reading || s.read_paused {
            return;
        }
        let stream = match &mut s.kind {
            SocketKind::Tcp(stream) => stream,
            _ => return,
        };
        match stream.read(&mut core_ref.recvbuf) {
            Ok(0) => {
                socket::failed_read(core, key, Error::Eof);
                return;
            }
            Ok(n) => {
                let client = s.client;
                let cb = s.recv_cb.clone();
                let Some(handle) = socket::stream_handle(core, key) else { return };
                if let Some(cb) = cb {
                    cb(&handle, Ok(&core.recvbuf[..n]));
                }
                if client {
                    // One region per read call on client sockets.
                    if let Some(s) = core.sockets.get_mut(key) {
                        s.reading = false;
                        s.recv_cb = None;
                    }
                    socket::stop_timer(core, key);
                    return;
                }
                if let Some(s) = core.sockets.get_mut(key) {
                    s.got_message = true;
                }
                socket::restart_read_timer(core, key);
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                socket::failed_read(core, key, err.into());
                return;
            }
        }
    }
}

pub(crate) fn read_arm(core: &mut WorkerCore, key: usize, cb: RecvFn) {
    let Some(s) = core.sockets.get_mut(key) else { return };
    s.recv_cb = Some(cb);
    s.reading = true;
    socket::restart_read_timer(core, key);
    try_read(core, key);
}

pub(crate) fn resume_processing(core: &mut WorkerCore, key: usize) {
    try_read(core, key);
}

/// Queues one message (framed for the DNS variant) and pushes bytes out.
pub(crate) fn send(core: &mut WorkerCore, cmd: Box<SendCmd>, framed: bool) {
    let SendCmd {
        key,
        gen,
        handle,
        msg,
        cb,
    } = *cmd;
    if framed && msg.len() > MAX_MESSAGE_SIZE {
        if let Some(cb) = cb {
            cb(&handle, Err(Error::NoResources));
        }
        return;
    }
    let Some(s) = core.sock_mut(key, gen) else {
        if let Some(cb) = cb {
            cb(&handle, Err(Error::Canceled));
        }
        return;
    };
    let req = if framed {
        SendReq::framed(msg, cb, handle)
    } else {
        SendReq::unframed(msg, cb, handle)
    };
    s.sendq.push_back(req);
    if !s.connecting {
        flush_sends(core, key);
    }
}

/// Writes queued requests until the kernel pushes back. Completion
/// callbacks fire outside the write loop, after their bytes are accepted.
pub(crate) fn flush_sends(core: &mut WorkerCore, key: usize) {
    let mut completed: Vec<SendReq> = Vec::new();
    loop {
        let Some(s) = core.sockets.get_mut(key) else { break };
        if s.closing || s.connecting {
            break;
        }
        let Some(req) = s.sendq.front_mut() else { break };
        let stream = match &mut s.kind {
            SocketKind::Tcp(stream) | SocketKind::TcpDns(stream) => stream,
            _ => break,
        };
        let slices = [
            IoSlice::new(&req.header[req.hoff..]),
            IoSlice::new(&req.msg[req.moff..]),
        ];
        match stream.write_vectored(&slices) {
            Ok(n) => {
                if req.advance(n) {
                    let req = s.sendq.pop_front().unwrap();
                    completed.push(req);
                }
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                let req = s.sendq.pop_front().unwrap();
                if let Some(cb) = req.cb {
                    cb(&req.handle, Err(err.into()));
                }
                socket::shutdown_socket(core, key);
                break;
            }
        }
    }
    let sent = !completed.is_empty();
    for req in completed {
        if let Some(cb) = req.cb {
            cb(&req.handle, Ok(()));
        }
    }
    if sent {
        // A connection admitted over the soft quota serves one response
        // and goes away, releasing its share.
        let close = core.sockets.get(key).map_or(false, |s| {
            s.overquota && !s.client && !s.closing && s.sendq.is_empty()
        });
        if close {
            debug!("worker {}: closing over-soft-quota connection {}", core.tid, key);
            socket::shutdown_socket(core, key);
        }
    }
}

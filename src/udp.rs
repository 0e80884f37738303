//! UDP listener and connected-socket operations.
//!
//! Listener children read continuously, one datagram at a time into the
//! worker's receive buffer, and hand every datagram to the receive
//! callback under a fresh per-datagram handle. Connected client sockets
//! deliver one datagram per read call.

use std::io::ErrorKind;

use log::{debug, trace};
use mio::Interest;

use crate::errors::{Error, Result};
use crate::event::{ConnectCmd, ListenCmd, SendCmd};
use crate::listener::ChildRef;
use crate::manager::StatEvent;
use crate::socket::{self, SendReq, Socket, SocketKind, Variant};
use crate::worker::WorkerCore;
use crate::RecvFn;

pub(crate) fn listen(core: &mut WorkerCore, cmd: Box<ListenCmd>) -> Result<()> {
    let ListenCmd {
        recv,
        extra,
        parent,
        udp,
        ..
    } = *cmd;
    let std_sock = udp.ok_or(Error::Unexpected("udp listen without a socket"))?;
    let local = std_sock.local_addr()?;
    let msock = mio::net::UdpSocket::from_std(std_sock);

    let mut s = Socket::new(Variant::UdpListen, SocketKind::UdpListen(msock), core.tid);
    s.listening = true;
    s.reading = true;
    s.local = Some(local);
    s.recv_cb = Some(recv);
    s.extra_size = extra;
    s.parent = Some(parent.clone());

    let (key, gen) = core.insert_socket(s);
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
            core.sockets.remove(key);
            return Err(err.into());
        }
    }
    parent.register_child(ChildRef {
        worker: core.shared.clone(),
        key,
        gen,
    });
    debug!("worker {}: udp listener on {}", core.tid, local);
    Ok(())
}

pub(crate) fn connect(core: &mut WorkerCore, cmd: Box<ConnectCmd>) {
    let ConnectCmd {
        local,
        peer,
        cb,
        extra,
        ..
    } = *cmd;
    let sizes = core.mgr.udp_buf_sizes();
    let sock = match crate::sys::udp_connect(local, peer, sizes) {
        Ok(sock) => sock,
        Err(err) => {
            core.mgr.record(StatEvent::ConnectFail);
            cb(Err(err.into()));
            return;
        }
    };
    let local_addr = sock.local_addr().ok();
    let msock = mio::net::UdpSocket::from_std(sock);

    let mut s = Socket::new(Variant::Udp, SocketKind::Udp(msock), core.tid);
    s.client = true;
    s.connected = true;
    s.peer = Some(peer);
    s.local = local_addr;
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
            core.sockets.remove(key);
            core.mgr.record(StatEvent::ConnectFail);
            cb(Err(err.into()));
            return;
        }
    }
    // A UDP connect is local; the handle is ready immediately.
    let Some(handle) = socket::stream_handle(core, key) else {
        cb(Err(Error::Unexpected("udp socket without addresses")));
        return;
    };
    core.mgr.record(StatEvent::Connect);
    cb(Ok(handle));
}

pub(crate) fn io_event(core: &mut WorkerCore, key: usize, readable: bool, writable: bool) {
    if writable {
        flush_sends(core, key);
    }
    if readable {
        read_drain(core, key);
    }
}

/// Reads datagrams until the socket runs dry. Must also be called when a
/// paused or unarmed socket starts reading again, since the readiness edge
/// has already fired by then.
pub(crate) fn read_drain(core: &mut WorkerCore, key: usize) {
    loop {
        let core_ref = &mut *core;
        let Some(s) = core_ref.sockets.get_mut(key) else { return };
        if s.closing || !s.reading || s.read_paused {
            return;
        }
        let client = s.client;
        let sock = match &mut s.kind {
            SocketKind::UdpListen(sock) | SocketKind::Udp(sock) => sock,
            _ => return,
        };
        match sock.recv_from(&mut core_ref.recvbuf) {
            Ok((n, peer)) => {
                let cb = s.recv_cb.clone();
                let handle = if client {
                    socket::stream_handle(core, key)
                } else {
                    socket::datagram_handle(core, key, peer)
                };
                let Some(handle) = handle else { return };
                if let Some(cb) = cb {
                    cb(&handle, Ok(&core.recvbuf[..n]));
                }
                if client {
                    // One datagram per read call.
                    if let Some(s) = core.sockets.get_mut(key) {
                        s.reading = false;
                        s.recv_cb = None;
                    }
                    socket::stop_timer(core, key);
                    return;
                }
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                if client {
                    socket::failed_read(core, key, err.into());
                    return;
                }
                // Transient per-peer errors (ICMP rejections) on a shared
                // listener socket are not fatal.
                trace!("worker {}: udp recv error ignored: {}", core.tid, err);
            }
        }
    }
}

pub(crate) fn read_arm(core: &mut WorkerCore, key: usize, cb: RecvFn) {
    let Some(s) = core.sockets.get_mut(key) else { return };
    s.recv_cb = Some(cb);
    s.reading = true;
    if s.client {
        socket::restart_read_timer(core, key);
    }
    read_drain(core, key);
}

pub(crate) fn send(core: &mut WorkerCore, cmd: Box<SendCmd>) {
    let SendCmd {
        key,
        gen,
        handle,
        msg,
        cb,
    } = *cmd;
    let maxudp = core.mgr.maxudp();
    if maxudp != 0 && msg.len() > maxudp {
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
    let dest = if s.client { None } else { Some(handle.peer()) };
    if !s.sendq.is_empty() {
        // Keep datagram order behind an earlier blocked send.
        let mut req = SendReq::unframed(msg, cb, handle);
        req.peer = dest;
        s.sendq.push_back(req);
        return;
    }
    let sock = match &mut s.kind {
        SocketKind::UdpListen(sock) | SocketKind::Udp(sock) => sock,
        _ => unreachable!("udp send on a non-udp socket"),
    };
    let res = match dest {
        Some(peer) => sock.send_to(&msg, peer),
        None => sock.send(&msg),
    };
    match res {
        Ok(_) => {
            if let Some(cb) = cb {
                cb(&handle, Ok(()));
            }
        }
        Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
            let mut req = SendReq::unframed(msg, cb, handle);
            req.peer = dest;
            s.sendq.push_back(req);
        }
        Err(err) => {
            if let Some(cb) = cb {
                cb(&handle, Err(err.into()));
            }
        }
    }
}

fn flush_sends(core: &mut WorkerCore, key: usize) {
    loop {
        let Some(s) = core.sockets.get_mut(key) else { return };
        if s.closing {
            return;
        }
        let Some(req) = s.sendq.front() else { return };
        let dest = req.peer;
        let sock = match &mut s.kind {
            SocketKind::UdpListen(sock) | SocketKind::Udp(sock) => sock,
            _ => return,
        };
        let msg = &s.sendq.front().unwrap().msg;
        let res = match dest {
            Some(peer) => sock.send_to(msg, peer),
            None => sock.send(msg),
        };
        match res {
            Ok(_) => {
                let req = s.sendq.pop_front().unwrap();
                if let Some(cb) = req.cb {
                    cb(&req.handle, Ok(()));
                }
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
            Err(err) => {
                let req = s.sendq.pop_front().unwrap();
                if let Some(cb) = req.cb {
                    cb(&req.handle, Err(err.into()));
                }
            }
        }
    }
}

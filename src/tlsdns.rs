//! DNS over TLS: the engine between the byte stream and the TLS library.
//!
//! The rustls connection object carries the engine's ciphertext and
//! plaintext buffers, so the worker only pumps: `read_tls` moves wire
//! bytes into the engine, `process_new_packets` decrypts, the plaintext
//! reader fills the socket's reassembly buffer, and `write_tls` drains
//! queued ciphertext back to the wire. The pump (`cycle`) is guarded
//! against re-entry; it is kicked from read events, write events, sends,
//! and the accept/connect paths, and re-entering while an iteration runs
//! cannot make progress anyway.

use std::io::{ErrorKind, Read, Write};

use log::trace;

use crate::errors::{Error, Result};
use crate::event::SendCmd;
use crate::framing;
use crate::manager::StatEvent;
use crate::socket::{self, SocketKind, Variant};
use crate::tcp;
use crate::worker::WorkerCore;
use crate::{RecvFn, MAX_MESSAGE_SIZE};

/// Engine state: a fresh engine arms the handshake on its first cycle,
/// application data flows in `Io`, and `Error` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TlsPhase {
    None,
    Handshake,
    Io,
    Error,
}

pub(crate) struct TlsState {
    pub(crate) conn: rustls::Connection,
    pub(crate) phase: TlsPhase,
    in_cycle: bool,
}

impl TlsState {
    pub(crate) fn server(conn: rustls::ServerConnection) -> TlsState {
        TlsState {
            conn: rustls::Connection::Server(conn),
            phase: TlsPhase::None,
            in_cycle: false,
        }
    }

    pub(crate) fn client(conn: rustls::ClientConnection) -> TlsState {
        TlsState {
            conn: rustls::Connection::Client(conn),
            phase: TlsPhase::None,
            in_cycle: false,
        }
    }
}

pub(crate) fn io_event(core: &mut WorkerCore, key: usize, readable: bool, writable: bool) {
    let tcp_pending = core
        .sockets
        .get(key)
        .map_or(false, |s| s.connecting && !s.connected);
    if tcp_pending {
        if writable {
            tcp::connect_ready(core, key);
        }
        if !core.sockets.get(key).map_or(false, |s| s.connected) {
            return;
        }
    }
    let _ = readable;
    cycle(core, key);
}

/// One pump iteration: input (ciphertext in, handshake progress, plaintext
/// out to the reassembly buffer) then output (queued ciphertext to the
/// wire). Re-entry returns immediately.
pub(crate) fn cycle(core: &mut WorkerCore, key: usize) {
    {
        let Some(s) = core.sockets.get_mut(key) else { return };
        if s.closing {
            return;
        }
        let SocketKind::TlsDns { tls, .. } = &mut s.kind else { return };
        if tls.in_cycle || tls.phase == TlsPhase::Error {
            return;
        }
        if tls.phase == TlsPhase::None {
            tls.phase = TlsPhase::Handshake;
        }
        tls.in_cycle = true;
    }

    let res = cycle_inner(core, key);

    if let Some(s) = core.sockets.get_mut(key) {
        if let SocketKind::TlsDns { tls, .. } = &mut s.kind {
            tls.in_cycle = false;
        }
    }
    if let Err(err) = res {
        tls_failed(core, key, err);
    }
}

fn cycle_inner(core: &mut WorkerCore, key: usize) -> Result<()> {
    cycle_input(core, key)?;
    cycle_output(core, key)
}

fn cycle_input(core: &mut WorkerCore, key: usize) -> Result<()> {
    loop {
        let mut eof = false;
        let mut progressed = false;
        let hs_done;
        let plaintext;
        let peer_closed;
        {
            let Some(s) = core.sockets.get_mut(key) else { return Ok(()) };
            if s.closing {
                return Ok(());
            }
            let SocketKind::TlsDns { stream, tls } = &mut s.kind else { return Ok(()) };

            match tls.conn.read_tls(stream) {
                Ok(0) => eof = true,
                Ok(_) => progressed = true,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            let state = tls.conn.process_new_packets().map_err(Error::from)?;
            plaintext = state.plaintext_bytes_to_read();
            peer_closed = state.peer_has_closed();
            hs_done = tls.phase == TlsPhase::Handshake && !tls.conn.is_handshaking();

            if plaintext > 0 {
                let start = s.buf.len();
                s.buf.resize(start + plaintext, 0);
                let SocketKind::TlsDns { tls, .. } = &mut s.kind else { unreachable!() };
                tls.conn
                    .reader()
                    .read_exact(&mut s.buf[start..])
                    .map_err(Error::from)?;
            }
        }

        if hs_done {
            handshake_done(core, key);
        }
        if plaintext > 0 {
            framing::deliver(core, key);
        }
        if eof || peer_closed {
            let handshaking = core.sockets.get(key).map_or(false, |s| {
                matches!(&s.kind, SocketKind::TlsDns { tls, .. } if tls.phase == TlsPhase::Handshake)
            });
            let err = if handshaking {
                Error::NotConnected
            } else {
                Error::Eof
            };
            return Err(err);
        }
        if !progressed {
            return Ok(());
        }
    }
}

fn cycle_output(core: &mut WorkerCore, key: usize) -> Result<()> {
    let Some(s) = core.sockets.get_mut(key) else { return Ok(()) };
    if s.closing {
        return Ok(());
    }
    let SocketKind::TlsDns { stream, tls } = &mut s.kind else { return Ok(()) };
    while tls.conn.wants_write() {
        match tls.conn.write_tls(stream) {
            Ok(0) => break,
            Ok(_) => {}
            // Kernel pushback: the writable edge re-enters the cycle and
            // drains the rest, so at most one flight is ever in progress.
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// The handshake finished: transition to `Io` and fire the deferred
/// callback (connect on the client, accept with the receive handle on the
/// server).
fn handshake_done(core: &mut WorkerCore, key: usize) {
    let client = {
        let Some(s) = core.sockets.get_mut(key) else { return };
        if let SocketKind::TlsDns { tls, .. } = &mut s.kind {
            tls.phase = TlsPhase::Io;
        }
        s.client
    };
    trace!("worker {}: TLS handshake complete on {}", core.tid, key);

    if client {
        let s = core.sockets.get_mut(key).unwrap();
        s.connecting = false;
        let cb = s.connect_cb.take();
        socket::stop_timer(core, key);
        core.mgr.record(StatEvent::Connect);
        let Some(handle) = socket::stream_handle(core, key) else { return };
        if let Some(cb) = cb {
            cb(Ok(handle));
        }
    } else {
        let cb = core.sockets.get_mut(key).and_then(|s| s.accept_cb.take());
        if let Some(cb) = cb {
            let Some(handle) = socket::stream_handle(core, key) else { return };
            if cb(&handle).is_err() {
                socket::shutdown_socket(core, key);
            }
        }
    }
}

/// Terminal error: the engine parks in `Error`, the pending operation
/// observes the error exactly once, and the socket is torn down.
fn tls_failed(core: &mut WorkerCore, key: usize, err: Error) {
    let connecting = {
        let Some(s) = core.sockets.get_mut(key) else { return };
        if let SocketKind::TlsDns { tls, .. } = &mut s.kind {
            tls.phase = TlsPhase::Error;
        }
        s.connecting
    };
    if connecting {
        core.mgr.record(StatEvent::ConnectFail);
        let cb = core.sockets.get_mut(key).and_then(|s| s.connect_cb.take());
        if let Some(cb) = cb {
            cb(Err(err));
        }
        socket::shutdown_socket(core, key);
    } else {
        socket::failed_read(core, key, err);
    }
}

/// Framed send through the engine. `write_all` into the engine either
/// accepts the whole message or fails; success is reported as soon as the
/// engine has it, with the ciphertext drained by the following cycle.
pub(crate) fn send(core: &mut WorkerCore, cmd: Box<SendCmd>) {
    let SendCmd {
        key,
        gen,
        handle,
        msg,
        cb,
    } = *cmd;
    if msg.len() > MAX_MESSAGE_SIZE {
        if let Some(cb) = cb {
            cb(&handle, Err(Error::NoResources));
        }
        return;
    }
    let res = {
        let Some(s) = core.sock_mut(key, gen) else {
            if let Some(cb) = cb {
                cb(&handle, Err(Error::Canceled));
            }
            return;
        };
        debug_assert_eq!(s.variant, Variant::TlsDns);
        let SocketKind::TlsDns { tls, .. } = &mut s.kind else { return };
        let header = framing::frame_header(msg.len());
        let mut writer = tls.conn.writer();
        writer
            .write_all(&header)
            .and_then(|_| writer.write_all(&msg))
    };
    match res {
        Ok(()) => {
            if let Some(cb) = cb {
                cb(&handle, Ok(()));
            }
            cycle(core, key);
        }
        Err(err) => {
            if let Some(cb) = cb {
                cb(&handle, Err(err.into()));
            }
            socket::shutdown_socket(core, key);
        }
    }
}

pub(crate) fn read_arm(core: &mut WorkerCore, key: usize, cb: RecvFn) {
    let Some(s) = core.sockets.get_mut(key) else { return };
    s.recv_cb = Some(cb);
    s.reading = true;
    socket::restart_read_timer(core, key);
    framing::deliver(core, key);
    cycle(core, key);
}

pub(crate) fn resume_processing(core: &mut WorkerCore, key: usize) {
    framing::deliver(core, key);
    cycle(core, key);
}

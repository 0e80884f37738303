//! DNS over TCP: length-prefixed messages on a plain stream.
//!
//! Inbound bytes are appended to the socket's reassembly buffer and
//! complete messages delivered through [`crate::framing::deliver`], which
//! also enforces the backpressure rules (sequential mode and the
//! per-connection handle ceiling). The accept path and the outbound write
//! queue are shared with the other stream variants in [`crate::tcp`].

use std::io::{ErrorKind, Read};

use crate::errors::Error;
use crate::framing;
use crate::socket::{self, SocketKind};
use crate::tcp;
use crate::worker::WorkerCore;
use crate::RecvFn;

pub(crate) fn io_event(core: &mut WorkerCore, key: usize, readable: bool, writable: bool) {
    let connecting = core.sockets.get(key).map_or(false, |s| s.connecting);
    if connecting {
        if writable {
            tcp::connect_ready(core, key);
        }
        if core.sockets.get(key).map_or(true, |s| s.connecting) {
            return;
        }
    }
    if writable {
        tcp::flush_sends(core, key);
    }
    if readable {
        try_read(core, key);
    }
}

/// Drains the stream into the reassembly buffer, delivering complete
/// messages as they appear. Stops early when backpressure pauses reading;
/// the resume paths re-enter here because the readiness edge has already
/// been consumed by then.
pub(crate) fn try_read(core: &mut WorkerCore, key: usize) {
    loop {
        let core_ref = &mut *core;
        let Some(s) = core_ref.sockets.get_mut(key) else { return };
        if s.closing || !s.reading || s.read_paused || s.backpressured {
            return;
        }
        let stream = match &mut s.kind {
            SocketKind::TcpDns(stream) => stream,
            _ => return,
        };
        match stream.read(&mut core_ref.recvbuf) {
            Ok(0) => {
                socket::failed_read(core, key, Error::Eof);
                return;
            }
            Ok(n) => {
                s.buf.extend_from_slice(&core_ref.recvbuf[..n]);
                framing::deliver(core, key);
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
    // A full message may already be sitting in the buffer.
    framing::deliver(core, key);
    try_read(core, key);
}

pub(crate) fn resume_processing(core: &mut WorkerCore, key: usize) {
    framing::deliver(core, key);
    try_read(core, key);
}

//! The socket model shared by every transport variant.
//!
//! A `Socket` lives in its owning worker's slab and is only ever touched on
//! that worker's thread. Cross-thread interest in a socket is expressed as
//! `(key, gen)` references carried by handles and events; a generation
//! mismatch means the slab slot was recycled and the referenced socket is
//! gone.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::trace;
use mio::{Interest, Registry, Token};

use crate::errors::Error;
use crate::handle::{Handle, HandleInner};
use crate::listener::ListenerShared;
use crate::manager::StatEvent;
use crate::quota::Quota;
use crate::tlsdns::TlsState;
use crate::worker::WorkerCore;
use crate::{AcceptFn, ConnectFn, RecvFn, SendFn, STREAM_CLIENTS_PER_CONN, TIMEOUT_SLACK_MS};

/// Transport variant of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Variant {
    UdpListen,
    Udp,
    TcpListen,
    Tcp,
    TcpDnsListen,
    TcpDns,
    TlsDnsListen,
    TlsDns,
}

/// Configuration shared by every connection accepted from one listener
/// child.
pub(crate) struct ChildCfg {
    pub(crate) recv: RecvFn,
    pub(crate) accept: Option<AcceptFn>,
    pub(crate) quota: Option<Arc<Quota>>,
    pub(crate) extra: usize,
}

/// Variant payload: the underlying I/O object plus per-variant state.
pub(crate) enum SocketKind {
    UdpListen(mio::net::UdpSocket),
    Udp(mio::net::UdpSocket),
    TcpListen {
        sock: mio::net::TcpListener,
        child: Arc<ChildCfg>,
    },
    Tcp(mio::net::TcpStream),
    TcpDnsListen {
        sock: mio::net::TcpListener,
        child: Arc<ChildCfg>,
    },
    TcpDns(mio::net::TcpStream),
    TlsDnsListen {
        sock: mio::net::TcpListener,
        child: Arc<ChildCfg>,
        tls: Arc<rustls::ServerConfig>,
    },
    TlsDns {
        stream: mio::net::TcpStream,
        tls: TlsState,
    },
    /// The I/O object has been closed; the socket lingers only until its
    /// outstanding handles are released.
    Closed,
}

/// One queued outbound message. The header is skipped (offset 2) on
/// unframed variants; framed variants write it ahead of the caller's bytes
/// without copying them.
pub(crate) struct SendReq {
    pub(crate) header: [u8; 2],
    pub(crate) hoff: usize,
    pub(crate) msg: Vec<u8>,
    pub(crate) moff: usize,
    /// Explicit destination for unconnected datagram sockets.
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) cb: Option<SendFn>,
    pub(crate) handle: Handle,
}

impl SendReq {
    pub(crate) fn framed(msg: Vec<u8>, cb: Option<SendFn>, handle: Handle) -> SendReq {
        let header = crate::framing::frame_header(msg.len());
        SendReq {
            header,
            hoff: 0,
            msg,
            moff: 0,
            peer: None,
            cb,
            handle,
        }
    }

    pub(crate) fn unframed(msg: Vec<u8>, cb: Option<SendFn>, handle: Handle) -> SendReq {
        SendReq {
            header: [0; 2],
            hoff: 2,
            msg,
            moff: 0,
            peer: None,
            cb,
            handle,
        }
    }

    /// Accounts for `n` bytes written (header first). Returns `true` once
    /// the request is fully on the wire.
    pub(crate) fn advance(&mut self, mut n: usize) -> bool {
        let take = (self.header.len() - self.hoff).min(n);
        self.hoff += take;
        n -= take;
        self.moff += n;
        debug_assert!(self.moff <= self.msg.len());
        self.hoff == self.header.len() && self.moff >= self.msg.len()
    }
}

/// Tracks the handles alive on one socket: a dense array indexed by slot,
/// grown by doubling, with a LIFO stack of free slots. `len()` equals the
/// number of claimed slots at all times.
pub(crate) struct ActiveHandles {
    slots: Vec<Option<Weak<HandleInner>>>,
    frees: Vec<u32>,
    count: usize,
}

impl ActiveHandles {
    pub(crate) fn new() -> ActiveHandles {
        ActiveHandles {
            slots: Vec::new(),
            frees: Vec::new(),
            count: 0,
        }
    }

    fn grow(&mut self) {
        let old = self.slots.len();
        let new = (old * 2).max(8);
        self.slots.resize_with(new, || None);
        for i in (old..new).rev() {
            self.frees.push(i as u32);
        }
    }

    pub(crate) fn claim(&mut self, weak: Weak<HandleInner>) -> u32 {
        if self.frees.is_empty() {
            self.grow();
        }
        let slot = self.frees.pop().unwrap();
        debug_assert!(self.slots[slot as usize].is_none());
        self.slots[slot as usize] = Some(weak);
        self.count += 1;
        slot
    }

    pub(crate) fn set(&mut self, slot: u32, weak: Weak<HandleInner>) {
        debug_assert!(self.slots[slot as usize].is_some());
        self.slots[slot as usize] = Some(weak);
    }

    pub(crate) fn release(&mut self, slot: u32) {
        if let Some(entry) = self.slots.get_mut(slot as usize) {
            if entry.take().is_some() {
                self.count -= 1;
                self.frees.push(slot);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }
}

pub(crate) struct Socket {
    pub(crate) tid: usize,
    pub(crate) gen: u64,
    pub(crate) variant: Variant,
    pub(crate) kind: SocketKind,

    pub(crate) peer: Option<SocketAddr>,
    pub(crate) local: Option<SocketAddr>,

    pub(crate) closing: bool,
    pub(crate) destroying: bool,
    pub(crate) connecting: bool,
    pub(crate) connected: bool,
    pub(crate) listening: bool,
    pub(crate) reading: bool,
    /// Reading stopped by `pause_read`.
    pub(crate) read_paused: bool,
    /// Reading stopped because downstream consumers fell behind.
    pub(crate) backpressured: bool,
    pub(crate) sequential: bool,
    pub(crate) client: bool,
    pub(crate) keepalive: bool,
    /// A server stream connection has delivered at least one message; the
    /// read timer switches from the initial to the idle timeout.
    pub(crate) got_message: bool,
    /// Listener stopped accepting while waiting for quota.
    pub(crate) accept_paused: bool,
    /// Admitted over the soft quota mark.
    pub(crate) overquota: bool,

    pub(crate) recv_cb: Option<RecvFn>,
    pub(crate) accept_cb: Option<AcceptFn>,
    pub(crate) connect_cb: Option<ConnectFn>,

    /// Stream reassembly buffer.
    pub(crate) buf: Vec<u8>,
    pub(crate) sendq: VecDeque<SendReq>,

    pub(crate) ah: ActiveHandles,
    pub(crate) statichandle: Option<Weak<HandleInner>>,
    pub(crate) extra_size: usize,

    pub(crate) quota: Option<Arc<Quota>>,
    pub(crate) last_quota_log: Option<Instant>,

    pub(crate) timer_epoch: u64,
    pub(crate) timer_armed: bool,
    pub(crate) read_timeout_override: Option<u64>,
    pub(crate) connect_timeout_ms: u64,

    pub(crate) parent: Option<Arc<ListenerShared>>,
}

impl Socket {
    pub(crate) fn new(variant: Variant, kind: SocketKind, tid: usize) -> Socket {
        Socket {
            tid,
            gen: 0,
            variant,
            kind,
            peer: None,
            local: None,
            closing: false,
            destroying: false,
            connecting: false,
            connected: false,
            listening: false,
            reading: false,
            read_paused: false,
            backpressured: false,
            sequential: false,
            client: false,
            keepalive: false,
            got_message: false,
            accept_paused: false,
            overquota: false,
            recv_cb: None,
            accept_cb: None,
            connect_cb: None,
            buf: Vec::new(),
            sendq: VecDeque::new(),
            ah: ActiveHandles::new(),
            statichandle: None,
            extra_size: 0,
            quota: None,
            last_quota_log: None,
            timer_epoch: 0,
            timer_armed: false,
            read_timeout_override: None,
            connect_timeout_ms: 0,
            parent: None,
        }
    }

    /// Rate limit for quota rejection logging: at most one line a second.
    pub(crate) fn should_log_quota(&mut self) -> bool {
        let now = Instant::now();
        match self.last_quota_log {
            Some(last) if now.duration_since(last) < Duration::from_secs(1) => false,
            _ => {
                self.last_quota_log = Some(now);
                true
            }
        }
    }
}

pub(crate) fn register(
    registry: &Registry,
    kind: &mut SocketKind,
    key: usize,
    interests: Interest,
) -> io::Result<()> {
    let token = Token(key);
    match kind {
        SocketKind::UdpListen(s) | SocketKind::Udp(s) => registry.register(s, token, interests),
        SocketKind::TcpListen { sock, .. }
        | SocketKind::TcpDnsListen { sock, .. }
        | SocketKind::TlsDnsListen { sock, .. } => registry.register(sock, token, interests),
        SocketKind::Tcp(s) | SocketKind::TcpDns(s) => registry.register(s, token, interests),
        SocketKind::TlsDns { stream, .. } => registry.register(stream, token, interests),
        SocketKind::Closed => Ok(()),
    }
}

fn deregister(registry: &Registry, kind: &mut SocketKind) {
    let _ = match kind {
        SocketKind::UdpListen(s) | SocketKind::Udp(s) => registry.deregister(s),
        SocketKind::TcpListen { sock, .. }
        | SocketKind::TcpDnsListen { sock, .. }
        | SocketKind::TlsDnsListen { sock, .. } => registry.deregister(sock),
        SocketKind::Tcp(s) | SocketKind::TcpDns(s) => registry.deregister(s),
        SocketKind::TlsDns { stream, .. } => registry.deregister(stream),
        SocketKind::Closed => Ok(()),
    };
}

fn new_handle(core: &mut WorkerCore, key: usize, peer: SocketAddr, local: SocketAddr) -> Handle {
    let worker = core.shared.clone();
    let s = &mut core.sockets[key];
    let slot = s.ah.claim(Weak::new());
    let inner = Arc::new(HandleInner::new(
        worker,
        key,
        s.gen,
        slot,
        peer,
        local,
        s.extra_size,
    ));
    s.ah.set(slot, Arc::downgrade(&inner));
    Handle::from_inner(inner)
}

/// Handle for a connection-oriented socket. Client sockets and plain TCP
/// connections represent a single conversation and reuse one handle through
/// the weak `statichandle` link; DNS server connections get a fresh handle
/// per message.
pub(crate) fn stream_handle(core: &mut WorkerCore, key: usize) -> Option<Handle> {
    let s = core.sockets.get_mut(key)?;
    if let Some(weak) = &s.statichandle {
        if let Some(inner) = weak.upgrade() {
            return Some(Handle::from_inner(inner));
        }
    }
    let peer = s.peer?;
    let local = s.local.or(s.peer)?;
    let wants_static = s.client || s.variant == Variant::Tcp;
    let handle = new_handle(core, key, peer, local);
    if wants_static {
        core.sockets[key].statichandle = Some(handle.downgrade());
    }
    Some(handle)
}

/// Per-datagram handle on a UDP listener child.
pub(crate) fn datagram_handle(core: &mut WorkerCore, key: usize, peer: SocketAddr) -> Option<Handle> {
    let s = core.sockets.get(key)?;
    let local = s.local.unwrap_or(peer);
    Some(new_handle(core, key, peer, local))
}

/// Arms (or re-arms) the read timer from the handle override or the
/// manager-wide timeouts. Zero disables the timer.
pub(crate) fn restart_read_timer(core: &mut WorkerCore, key: usize) {
    let timeouts = core.mgr.timeouts();
    let Some(s) = core.sockets.get_mut(key) else { return };
    let ms = s.read_timeout_override.unwrap_or(if s.keepalive {
        timeouts.keepalive
    } else if s.got_message {
        timeouts.idle
    } else {
        timeouts.init
    });
    s.timer_epoch += 1;
    if ms == 0 {
        s.timer_armed = false;
        return;
    }
    s.timer_armed = true;
    let epoch = s.timer_epoch;
    core.timers.arm(key, epoch, Duration::from_millis(ms));
}

pub(crate) fn stop_timer(core: &mut WorkerCore, key: usize) {
    if let Some(s) = core.sockets.get_mut(key) {
        s.timer_epoch += 1;
        s.timer_armed = false;
    }
}

/// Arms the connect timer with a little slack past the kernel-level
/// timeout so the kernel reports first when it can.
pub(crate) fn arm_connect_timer(core: &mut WorkerCore, key: usize) {
    let Some(s) = core.sockets.get_mut(key) else { return };
    let timeout_ms = s.connect_timeout_ms;
    if timeout_ms == 0 {
        return;
    }
    s.timer_epoch += 1;
    s.timer_armed = true;
    let epoch = s.timer_epoch;
    core.timers.arm(key, epoch, Duration::from_millis(timeout_ms + TIMEOUT_SLACK_MS));
}

/// The socket's logical timer expired: connect timeout while connecting,
/// read timeout otherwise.
pub(crate) fn timeout_fired(core: &mut WorkerCore, key: usize) {
    let Some(s) = core.sockets.get_mut(key) else { return };
    if s.closing {
        return;
    }
    if s.connecting {
        let cb = s.connect_cb.take();
        core.mgr.record(StatEvent::ConnectFail);
        if let Some(cb) = cb {
            cb(Err(Error::TimedOut));
        }
        shutdown_socket(core, key);
    } else {
        core.mgr.record(StatEvent::ReadTimeout);
        failed_read(core, key, Error::TimedOut);
    }
}

/// Fails an in-progress read: the receive callback observes the explicit
/// result exactly once and the socket is torn down.
pub(crate) fn failed_read(core: &mut WorkerCore, key: usize, err: Error) {
    let Some(s) = core.sockets.get_mut(key) else { return };
    if s.closing {
        return;
    }
    let cb = s.recv_cb.clone();
    let deliver = s.reading || !s.client;
    s.reading = false;
    if deliver {
        if let Some(cb) = cb {
            if let Some(handle) = stream_handle(core, key) {
                cb(&handle, Err(err));
            }
        }
    }
    shutdown_socket(core, key);
}

/// Initiates teardown: pending operations fail with `Canceled`, the I/O
/// object closes, quota is released and any deferred accept resumed. The
/// slab entry survives until the last active handle is released.
pub(crate) fn shutdown_socket(core: &mut WorkerCore, key: usize) {
    let core_ref = &mut *core;
    let registry = core_ref.poll.registry();
    let Some(s) = core_ref.sockets.get_mut(key) else { return };
    if s.closing {
        return;
    }
    trace!("worker {}: closing socket {} ({:?})", s.tid, key, s.variant);
    s.closing = true;
    s.reading = false;
    s.connecting = false;
    s.listening = false;
    s.timer_epoch += 1;
    s.timer_armed = false;

    let connect_cb = s.connect_cb.take();
    let pending: Vec<SendReq> = s.sendq.drain(..).collect();
    s.recv_cb = None;
    s.accept_cb = None;
    s.statichandle = None;
    s.parent = None;
    let quota = s.quota.take();

    if let SocketKind::TlsDns { stream, tls } = &mut s.kind {
        tls.conn.send_close_notify();
        let _ = tls.conn.write_tls(stream);
    }
    deregister(registry, &mut s.kind);
    s.kind = SocketKind::Closed;

    let gone = s.ah.len() == 0;
    if !gone {
        s.destroying = true;
    }

    if let Some(cb) = connect_cb {
        cb(Err(Error::Canceled));
    }
    for req in pending {
        if let Some(cb) = req.cb {
            cb(&req.handle, Err(Error::Canceled));
        }
    }
    if let Some(quota) = quota {
        quota.release_and_wake();
    }
    if gone {
        core.sockets.remove(key);
    }
}

/// A handle released its active-table slot (always executed on the owning
/// worker, however the release was initiated). Clears the static link if it
/// died, resumes backpressured reads, and completes a deferred teardown.
pub(crate) fn detach_handle(core: &mut WorkerCore, key: usize, gen: u64, slot: u32) {
    let Some(s) = core.sock_mut(key, gen) else { return };
    s.ah.release(slot);
    if let Some(weak) = &s.statichandle {
        if weak.upgrade().is_none() {
            s.statichandle = None;
        }
    }

    // A client conversation whose last handle is gone can never be
    // addressed again.
    let abandoned = s.client && !s.closing && !s.connecting && s.ah.len() == 0;
    if abandoned {
        shutdown_socket(core, key);
        return;
    }
    let Some(s) = core.sock_mut(key, gen) else { return };

    let below = if s.sequential {
        s.ah.len() == 0
    } else {
        s.ah.len() < STREAM_CLIENTS_PER_CONN
    };
    if s.backpressured && !s.closing && below {
        s.backpressured = false;
        match s.variant {
            Variant::TcpDns => crate::tcpdns::resume_processing(core, key),
            Variant::TlsDns => crate::tlsdns::resume_processing(core, key),
            _ => {}
        }
    }

    if let Some(s) = core.sockets.get(key) {
        if s.gen == gen && s.destroying && s.ah.len() == 0 {
            core.sockets.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_handle_table_invariant() {
        let mut ah = ActiveHandles::new();
        let a = ah.claim(Weak::new());
        let b = ah.claim(Weak::new());
        let c = ah.claim(Weak::new());
        assert_eq!(ah.len(), 3);
        assert_ne!(a, b);
        assert_ne!(b, c);

        // Releasing returns the slot to the top of the free stack.
        ah.release(b);
        assert_eq!(ah.len(), 2);
        let d = ah.claim(Weak::new());
        assert_eq!(d, b);
        assert_eq!(ah.len(), 3);

        // Double release is ignored.
        ah.release(a);
        ah.release(a);
        assert_eq!(ah.len(), 2);
    }

    #[test]
    fn active_handle_table_grows_by_doubling() {
        let mut ah = ActiveHandles::new();
        let mut slots = Vec::new();
        for _ in 0..40 {
            slots.push(ah.claim(Weak::new()));
        }
        assert_eq!(ah.len(), 40);
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 40);
    }
}

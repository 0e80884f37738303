//! Cross-thread events.
//!
//! Workers never share socket state; every operation that originates off
//! the owning worker travels as one of these values through the worker's
//! queues. An event owns everything the worker needs to execute it, so
//! callbacks and buffers move with the message.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;

use crate::handle::Handle;
use crate::listener::{ListenerShared, SyncPoint};
use crate::quota::Quota;
use crate::{AcceptFn, ConnectFn, RecvFn, SendFn};

/// Stream or datagram flavor of a listener.
pub(crate) enum ListenProto {
    Udp,
    Tcp,
    TcpDns,
    TlsDns(Arc<rustls::ServerConfig>),
}

/// Flavor of an outgoing connection.
pub(crate) enum ConnectProto {
    Udp,
    Tcp,
    TcpDns,
    TlsDns {
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    },
}

/// Tells a worker to adopt one pre-bound child socket of a listener.
pub(crate) struct ListenCmd {
    pub(crate) proto: ListenProto,
    pub(crate) tcp: Option<std::net::TcpListener>,
    pub(crate) udp: Option<std::net::UdpSocket>,
    pub(crate) recv: RecvFn,
    pub(crate) accept: Option<AcceptFn>,
    pub(crate) quota: Option<Arc<Quota>>,
    pub(crate) extra: usize,
    pub(crate) parent: Arc<ListenerShared>,
    pub(crate) done: Arc<SyncPoint>,
}

/// Tells a worker to start an outgoing connection.
pub(crate) struct ConnectCmd {
    pub(crate) proto: ConnectProto,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) peer: SocketAddr,
    pub(crate) cb: ConnectFn,
    pub(crate) timeout_ms: u64,
    pub(crate) extra: usize,
}

/// Queues one outbound message on a socket.
pub(crate) struct SendCmd {
    pub(crate) key: usize,
    pub(crate) gen: u64,
    pub(crate) handle: Handle,
    pub(crate) msg: Vec<u8>,
    pub(crate) cb: Option<SendFn>,
}

pub(crate) enum NetEvent {
    // Priority class: processed even while the worker is paused.
    Pause,
    Resume,
    Stop,

    // Privileged and task classes.
    Listen(Box<ListenCmd>),
    StopListening {
        key: usize,
        gen: u64,
        done: Arc<SyncPoint>,
    },
    Shutdown,

    // Normal class: user I/O and socket control.
    Connect(Box<ConnectCmd>),
    Send(Box<SendCmd>),
    Read {
        key: usize,
        gen: u64,
        cb: RecvFn,
        handle: Handle,
    },
    CancelRead {
        key: usize,
        gen: u64,
    },
    PauseRead {
        key: usize,
        gen: u64,
    },
    ResumeRead {
        key: usize,
        gen: u64,
    },
    DetachHandle {
        key: usize,
        gen: u64,
        slot: u32,
    },
    SetTimeout {
        key: usize,
        gen: u64,
        ms: u64,
    },
    Sequential {
        key: usize,
        gen: u64,
        on: bool,
    },
    Keepalive {
        key: usize,
        gen: u64,
        on: bool,
    },
    QuotaFreed {
        key: usize,
        gen: u64,
    },
    Cycle {
        key: usize,
        gen: u64,
    },
}

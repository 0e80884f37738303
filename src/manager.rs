//! The manager: worker pool lifecycle and process-wide settings.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;

use log::{debug, warn};
use mio::{Poll, Waker};
use rustls::pki_types::ServerName;

use crate::errors::{Error, Result};
use crate::event::{ConnectCmd, ConnectProto, ListenCmd, ListenProto, NetEvent};
use crate::listener::{Listener, ListenerShared, SyncPoint};
use crate::queue::{EventQueues, QueueKind};
use crate::quota::Quota;
use crate::sys::{self, BufSizes};
use crate::worker::{current_worker, WorkerCore, WorkerShared, WAKE_TOKEN};
use crate::{AcceptFn, ConnectFn, RecvFn};

/// Interlock owner id used by non-net threads.
const INTERLOCK_EXTERNAL: usize = usize::MAX;

/// The four manager-wide timeouts, in milliseconds. Zero disables the
/// corresponding timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Read timeout on a server connection before its first message.
    pub init: u64,
    /// Read timeout between messages.
    pub idle: u64,
    /// Read timeout while a connection is marked keep-alive.
    pub keepalive: u64,
    /// Keep-alive value advertised to clients; not acted on here.
    pub advertised: u64,
}

/// Counter edges reported to an attached statistics sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StatEvent {
    Accept,
    AcceptFail,
    Connect,
    ConnectFail,
    ReadTimeout,
    QuotaDeferred,
}

/// Receives counter edges; the DNS layers aggregate them.
pub trait StatsSink: Send + Sync {
    fn record(&self, event: StatEvent);
}

/// Options for the `listen_*` family.
#[derive(Clone)]
pub struct ListenOpts {
    /// Listen backlog for stream sockets.
    pub backlog: u32,
    /// Admission control shared across the listener's children.
    pub quota: Option<Arc<Quota>>,
    /// Bytes co-allocated with every handle, reachable through
    /// [`crate::Handle::with_extra`].
    pub extra_handle_size: usize,
}

impl Default for ListenOpts {
    fn default() -> ListenOpts {
        ListenOpts {
            backlog: 128,
            quota: None,
            extra_handle_size: 0,
        }
    }
}

/// Options for the `connect_*` family.
#[derive(Clone, Copy)]
pub struct ConnectOpts {
    /// Connect (and, for TLS, handshake) timeout in milliseconds; zero
    /// disables the timer.
    pub timeout_ms: u64,
    /// Bytes co-allocated with the connection's handle.
    pub extra_handle_size: usize,
}

impl Default for ConnectOpts {
    fn default() -> ConnectOpts {
        ConnectOpts {
            timeout_ms: 30_000,
            extra_handle_size: 0,
        }
    }
}

struct MgrState {
    paused_workers: usize,
    running_workers: usize,
    interlock: Option<usize>,
}

pub(crate) struct ManagerShared {
    pub(crate) workers: Vec<Arc<WorkerShared>>,

    init: AtomicU64,
    idle: AtomicU64,
    keepalive: AtomicU64,
    advertised: AtomicU64,

    tcp_recvbuf: AtomicUsize,
    tcp_sendbuf: AtomicUsize,
    udp_recvbuf: AtomicUsize,
    udp_sendbuf: AtomicUsize,
    maxudp: AtomicUsize,

    closing: AtomicBool,
    paused: AtomicBool,
    state: Mutex<MgrState>,
    state_cv: Condvar,
    /// Fences for the global pause/resume transitions, sized to the
    /// worker count.
    pub(crate) pausing: Barrier,
    pub(crate) resuming: Barrier,

    stats: Mutex<Option<Arc<dyn StatsSink>>>,
    next_worker: AtomicUsize,
}

impl ManagerShared {
    pub(crate) fn timeouts(&self) -> Timeouts {
        Timeouts {
            init: self.init.load(Ordering::Acquire),
            idle: self.idle.load(Ordering::Acquire),
            keepalive: self.keepalive.load(Ordering::Acquire),
            advertised: self.advertised.load(Ordering::Acquire),
        }
    }

    pub(crate) fn tcp_buf_sizes(&self) -> BufSizes {
        BufSizes {
            recv: self.tcp_recvbuf.load(Ordering::Acquire),
            send: self.tcp_sendbuf.load(Ordering::Acquire),
        }
    }

    pub(crate) fn udp_buf_sizes(&self) -> BufSizes {
        BufSizes {
            recv: self.udp_recvbuf.load(Ordering::Acquire),
            send: self.udp_sendbuf.load(Ordering::Acquire),
        }
    }

    pub(crate) fn maxudp(&self) -> usize {
        self.maxudp.load(Ordering::Acquire)
    }

    pub(crate) fn closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn record(&self, event: StatEvent) {
        let sink = self.stats.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.record(event);
        }
    }

    fn pick_worker(&self) -> Arc<WorkerShared> {
        let i = self.next_worker.fetch_add(1, Ordering::AcqRel) % self.workers.len();
        self.workers[i].clone()
    }

    pub(crate) fn note_paused(&self) {
        let mut state = self.state.lock().unwrap();
        state.paused_workers += 1;
        self.state_cv.notify_all();
    }

    pub(crate) fn note_resumed(&self) {
        let mut state = self.state.lock().unwrap();
        state.paused_workers -= 1;
        self.state_cv.notify_all();
    }

    pub(crate) fn note_exited(&self) {
        let mut state = self.state.lock().unwrap();
        state.running_workers -= 1;
        self.state_cv.notify_all();
    }

    /// Waits until the single interlock token is free, then takes it.
    fn force_acquire_interlock(&self, owner: usize) {
        let mut state = self.state.lock().unwrap();
        while state.interlock.is_some() {
            state = self.state_cv.wait(state).unwrap();
        }
        state.interlock = Some(owner);
    }

    fn release_interlock(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.interlock.is_some());
        state.interlock = None;
        self.state_cv.notify_all();
    }

    fn wait_all_paused(&self) {
        let mut state = self.state.lock().unwrap();
        while state.paused_workers < state.running_workers {
            state = self.state_cv.wait(state).unwrap();
        }
    }

    fn wait_none_paused(&self) {
        let mut state = self.state.lock().unwrap();
        while state.paused_workers > 0 {
            state = self.state_cv.wait(state).unwrap();
        }
    }
}

/// Owns the worker pool. Dropping the manager stops and joins every
/// worker; outstanding handles and listeners fail their operations with
/// [`Error::Canceled`] from then on.
pub struct Manager {
    shared: Arc<ManagerShared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Manager {
    /// Spawns `workers` event-loop threads (at least one) and returns the
    /// manager once they are all running.
    pub fn new(workers: usize) -> Result<Manager> {
        let n = workers.max(1);
        let mut shareds = Vec::with_capacity(n);
        let mut cores = Vec::with_capacity(n);
        for tid in 0..n {
            let poll = Poll::new()?;
            let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
            let (queues, rx) = EventQueues::new(waker);
            shareds.push(Arc::new(WorkerShared { tid, queues }));
            cores.push((poll, rx));
        }

        let shared = Arc::new(ManagerShared {
            workers: shareds,
            init: AtomicU64::new(30_000),
            idle: AtomicU64::new(30_000),
            keepalive: AtomicU64::new(30_000),
            advertised: AtomicU64::new(30_000),
            tcp_recvbuf: AtomicUsize::new(0),
            tcp_sendbuf: AtomicUsize::new(0),
            udp_recvbuf: AtomicUsize::new(0),
            udp_sendbuf: AtomicUsize::new(0),
            maxudp: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            state: Mutex::new(MgrState {
                paused_workers: 0,
                running_workers: n,
                interlock: None,
            }),
            state_cv: Condvar::new(),
            pausing: Barrier::new(n),
            resuming: Barrier::new(n),
            stats: Mutex::new(None),
            next_worker: AtomicUsize::new(0),
        });

        let mut threads = Vec::with_capacity(n);
        for (tid, (poll, rx)) in cores.into_iter().enumerate() {
            let mgr = shared.clone();
            let wshared = shared.workers[tid].clone();
            let spawned = thread::Builder::new()
                .name(format!("netmgr-{tid}"))
                .spawn(move || WorkerCore::new(mgr, wshared, poll, rx).run());
            match spawned {
                Ok(t) => threads.push(t),
                Err(err) => {
                    for w in &shared.workers {
                        let _ = w.queues.post(QueueKind::Priority, NetEvent::Stop);
                    }
                    for t in threads {
                        let _ = t.join();
                    }
                    return Err(err.into());
                }
            }
        }
        debug!("manager started with {} workers", n);
        Ok(Manager {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Number of event-loop workers.
    pub fn workers(&self) -> usize {
        self.shared.workers.len()
    }

    /// Sets the manager-wide timeouts, in milliseconds.
    pub fn set_timeouts(&self, timeouts: Timeouts) {
        self.shared.init.store(timeouts.init, Ordering::Release);
        self.shared.idle.store(timeouts.idle, Ordering::Release);
        self.shared.keepalive.store(timeouts.keepalive, Ordering::Release);
        self.shared.advertised.store(timeouts.advertised, Ordering::Release);
    }

    /// Current manager-wide timeouts.
    pub fn timeouts(&self) -> Timeouts {
        self.shared.timeouts()
    }

    /// Kernel buffer sizes applied to stream sockets at creation; zero
    /// keeps the system default.
    pub fn set_tcp_buffer_sizes(&self, recv: usize, send: usize) {
        self.shared.tcp_recvbuf.store(recv, Ordering::Release);
        self.shared.tcp_sendbuf.store(send, Ordering::Release);
    }

    /// Kernel buffer sizes applied to datagram sockets at creation.
    pub fn set_udp_buffer_sizes(&self, recv: usize, send: usize) {
        self.shared.udp_recvbuf.store(recv, Ordering::Release);
        self.shared.udp_sendbuf.store(send, Ordering::Release);
    }

    /// Caps outbound UDP message size; larger sends fail with
    /// [`Error::NoResources`]. Zero disables the cap.
    pub fn set_maxudp(&self, max: usize) {
        self.shared.maxudp.store(max, Ordering::Release);
    }

    /// Attaches a statistics sink.
    pub fn set_stats(&self, sink: Arc<dyn StatsSink>) {
        *self.shared.stats.lock().unwrap() = Some(sink);
    }

    /// Pauses every worker. When this returns, no normal or task event is
    /// executing or will execute until [`Manager::resume`]. Must not be
    /// called from a net thread or from inside a callback.
    pub fn pause(&self) {
        assert!(
            current_worker().is_none(),
            "pause called from a net thread"
        );
        self.shared.force_acquire_interlock(INTERLOCK_EXTERNAL);
        let was = self.shared.paused.swap(true, Ordering::AcqRel);
        assert!(!was, "manager already paused");
        for w in &self.shared.workers {
            let _ = w.queues.post(QueueKind::Priority, NetEvent::Pause);
        }
        self.shared.wait_all_paused();
        debug!("manager paused");
    }

    /// Resumes a paused manager and releases the interlock.
    pub fn resume(&self) {
        assert!(
            current_worker().is_none(),
            "resume called from a net thread"
        );
        assert!(self.shared.paused.load(Ordering::Acquire), "manager not paused");
        for w in &self.shared.workers {
            let _ = w.queues.post(QueueKind::Priority, NetEvent::Resume);
        }
        self.shared.wait_none_paused();
        self.shared.paused.store(false, Ordering::Release);
        self.shared.release_interlock();
        debug!("manager resumed");
    }

    /// Starts manager-wide shutdown: every worker walks its sockets and
    /// tears them down, pending operations observing `Canceled`. The
    /// workers keep running until the manager is dropped.
    pub fn shutdown(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("manager shutting down");
        for w in &self.shared.workers {
            let _ = w.queues.post(QueueKind::Task, NetEvent::Shutdown);
        }
    }

    fn listen_stream(
        &self,
        proto: &dyn Fn() -> ListenProto,
        addr: SocketAddr,
        recv: RecvFn,
        accept: Option<AcceptFn>,
        opts: ListenOpts,
    ) -> Result<Listener> {
        if self.shared.closing() {
            return Err(Error::Canceled);
        }
        let n = self.shared.workers.len();
        let (socks, resolved) =
            sys::tcp_listen_fanout(addr, n, opts.backlog, self.shared.tcp_buf_sizes())?;
        let parent = ListenerShared::new(resolved);
        let done = SyncPoint::new(n);
        for (i, sock) in socks.into_iter().enumerate() {
            let cmd = ListenCmd {
                proto: proto(),
                tcp: Some(sock),
                udp: None,
                recv: recv.clone(),
                accept: accept.clone(),
                quota: opts.quota.clone(),
                extra: opts.extra_handle_size,
                parent: parent.clone(),
                done: done.clone(),
            };
            let posted = self.shared.workers[i]
                .queues
                .post(QueueKind::Privileged, NetEvent::Listen(Box::new(cmd)));
            if posted.is_err() {
                done.signal(Err(Error::Canceled));
            }
        }
        // Children started so far are stopped through the listener's drop
        // if any worker reported failure.
        let listener = Listener::new(parent);
        done.wait()?;
        Ok(listener)
    }

    /// Starts a UDP listener with one child socket per worker.
    pub fn listen_udp(&self, addr: SocketAddr, recv: RecvFn, opts: ListenOpts) -> Result<Listener> {
        if self.shared.closing() {
            return Err(Error::Canceled);
        }
        let n = self.shared.workers.len();
        let (socks, resolved) = sys::udp_listen_fanout(addr, n, self.shared.udp_buf_sizes())?;
        let parent = ListenerShared::new(resolved);
        let done = SyncPoint::new(n);
        for (i, sock) in socks.into_iter().enumerate() {
            let cmd = ListenCmd {
                proto: ListenProto::Udp,
                tcp: None,
                udp: Some(sock),
                recv: recv.clone(),
                accept: None,
                quota: opts.quota.clone(),
                extra: opts.extra_handle_size,
                parent: parent.clone(),
                done: done.clone(),
            };
            let posted = self.shared.workers[i]
                .queues
                .post(QueueKind::Privileged, NetEvent::Listen(Box::new(cmd)));
            if posted.is_err() {
                done.signal(Err(Error::Canceled));
            }
        }
        let listener = Listener::new(parent);
        done.wait()?;
        Ok(listener)
    }

    /// Starts a plain TCP byte-stream listener.
    pub fn listen_tcp(
        &self,
        addr: SocketAddr,
        recv: RecvFn,
        accept: Option<AcceptFn>,
        opts: ListenOpts,
    ) -> Result<Listener> {
        self.listen_stream(&|| ListenProto::Tcp, addr, recv, accept, opts)
    }

    /// Starts a DNS-over-TCP listener (16-bit length-prefixed messages).
    pub fn listen_tcpdns(
        &self,
        addr: SocketAddr,
        recv: RecvFn,
        accept: Option<AcceptFn>,
        opts: ListenOpts,
    ) -> Result<Listener> {
        self.listen_stream(&|| ListenProto::TcpDns, addr, recv, accept, opts)
    }

    /// Starts a DNS-over-TLS listener using the given server configuration.
    pub fn listen_tlsdns(
        &self,
        addr: SocketAddr,
        recv: RecvFn,
        accept: Option<AcceptFn>,
        opts: ListenOpts,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<Listener> {
        self.listen_stream(&|| ListenProto::TlsDns(tls.clone()), addr, recv, accept, opts)
    }

    fn do_connect(
        &self,
        proto: ConnectProto,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectFn,
        opts: ConnectOpts,
    ) -> Result<()> {
        if self.shared.closing() {
            return Err(Error::Canceled);
        }
        let worker = self.shared.pick_worker();
        let cmd = ConnectCmd {
            proto,
            local,
            peer,
            cb,
            timeout_ms: opts.timeout_ms,
            extra: opts.extra_handle_size,
        };
        if worker
            .queues
            .post(QueueKind::Normal, NetEvent::Connect(Box::new(cmd)))
            .is_err()
        {
            warn!("connect to {} dropped: workers are gone", peer);
            return Err(Error::Canceled);
        }
        Ok(())
    }

    /// Creates a connected UDP socket; the callback receives its handle.
    pub fn connect_udp(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectFn,
        opts: ConnectOpts,
    ) -> Result<()> {
        self.do_connect(ConnectProto::Udp, local, peer, cb, opts)
    }

    /// Starts a plain TCP connection.
    pub fn connect_tcp(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectFn,
        opts: ConnectOpts,
    ) -> Result<()> {
        self.do_connect(ConnectProto::Tcp, local, peer, cb, opts)
    }

    /// Starts a DNS-over-TCP connection.
    pub fn connect_tcpdns(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectFn,
        opts: ConnectOpts,
    ) -> Result<()> {
        self.do_connect(ConnectProto::TcpDns, local, peer, cb, opts)
    }

    /// Starts a DNS-over-TLS connection; the callback fires only once the
    /// handshake has completed.
    pub fn connect_tlsdns(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectFn,
        opts: ConnectOpts,
        tls: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        self.do_connect(
            ConnectProto::TlsDns {
                config: tls,
                server_name,
            },
            local,
            peer,
            cb,
            opts,
        )
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if self.shared.paused.load(Ordering::Acquire) {
            self.resume();
        }
        self.shutdown();
        for w in &self.shared.workers {
            let _ = w.queues.post(QueueKind::Priority, NetEvent::Stop);
        }
        for t in self.threads.lock().unwrap().drain(..) {
            let _ = t.join();
        }
        debug!("manager destroyed");
    }
}

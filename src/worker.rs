//! Workers: one thread, one poll, one wake-up handle, four queues.
//!
//! A worker's loop iteration polls for I/O with a timer-bounded timeout,
//! dispatches readiness events by token, drains the four queues in
//! priority order, and fires expired timers. A pause event parks the
//! worker: it keeps servicing only its priority queue (blocking on the
//! channel) until resumed, with the manager's two barriers fencing the
//! transition on both sides.

use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};
use mio::{Events, Poll, Token};
use slab::Slab;

use crate::errors::Error;
use crate::event::{ConnectProto, ListenProto, NetEvent};
use crate::manager::ManagerShared;
use crate::queue::{DrainStatus, EventQueues, QueueKind, QueueReceivers, QUEUE_KINDS};
use crate::socket::{self, Socket, Variant};
use crate::timer::TimerQueue;
use crate::{sys, tcp, tcpdns, tlsdns, udp, RECV_BUFFER_SIZE};

/// Token reserved for the wake-up handle.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

thread_local! {
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Worker id of the calling thread, when it is a net thread.
pub(crate) fn current_worker() -> Option<usize> {
    CURRENT_WORKER.with(|c| c.get())
}

/// The cross-thread face of a worker: its id and its queues.
pub(crate) struct WorkerShared {
    pub(crate) tid: usize,
    pub(crate) queues: EventQueues,
}

enum Control {
    Continue,
    Suspend,
}

/// Loop-owned worker state. Everything in here is single-threaded.
pub(crate) struct WorkerCore {
    pub(crate) tid: usize,
    pub(crate) mgr: Arc<ManagerShared>,
    pub(crate) shared: Arc<WorkerShared>,
    pub(crate) poll: Poll,
    pub(crate) sockets: Slab<Socket>,
    pub(crate) timers: TimerQueue,
    /// Fixed receive buffer; one read at a time lands here and must be
    /// consumed before the receive callback returns.
    pub(crate) recvbuf: Box<[u8]>,
    rx: QueueReceivers,
    paused: bool,
    finished: bool,
    next_gen: u64,
}

impl WorkerCore {
    pub(crate) fn new(
        mgr: Arc<ManagerShared>,
        shared: Arc<WorkerShared>,
        poll: Poll,
        rx: QueueReceivers,
    ) -> WorkerCore {
        WorkerCore {
            tid: shared.tid,
            mgr,
            shared,
            poll,
            sockets: Slab::new(),
            timers: TimerQueue::new(),
            recvbuf: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
            rx,
            paused: false,
            finished: false,
            next_gen: 0,
        }
    }

    /// Adds a socket to the slab, stamping its generation. Events and
    /// handles referencing a recycled key are detected by the stamp.
    pub(crate) fn insert_socket(&mut self, mut sock: Socket) -> (usize, u64) {
        self.next_gen += 1;
        let gen = self.next_gen;
        sock.gen = gen;
        let key = self.sockets.insert(sock);
        (key, gen)
    }

    /// Generation-checked lookup.
    pub(crate) fn sock_mut(&mut self, key: usize, gen: u64) -> Option<&mut Socket> {
        self.sockets.get_mut(key).filter(|s| s.gen == gen)
    }

    pub(crate) fn run(&mut self) {
        CURRENT_WORKER.with(|c| c.set(Some(self.tid)));
        sys::pin_thread(self.tid);
        debug!("worker {} started", self.tid);

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.finished {
            let timeout = self.timers.next_timeout(Instant::now());
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("worker {}: poll failed: {}", self.tid, err);
                break;
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                self.io_event(token.0, event.is_readable(), event.is_writable());
            }
            self.drain_queues();
            // Parking comes before timer expiry so a fresh pause fences
            // timer callbacks along with everything else.
            if self.paused && !self.finished {
                self.park();
            }
            self.fire_timers();
        }

        self.teardown_all();
        // Late shutdown work registered on the privileged and task queues
        // still gets delivered before the thread goes away.
        for kind in [QueueKind::Privileged, QueueKind::Task] {
            let rx = self.rx.get(kind).clone();
            while let Ok(ev) = rx.try_recv() {
                self.shared.queues.note_consumed(kind);
                let _ = self.process_event(ev);
            }
        }
        self.mgr.note_exited();
        debug!("worker {} exited", self.tid);
    }

    fn io_event(&mut self, key: usize, readable: bool, writable: bool) {
        let Some(s) = self.sockets.get(key) else {
            // Stale event for a slot that has been recycled or emptied.
            return;
        };
        trace!(
            "worker {}: io event key={} {:?} r={} w={}",
            self.tid,
            key,
            s.variant,
            readable,
            writable
        );
        match s.variant {
            Variant::UdpListen | Variant::Udp => udp::io_event(self, key, readable, writable),
            Variant::TcpListen | Variant::TcpDnsListen | Variant::TlsDnsListen => {
                if readable {
                    tcp::stream_accept(self, key);
                }
            }
            Variant::Tcp => tcp::io_event(self, key, readable, writable),
            Variant::TcpDns => tcpdns::io_event(self, key, readable, writable),
            Variant::TlsDns => tlsdns::io_event(self, key, readable, writable),
        }
    }

    fn drain_queues(&mut self) -> DrainStatus {
        let mut progressed = false;
        for kind in QUEUE_KINDS {
            match self.drain_one(kind) {
                DrainStatus::Suspend => {
                    // Remaining queues are left untouched; re-arm so the
                    // next iteration is not starved.
                    self.shared.queues.wake();
                    return DrainStatus::Suspend;
                }
                DrainStatus::Progress => progressed = true,
                DrainStatus::Empty => {}
            }
        }
        if self.shared.queues.any_pending() {
            self.shared.queues.wake();
        }
        if progressed {
            DrainStatus::Progress
        } else {
            DrainStatus::Empty
        }
    }

    fn drain_one(&mut self, kind: QueueKind) -> DrainStatus {
        // The quota is the depth observed at entry; a hot queue cannot
        // live-lock the worker.
        let quota = self.shared.queues.depth(kind);
        if quota == 0 {
            return DrainStatus::Empty;
        }
        let rx = self.rx.get(kind).clone();
        let mut progressed = false;
        for _ in 0..quota {
            match rx.try_recv() {
                Ok(ev) => {
                    self.shared.queues.note_consumed(kind);
                    progressed = true;
                    if let Control::Suspend = self.process_event(ev) {
                        return DrainStatus::Suspend;
                    }
                }
                // Counter ran ahead of the queue contents; the push will
                // become visible shortly.
                Err(_) => break,
            }
        }
        if progressed {
            DrainStatus::Progress
        } else {
            DrainStatus::Empty
        }
    }

    fn fire_timers(&mut self) {
        for (key, epoch) in self.timers.expire(Instant::now()) {
            let valid = self
                .sockets
                .get(key)
                .map_or(false, |s| s.timer_armed && s.timer_epoch == epoch);
            if !valid {
                continue;
            }
            self.sockets[key].timer_armed = false;
            socket::timeout_fired(self, key);
        }
    }

    /// Parked state entered after a pause event: only the priority queue is
    /// serviced, blocking on the channel, until a resume (or stop) arrives.
    fn park(&mut self) {
        self.mgr.note_paused();
        self.mgr.pausing.wait();
        while self.paused {
            match self.rx.get(QueueKind::Priority).clone().recv() {
                Ok(ev) => {
                    self.shared.queues.note_consumed(QueueKind::Priority);
                    self.process_priority(ev);
                }
                Err(_) => {
                    self.finished = true;
                    self.paused = false;
                }
            }
        }
        // Privileged tasks run before normal traffic once resumed.
        let rx = self.rx.get(QueueKind::Privileged).clone();
        while let Ok(ev) = rx.try_recv() {
            self.shared.queues.note_consumed(QueueKind::Privileged);
            let _ = self.process_event(ev);
        }
        self.mgr.note_resumed();
        self.mgr.resuming.wait();
    }

    fn process_priority(&mut self, ev: NetEvent) {
        match ev {
            NetEvent::Pause => {}
            NetEvent::Resume => self.paused = false,
            NetEvent::Stop => {
                self.finished = true;
                self.paused = false;
            }
            _ => debug_assert!(false, "non-priority event on priority queue"),
        }
    }

    fn process_event(&mut self, ev: NetEvent) -> Control {
        match ev {
            NetEvent::Pause => {
                self.paused = true;
                return Control::Suspend;
            }
            NetEvent::Resume => self.paused = false,
            NetEvent::Stop => {
                self.finished = true;
                return Control::Suspend;
            }

            NetEvent::Listen(cmd) => {
                let done = cmd.done.clone();
                let is_udp = matches!(cmd.proto, ListenProto::Udp);
                let res = if is_udp {
                    udp::listen(self, cmd)
                } else {
                    tcp::listen(self, cmd)
                };
                done.signal(res);
            }
            NetEvent::StopListening { key, gen, done } => {
                if self.sock_mut(key, gen).is_some() {
                    socket::shutdown_socket(self, key);
                }
                done.signal(Ok(()));
            }
            NetEvent::Shutdown => self.shutdown_all(),

            NetEvent::Connect(cmd) => {
                let is_udp = matches!(cmd.proto, ConnectProto::Udp);
                if is_udp {
                    udp::connect(self, cmd);
                } else {
                    tcp::connect(self, cmd);
                }
            }
            NetEvent::Send(cmd) => {
                let variant = match self.sock_mut(cmd.key, cmd.gen) {
                    Some(s) if !s.closing => Some(s.variant),
                    _ => None,
                };
                match variant {
                    None => {
                        if let Some(cb) = cmd.cb {
                            cb(&cmd.handle, Err(Error::Canceled));
                        }
                    }
                    Some(Variant::Udp) | Some(Variant::UdpListen) => udp::send(self, cmd),
                    Some(Variant::Tcp) => tcp::send(self, cmd, false),
                    Some(Variant::TcpDns) => tcp::send(self, cmd, true),
                    Some(Variant::TlsDns) => tlsdns::send(self, cmd),
                    Some(_) => unreachable!("send on a listener socket"),
                }
            }
            NetEvent::Read { key, gen, cb, handle } => {
                let variant = match self.sock_mut(key, gen) {
                    Some(s) if !s.closing => Some(s.variant),
                    _ => None,
                };
                match variant {
                    None => cb(&handle, Err(Error::Canceled)),
                    Some(Variant::Udp) | Some(Variant::UdpListen) => {
                        udp::read_arm(self, key, cb);
                    }
                    Some(Variant::Tcp) => tcp::read_arm(self, key, cb),
                    Some(Variant::TcpDns) => tcpdns::read_arm(self, key, cb),
                    Some(Variant::TlsDns) => tlsdns::read_arm(self, key, cb),
                    Some(_) => unreachable!("read on a listener socket"),
                }
            }
            NetEvent::CancelRead { key, gen } => {
                if self.sock_mut(key, gen).is_some() {
                    socket::failed_read(self, key, Error::Canceled);
                }
            }
            NetEvent::PauseRead { key, gen } => {
                if let Some(s) = self.sock_mut(key, gen) {
                    s.read_paused = true;
                }
            }
            NetEvent::ResumeRead { key, gen } => {
                let variant = match self.sock_mut(key, gen) {
                    Some(s) if s.read_paused => {
                        s.read_paused = false;
                        Some(s.variant)
                    }
                    _ => None,
                };
                match variant {
                    Some(Variant::Tcp) => tcp::resume_processing(self, key),
                    Some(Variant::TcpDns) => tcpdns::resume_processing(self, key),
                    Some(Variant::TlsDns) => tlsdns::resume_processing(self, key),
                    Some(Variant::Udp) | Some(Variant::UdpListen) => {
                        udp::read_drain(self, key);
                    }
                    _ => {}
                }
            }
            NetEvent::DetachHandle { key, gen, slot } => {
                socket::detach_handle(self, key, gen, slot);
            }
            NetEvent::SetTimeout { key, gen, ms } => {
                if let Some(s) = self.sock_mut(key, gen) {
                    s.read_timeout_override = if ms == 0 { None } else { Some(ms) };
                    if s.timer_armed && !s.connecting {
                        socket::restart_read_timer(self, key);
                    }
                }
            }
            NetEvent::Sequential { key, gen, on } => {
                if let Some(s) = self.sock_mut(key, gen) {
                    s.sequential = on;
                }
            }
            NetEvent::Keepalive { key, gen, on } => {
                if let Some(s) = self.sock_mut(key, gen) {
                    s.keepalive = on;
                    if s.timer_armed && !s.connecting {
                        socket::restart_read_timer(self, key);
                    }
                }
            }
            NetEvent::QuotaFreed { key, gen } => {
                if let Some(s) = self.sock_mut(key, gen) {
                    if s.accept_paused && !s.closing {
                        s.accept_paused = false;
                        tcp::stream_accept(self, key);
                    }
                }
            }
            NetEvent::Cycle { key, gen } => {
                if self.sock_mut(key, gen).is_some() {
                    tlsdns::cycle(self, key);
                }
            }
        }
        Control::Continue
    }

    /// Manager-wide shutdown: every live socket is torn down, with pending
    /// operations observing `Canceled`.
    fn shutdown_all(&mut self) {
        debug!("worker {}: shutdown walk", self.tid);
        let keys: Vec<usize> = self.sockets.iter().map(|(k, _)| k).collect();
        for key in keys {
            let Some(s) = self.sockets.get_mut(key) else { continue };
            if s.closing {
                continue;
            }
            if s.connecting {
                let cb = s.connect_cb.take();
                if let Some(cb) = cb {
                    cb(Err(Error::Canceled));
                }
                socket::shutdown_socket(self, key);
            } else if s.recv_cb.is_some() && (s.reading || !s.client) && !s.listening {
                socket::failed_read(self, key, Error::Canceled);
            } else {
                socket::shutdown_socket(self, key);
            }
        }
    }

    fn teardown_all(&mut self) {
        // The graceful walk first, so pending operations observe their
        // results even on the destroy path.
        self.shutdown_all();
        // Sockets kept alive by outstanding handles go too; later detach
        // events miss the generation and are ignored.
        self.sockets.clear();
    }
}

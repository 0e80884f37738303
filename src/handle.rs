//! Caller-visible per-conversation handles.
//!
//! A `Handle` is what the DNS layers above hold while they process one
//! datagram, one framed message, or one connection. It is cheap to clone;
//! the last clone to drop releases the socket's active-table slot, and
//! that release always executes on the socket's owning worker (the drop
//! posts an event rather than touching socket state directly).

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use crate::errors::Error;
use crate::event::{NetEvent, SendCmd};
use crate::queue::QueueKind;
use crate::worker::WorkerShared;
use crate::{RecvFn, SendFn};

pub(crate) struct HandleInner {
    worker: Arc<WorkerShared>,
    key: usize,
    gen: u64,
    slot: u32,
    peer: SocketAddr,
    local: SocketAddr,
    data: Mutex<Option<Box<dyn Any + Send>>>,
    extra: Mutex<Box<[u8]>>,
}

impl HandleInner {
    pub(crate) fn new(
        worker: Arc<WorkerShared>,
        key: usize,
        gen: u64,
        slot: u32,
        peer: SocketAddr,
        local: SocketAddr,
        extra_size: usize,
    ) -> HandleInner {
        HandleInner {
            worker,
            key,
            gen,
            slot,
            peer,
            local,
            data: Mutex::new(None),
            extra: Mutex::new(vec![0u8; extra_size].into_boxed_slice()),
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // The worker may already be gone during manager teardown; the slab
        // entry went with it.
        let _ = self.worker.queues.post(
            QueueKind::Normal,
            NetEvent::DetachHandle {
                key: self.key,
                gen: self.gen,
                slot: self.slot,
            },
        );
    }
}

/// Reference to one conversation on a socket.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("peer", &self.inner.peer)
            .field("local", &self.inner.local)
            .finish()
    }
}

impl Handle {
    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Handle {
        Handle { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleInner> {
        Arc::downgrade(&self.inner)
    }

    fn post(&self, event: NetEvent) -> std::result::Result<(), NetEvent> {
        self.inner.worker.queues.post(QueueKind::Normal, event)
    }

    /// The peer this conversation is with.
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// The local address the conversation arrived on.
    pub fn local(&self) -> SocketAddr {
        self.inner.local
    }

    /// Queues one outbound message. DNS stream variants prepend the 16-bit
    /// length prefix; the callback, when given, reports completion with an
    /// explicit result and never fires before this call returns.
    pub fn send(&self, msg: Vec<u8>, cb: Option<SendFn>) {
        let cmd = SendCmd {
            key: self.inner.key,
            gen: self.inner.gen,
            handle: self.clone(),
            msg,
            cb,
        };
        if let Err(NetEvent::Send(cmd)) = self.post(NetEvent::Send(Box::new(cmd))) {
            // Worker already exited; report instead of dropping silently.
            if let Some(cb) = cmd.cb {
                cb(self, Err(Error::Canceled));
            }
        }
    }

    /// Arms reading on the underlying socket. Client sockets deliver one
    /// message per call; server sockets read continuously until paused.
    pub fn read(&self, cb: RecvFn) {
        let posted = self.post(NetEvent::Read {
            key: self.inner.key,
            gen: self.inner.gen,
            cb: cb.clone(),
            handle: self.clone(),
        });
        if posted.is_err() {
            cb(self, Err(Error::Canceled));
        }
    }

    /// Cancels an in-progress read: the read callback observes `Canceled`
    /// and the socket shuts down.
    pub fn cancel_read(&self) {
        let _ = self.post(NetEvent::CancelRead {
            key: self.inner.key,
            gen: self.inner.gen,
        });
    }

    /// Stops reading on a stream socket until [`Handle::resume_read`].
    pub fn pause_read(&self) {
        let _ = self.post(NetEvent::PauseRead {
            key: self.inner.key,
            gen: self.inner.gen,
        });
    }

    /// Resumes reading; buffered messages are delivered first.
    pub fn resume_read(&self) {
        let _ = self.post(NetEvent::ResumeRead {
            key: self.inner.key,
            gen: self.inner.gen,
        });
    }

    /// Overrides the read timeout for this conversation's socket, in
    /// milliseconds. Restarts the timer if one is running.
    pub fn set_timeout(&self, ms: u64) {
        let _ = self.post(NetEvent::SetTimeout {
            key: self.inner.key,
            gen: self.inner.gen,
            ms,
        });
    }

    /// Removes a [`Handle::set_timeout`] override; the manager-wide
    /// timeouts apply again.
    pub fn clear_timeout(&self) {
        self.set_timeout(0);
    }

    /// Switches the connection to sequential mode: one message is
    /// dispatched at a time and reading resumes only once the in-flight
    /// handle is released.
    pub fn set_sequential(&self, on: bool) {
        let _ = self.post(NetEvent::Sequential {
            key: self.inner.key,
            gen: self.inner.gen,
            on,
        });
    }

    /// Marks the connection keep-alive: idle timeouts use the keepalive
    /// value instead of the idle value.
    pub fn set_keepalive(&self, on: bool) {
        let _ = self.post(NetEvent::Keepalive {
            key: self.inner.key,
            gen: self.inner.gen,
            on,
        });
    }

    /// Attaches an opaque payload. Dropping the handle drops the payload.
    pub fn set_data(&self, data: Box<dyn Any + Send>) {
        *self.inner.data.lock().unwrap() = Some(data);
    }

    /// Removes and returns the opaque payload.
    pub fn take_data(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.data.lock().unwrap().take()
    }

    /// Runs `f` over the extra bytes co-allocated with the handle (sized by
    /// the `extra_handle_size` given at listen/connect time).
    pub fn with_extra<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut extra = self.inner.extra.lock().unwrap();
        f(&mut extra[..])
    }
}

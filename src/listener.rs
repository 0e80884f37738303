//! Listener objects and the start/stop rendezvous.
//!
//! A listener is a parent without a descriptor of its own: each worker owns
//! one child socket bound to the same address (reuse-port fan-out, or a
//! `dup()` of one descriptor where the kernel cannot load-balance).
//! Children hold a strong reference to the parent; external references
//! count only against the parent, so dropping the last [`Listener`] stops
//! every child.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::errors::{Error, Result};
use crate::event::NetEvent;
use crate::queue::QueueKind;
use crate::worker::WorkerShared;

/// Counted rendezvous between a caller and the workers executing its
/// command: `listen` and `stop_listening` block until every worker has
/// reported. The first error wins.
pub(crate) struct SyncPoint {
    expected: usize,
    state: Mutex<(usize, Option<Error>)>,
    cv: Condvar,
}

impl SyncPoint {
    pub(crate) fn new(expected: usize) -> Arc<SyncPoint> {
        Arc::new(SyncPoint {
            expected,
            state: Mutex::new((0, None)),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn signal(&self, res: Result<()>) {
        let mut state = self.state.lock().unwrap();
        state.0 += 1;
        if let Err(err) = res {
            state.1.get_or_insert(err);
        }
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while state.0 < self.expected {
            state = self.cv.wait(state).unwrap();
        }
        match state.1.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Reference to one child socket living on one worker.
pub(crate) struct ChildRef {
    pub(crate) worker: Arc<WorkerShared>,
    pub(crate) key: usize,
    pub(crate) gen: u64,
}

pub(crate) struct ListenerShared {
    pub(crate) local: SocketAddr,
    children: Mutex<Vec<ChildRef>>,
    stopped: AtomicBool,
}

impl ListenerShared {
    pub(crate) fn new(local: SocketAddr) -> Arc<ListenerShared> {
        Arc::new(ListenerShared {
            local,
            children: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn register_child(&self, child: ChildRef) {
        self.children.lock().unwrap().push(child);
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let children: Vec<ChildRef> = std::mem::take(&mut *self.children.lock().unwrap());
        if children.is_empty() {
            return;
        }
        debug!("stopping listener on {}", self.local);
        let done = SyncPoint::new(children.len());
        for child in children {
            let posted = child.worker.queues.post(
                QueueKind::Task,
                NetEvent::StopListening {
                    key: child.key,
                    gen: child.gen,
                    done: done.clone(),
                },
            );
            if posted.is_err() {
                // Worker already exited and took the child with it.
                done.signal(Ok(()));
            }
        }
        let _ = done.wait();
    }
}

/// A bound listening socket set, one child per worker, ready to accept
/// (or, for UDP, to receive) when the constructor returns.
pub struct Listener {
    shared: Arc<ListenerShared>,
}

impl Listener {
    pub(crate) fn new(shared: Arc<ListenerShared>) -> Listener {
        Listener { shared }
    }

    /// The bound address; a requested port of 0 has been resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local
    }

    /// Quiesces every child socket and waits until they are closed.
    /// Established connections are not affected.
    pub fn stop_listening(&self) {
        self.shared.stop();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

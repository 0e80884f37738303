//! Per-worker event queues.
//!
//! Each worker owns four multi-producer single-consumer FIFOs, one per
//! priority class. Posting into any of them signals the worker's wake-up
//! handle so the loop drains the queues on its next iteration. The depth
//! counters are only loosely synchronized with the physical queue contents:
//! a producer increments before the push becomes visible, so a consumer
//! that observes a non-zero counter but an empty queue treats the item as
//! "still coming" and re-arms the wake-up instead of spinning.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::Waker;

use crate::event::NetEvent;

/// Priority classes, in dispatch order.
///
/// `Priority` events (pause, resume, stop) run even while the worker is
/// paused. `Privileged` tasks run before anything else after a resume.
/// `Normal` carries user I/O and socket control events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueueKind {
    Priority = 0,
    Privileged = 1,
    Task = 2,
    Normal = 3,
}

pub(crate) const QUEUE_KINDS: [QueueKind; 4] = [
    QueueKind::Priority,
    QueueKind::Privileged,
    QueueKind::Task,
    QueueKind::Normal,
];

/// Outcome of draining one queue or one full dispatch round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DrainStatus {
    /// At least one event was processed.
    Progress,
    /// Nothing to do.
    Empty,
    /// A stop or pause event was processed; remaining queues must not be
    /// touched this round.
    Suspend,
}

/// Producer half of a worker's queues, shared across threads.
pub(crate) struct EventQueues {
    txs: [Sender<NetEvent>; 4],
    depths: [AtomicUsize; 4],
    waker: Waker,
}

/// Consumer half, owned by the worker thread.
pub(crate) struct QueueReceivers {
    rxs: [Receiver<NetEvent>; 4],
}

impl EventQueues {
    pub(crate) fn new(waker: Waker) -> (EventQueues, QueueReceivers) {
        let (ptx, prx) = unbounded();
        let (vtx, vrx) = unbounded();
        let (ttx, trx) = unbounded();
        let (ntx, nrx) = unbounded();
        (
            EventQueues {
                txs: [ptx, vtx, ttx, ntx],
                depths: Default::default(),
                waker,
            },
            QueueReceivers {
                rxs: [prx, vrx, trx, nrx],
            },
        )
    }

    /// Posts an event and signals the worker. If the worker has already
    /// exited the event is handed back so the caller can fail its
    /// callbacks instead of dropping them silently.
    pub(crate) fn post(&self, kind: QueueKind, event: NetEvent) -> Result<(), NetEvent> {
        let depth = &self.depths[kind as usize];
        depth.fetch_add(1, Ordering::AcqRel);
        match self.txs[kind as usize].send(event) {
            Ok(()) => {
                let _ = self.waker.wake();
                Ok(())
            }
            Err(rejected) => {
                depth.fetch_sub(1, Ordering::AcqRel);
                Err(rejected.into_inner())
            }
        }
    }

    pub(crate) fn depth(&self, kind: QueueKind) -> usize {
        self.depths[kind as usize].load(Ordering::Acquire)
    }

    pub(crate) fn note_consumed(&self, kind: QueueKind) {
        self.depths[kind as usize].fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn any_pending(&self) -> bool {
        QUEUE_KINDS.iter().any(|&k| self.depth(k) > 0)
    }

    /// Re-arms the wake-up handle so the loop runs dispatch again.
    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }
}

impl QueueReceivers {
    pub(crate) fn get(&self, kind: QueueKind) -> &Receiver<NetEvent> {
        &self.rxs[kind as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues() -> (EventQueues, QueueReceivers, mio::Poll) {
        let poll = mio::Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), mio::Token(usize::MAX)).unwrap();
        let (q, rx) = EventQueues::new(waker);
        (q, rx, poll)
    }

    #[test]
    fn fifo_within_one_queue() {
        let (q, rx, _poll) = queues();
        for i in 0..16u64 {
            assert!(q
                .post(
                    QueueKind::Normal,
                    NetEvent::Cycle { key: i as usize, gen: i },
                )
                .is_ok());
        }
        for i in 0..16u64 {
            match rx.get(QueueKind::Normal).try_recv().unwrap() {
                NetEvent::Cycle { key, gen } => {
                    assert_eq!(key, i as usize);
                    assert_eq!(gen, i);
                }
                _ => panic!("unexpected event"),
            }
            q.note_consumed(QueueKind::Normal);
        }
        assert_eq!(q.depth(QueueKind::Normal), 0);
    }

    #[test]
    fn depth_tracks_posts_and_consumes() {
        let (q, rx, _poll) = queues();
        assert!(!q.any_pending());
        assert!(q.post(QueueKind::Task, NetEvent::Shutdown).is_ok());
        assert!(q.post(QueueKind::Priority, NetEvent::Pause).is_ok());
        assert_eq!(q.depth(QueueKind::Task), 1);
        assert_eq!(q.depth(QueueKind::Priority), 1);
        assert!(q.any_pending());

        rx.get(QueueKind::Priority).try_recv().unwrap();
        q.note_consumed(QueueKind::Priority);
        rx.get(QueueKind::Task).try_recv().unwrap();
        q.note_consumed(QueueKind::Task);
        assert!(!q.any_pending());
    }
}

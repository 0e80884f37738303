//! Connection admission control.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::worker::WorkerShared;

/// A listener pauses accepting when its quota is exhausted and registers a
/// waiter; releasing a connection's quota hands the listener back to its
/// worker through a posted event.
pub(crate) struct Waiter {
    pub(crate) worker: Arc<WorkerShared>,
    pub(crate) key: usize,
    pub(crate) gen: u64,
}

/// Outcome of attaching a connection to a quota.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Admitted.
    Ok,
    /// Admitted, but over the soft mark; the connection is flagged.
    Soft,
    /// Over the hard mark; the accept must be deferred.
    Deferred,
}

/// Caps the number of concurrently accepted connections on the listeners it
/// is attached to. Shared by cloning the containing [`Arc`].
///
/// A `max` of zero disables the hard limit, a `soft` of zero disables the
/// soft mark.
pub struct Quota {
    max: AtomicUsize,
    soft: AtomicUsize,
    used: AtomicUsize,
    waiters: Mutex<VecDeque<Waiter>>,
}

impl Quota {
    /// Creates a quota admitting at most `max` concurrent connections.
    pub fn new(max: usize) -> Arc<Quota> {
        Arc::new(Quota {
            max: AtomicUsize::new(max),
            soft: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            waiters: Mutex::new(VecDeque::new()),
        })
    }

    /// Adjusts the hard limit. Takes effect for subsequent admissions.
    pub fn set_max(&self, max: usize) {
        self.max.store(max, Ordering::Release);
    }

    /// Sets the soft mark above which admissions are flagged.
    pub fn set_soft(&self, soft: usize) {
        self.soft.store(soft, Ordering::Release);
    }

    /// Connections currently holding the quota.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self) -> Admission {
        let max = self.max.load(Ordering::Acquire);
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            if max != 0 && used >= max {
                return Admission::Deferred;
            }
            match self.used.compare_exchange(
                used,
                used + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }
        let soft = self.soft.load(Ordering::Acquire);
        if soft != 0 && used + 1 > soft {
            Admission::Soft
        } else {
            Admission::Ok
        }
    }

    /// Releases one admission and hands back a deferred listener, if any.
    pub(crate) fn detach(&self) -> Option<Waiter> {
        let prev = self.used.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        self.waiters.lock().unwrap().pop_front()
    }

    pub(crate) fn add_waiter(&self, waiter: Waiter) {
        self.waiters.lock().unwrap().push_back(waiter);
    }

    /// Releases one admission and, if a listener was deferred on this
    /// quota, hands it back to its worker.
    pub(crate) fn release_and_wake(&self) {
        if let Some(waiter) = self.detach() {
            let _ = waiter.worker.queues.post(
                crate::queue::QueueKind::Normal,
                crate::event::NetEvent::QuotaFreed {
                    key: waiter.key,
                    gen: waiter.gen,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_limit_defers() {
        let quota = Quota::new(2);
        assert_eq!(quota.attach(), Admission::Ok);
        assert_eq!(quota.attach(), Admission::Ok);
        assert_eq!(quota.attach(), Admission::Deferred);
        assert_eq!(quota.used(), 2);

        assert!(quota.detach().is_none());
        assert_eq!(quota.attach(), Admission::Ok);
    }

    #[test]
    fn soft_mark_flags_but_admits() {
        let quota = Quota::new(4);
        quota.set_soft(1);
        assert_eq!(quota.attach(), Admission::Ok);
        assert_eq!(quota.attach(), Admission::Soft);
        assert_eq!(quota.used(), 2);
    }

    #[test]
    fn unlimited_when_zero() {
        let quota = Quota::new(0);
        for _ in 0..64 {
            assert_eq!(quota.attach(), Admission::Ok);
        }
    }
}

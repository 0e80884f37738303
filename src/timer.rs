//! Per-worker timer queue.
//!
//! Every socket owns one logical timer, used for the connect timeout while
//! the socket is connecting and for the read timeout otherwise. Entries are
//! kept in a min-heap and validated against the socket's timer epoch when
//! they fire, so stopping a timer is a plain epoch bump and never has to
//! search the heap. Arming a timer that is already armed restarts it;
//! stopping an unarmed timer is a no-op.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    when: Instant,
    epoch: u64,
    key: usize,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue::default()
    }

    /// Schedules a wake-up for socket `key`. The caller bumps and passes
    /// the socket's current epoch; stale entries are skipped on expiry.
    pub(crate) fn arm(&mut self, key: usize, epoch: u64, after: Duration) {
        self.heap.push(Reverse(Entry {
            when: Instant::now() + after,
            epoch,
            key,
        }));
    }

    /// Time until the next (possibly stale) deadline, bounding the poll
    /// timeout. `None` means no timers are pending.
    pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse(e)| e.when.saturating_duration_since(now))
    }

    /// Pops every entry due at `now`. The worker validates each against the
    /// owning socket's epoch before acting on it.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<(usize, u64)> {
        let mut due = Vec::new();
        while let Some(Reverse(e)) = self.heap.peek() {
            if e.when > now {
                break;
            }
            let Reverse(e) = self.heap.pop().unwrap();
            due.push((e.key, e.epoch));
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_order_and_staleness() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();

        timers.arm(1, 1, Duration::from_millis(0));
        // Restart: epoch bumped, old entry becomes stale but stays queued.
        timers.arm(1, 2, Duration::from_millis(0));
        timers.arm(2, 1, Duration::from_millis(0));

        let due = timers.expire(now + Duration::from_millis(5));
        assert_eq!(due.len(), 3);
        // Entries for socket 1 carry both epochs; the consumer keeps only
        // the one matching the socket's current epoch.
        assert!(due.contains(&(1, 1)));
        assert!(due.contains(&(1, 2)));
        assert!(due.contains(&(2, 1)));
        assert!(timers.next_timeout(now).is_none());
    }

    #[test]
    fn next_timeout_tracks_earliest() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.arm(7, 1, Duration::from_millis(500));
        timers.arm(8, 1, Duration::from_millis(100));
        let timeout = timers.next_timeout(now).unwrap();
        // The 100 ms entry bounds the poll timeout, not the 500 ms one.
        assert!(timeout >= Duration::from_millis(90));
        assert!(timeout <= Duration::from_millis(200));
        assert!(timers.expire(now).is_empty());
    }
}

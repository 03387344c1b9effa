use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::time::Instant;

/// A per-actor priority heap of pending timers
///
/// Age expiration, ack-wait redelivery, dedup eviction and inactivity
/// GC are all entries here, processed inline with the owning actor's
/// message loop instead of on ad-hoc tasks. Firing is lazy: a timer
/// whose condition no longer holds is simply ignored by the actor.
#[derive(Debug)]
pub(crate) struct TimerHeap<K> {
    heap: BinaryHeap<Entry<K>>,
    counter: u64,
}

#[derive(Debug)]
struct Entry<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Entry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the earliest deadline sits on top of the max-heap
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K> TimerHeap<K> {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            counter: 0,
        }
    }

    pub(crate) fn schedule(&mut self, at: Instant, key: K) {
        self.counter += 1;
        self.heap.push(Entry {
            at,
            seq: self.counter,
            key,
        });
    }

    /// The deadline the owning actor should sleep until
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.at)
    }

    /// Pop the next timer that is due at `now`, earliest first
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<K> {
        if self.heap.peek().map_or(false, |entry| entry.at <= now) {
            self.heap.pop().map(|entry| entry.key)
        } else {
            None
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::TimerHeap;

    #[test]
    fn fires_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerHeap::new();
        timers.schedule(now + Duration::from_secs(3), "c");
        timers.schedule(now + Duration::from_secs(1), "a");
        timers.schedule(now + Duration::from_secs(2), "b");

        assert_eq!(Some(now + Duration::from_secs(1)), timers.next_deadline());

        let later = now + Duration::from_secs(2);
        assert_eq!(Some("a"), timers.pop_due(later));
        assert_eq!(Some("b"), timers.pop_due(later));
        assert_eq!(None, timers.pop_due(later));
        assert!(!timers.is_empty());
    }

    #[test]
    fn equal_deadlines_fire_in_schedule_order() {
        let now = Instant::now();
        let mut timers = TimerHeap::new();
        timers.schedule(now, 1);
        timers.schedule(now, 2);
        timers.schedule(now, 3);

        assert_eq!(Some(1), timers.pop_due(now));
        assert_eq!(Some(2), timers.pop_due(now));
        assert_eq!(Some(3), timers.pop_due(now));
    }
}

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytestring::ByteString;
use tokio::time::Instant;

/// Entries above this count are evicted oldest-first even if their
/// window hasn't elapsed
const MAX_ENTRIES: usize = 64 * 1024;

/// The per-stream message id deduplication cache
///
/// A ring of ids in insertion order paired with a hash index, bounded
/// both by the stream's duplicate window and by a hard entry cap.
/// Expiration is amortized O(1): the ring front is popped as it falls
/// out of the window.
#[derive(Debug)]
pub(crate) struct DedupCache {
    window: Duration,
    order: VecDeque<(ByteString, Instant)>,
    by_id: HashMap<ByteString, u64>,
}

impl DedupCache {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            order: VecDeque::new(),
            by_id: HashMap::new(),
        }
    }

    pub(crate) fn window(&self) -> Duration {
        self.window
    }

    pub(crate) fn set_window(&mut self, window: Duration) {
        self.window = window;
        if window.is_zero() {
            self.order.clear();
            self.by_id.clear();
        }
    }

    /// The sequence previously assigned to `id`, if still in the window
    pub(crate) fn check(&self, id: &str) -> Option<u64> {
        self.by_id.get(id).copied()
    }

    /// Record `id` as assigned `sequence`
    ///
    /// Callers check for duplicates first; an id is only inserted once
    /// per window.
    pub(crate) fn insert(&mut self, id: ByteString, sequence: u64, now: Instant) {
        if self.window.is_zero() {
            return;
        }

        debug_assert!(!self.by_id.contains_key(&id));
        if self.order.len() >= MAX_ENTRIES {
            if let Some((evicted, _)) = self.order.pop_front() {
                self.by_id.remove(&evicted);
            }
        }

        self.by_id.insert(id.clone(), sequence);
        self.order.push_back((id, now + self.window));
    }

    /// Drop expired entries, returning the next eviction deadline
    pub(crate) fn evict(&mut self, now: Instant) -> Option<Instant> {
        while let Some((_, expires)) = self.order.front() {
            if *expires > now {
                return Some(*expires);
            }
            let (id, _) = self.order.pop_front().expect("front was just peeked");
            self.by_id.remove(&id);
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::DedupCache;

    #[test]
    fn duplicate_within_window() {
        let now = Instant::now();
        let mut cache = DedupCache::new(Duration::from_millis(25));
        cache.insert("AA".into(), 1, now);
        cache.insert("BB".into(), 2, now);

        assert_eq!(Some(1), cache.check("AA"));
        assert_eq!(Some(2), cache.check("BB"));
        assert_eq!(None, cache.check("CC"));
    }

    #[test]
    fn eviction_after_window() {
        let now = Instant::now();
        let mut cache = DedupCache::new(Duration::from_millis(25));
        cache.insert("AA".into(), 1, now);

        let next = cache.evict(now).unwrap();
        assert_eq!(now + Duration::from_millis(25), next);
        assert_eq!(1, cache.len());

        assert_eq!(None, cache.evict(now + Duration::from_millis(26)));
        assert_eq!(0, cache.len());
        assert_eq!(None, cache.check("AA"));
    }

    #[test]
    fn zero_window_disables() {
        let mut cache = DedupCache::new(Duration::ZERO);
        cache.insert("AA".into(), 1, Instant::now());
        assert_eq!(0, cache.len());
        assert_eq!(None, cache.check("AA"));
    }
}

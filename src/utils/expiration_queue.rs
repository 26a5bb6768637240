//! Expiration Queue
//!
//! Age-ordered queue of items that must be removed after a fixed time-to-live.
//! Used by the transaction cache to retire short-id assignments.
//!
//! Items are keyed so they can be removed individually in O(log n). Adding an
//! item that is already queued moves it to the back with a fresh timestamp.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::trace;

/// TTL-ordered queue with keyed removal.
#[derive(Debug)]
pub struct ExpirationQueue<T> {
    /// Insertion sequence -> (item, time added)
    order: BTreeMap<u64, (T, Instant)>,
    /// Item -> insertion sequence
    index: HashMap<T, u64>,
    next_seq: u64,
    ttl: Duration,
}

impl<T> ExpirationQueue<T>
where
    T: Copy + Eq + Hash + std::fmt::Debug,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            order: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.index.contains_key(item)
    }

    /// Queue `item` as added at `now`.
    pub fn add(&mut self, item: T, now: Instant) {
        if let Some(seq) = self.index.remove(&item) {
            self.order.remove(&seq);
        }
        self.next_seq += 1;
        self.order.insert(self.next_seq, (item, now));
        self.index.insert(item, self.next_seq);
    }

    /// Remove `item` if present.
    pub fn remove(&mut self, item: &T) -> bool {
        match self.index.remove(item) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    pub fn oldest(&self) -> Option<T> {
        self.order.values().next().map(|(item, _)| *item)
    }

    pub fn oldest_timestamp(&self) -> Option<Instant> {
        self.order.values().next().map(|(_, added_at)| *added_at)
    }

    /// Pop the oldest item.
    pub fn remove_oldest(&mut self) -> Option<T> {
        let (_, (item, _)) = self.order.pop_first()?;
        self.index.remove(&item);
        Some(item)
    }

    /// Pop every item older than `now - ttl`, calling `on_remove` for each in
    /// age order.
    pub fn remove_expired<F>(&mut self, now: Instant, mut on_remove: F) -> usize
    where
        F: FnMut(T),
    {
        let mut removed = 0;
        while let Some(added_at) = self.oldest_timestamp() {
            if now.saturating_duration_since(added_at) <= self.ttl {
                break;
            }
            if let Some(item) = self.remove_oldest() {
                trace!(?item, "Expired queue item");
                on_remove(item);
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_expired_in_age_order() {
        let start = Instant::now();
        let mut queue = ExpirationQueue::new(Duration::from_secs(60));
        queue.add(1u32, start);
        queue.add(2u32, start + Duration::from_secs(10));
        queue.add(3u32, start + Duration::from_secs(50));

        let mut removed = Vec::new();
        let count = queue.remove_expired(start + Duration::from_secs(71), |item| removed.push(item));

        assert_eq!(count, 2);
        assert_eq!(removed, vec![1, 2]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.oldest(), Some(3));
    }

    #[test]
    fn test_item_at_exact_ttl_is_kept() {
        let start = Instant::now();
        let mut queue = ExpirationQueue::new(Duration::from_secs(60));
        queue.add(42u32, start);

        assert_eq!(queue.remove_expired(start + Duration::from_secs(60), |_| {}), 0);
        assert_eq!(queue.remove_expired(start + Duration::from_secs(61), |_| {}), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_readd_moves_item_to_back() {
        let start = Instant::now();
        let mut queue = ExpirationQueue::new(Duration::from_secs(60));
        queue.add(1u32, start);
        queue.add(2u32, start);
        queue.add(1u32, start + Duration::from_secs(5));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.remove_oldest(), Some(2));
        assert_eq!(queue.remove_oldest(), Some(1));
        assert_eq!(queue.remove_oldest(), None);
    }

    #[test]
    fn test_remove_by_key() {
        let start = Instant::now();
        let mut queue = ExpirationQueue::new(Duration::from_secs(60));
        queue.add(1u32, start);
        queue.add(2u32, start);

        assert!(queue.remove(&1));
        assert!(!queue.remove(&1));
        assert!(!queue.contains(&1));
        assert_eq!(queue.oldest(), Some(2));
    }
}

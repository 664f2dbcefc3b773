//! Fixed-capacity, priority-ordered retention for sampled events.
//!
//! The queue has two states: filling (below capacity, every offer inserts)
//! and full (an offer replaces the current minimum only when its priority is
//! strictly greater). Ties keep the earlier arrival; the newer offer is
//! discarded, which makes retention deterministic and order-stable.

use crate::sampling::PriorityAware;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Slot<T> {
    priority: f32,
    arrival: u64,
    value: T,
}

// Heap order is inverted so that `peek` surfaces the eviction candidate:
// the lowest priority, and among equals the latest arrival.
impl<T> Ord for Slot<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then(self.arrival.cmp(&other.arrival))
    }
}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.arrival == other.arrival
    }
}

impl<T> Eq for Slot<T> {}

/// Bounded reservoir retaining the highest-priority entries offered since
/// the last drain.
pub struct SamplingPriorityQueue<T: PriorityAware> {
    capacity: usize,
    entries: BinaryHeap<Slot<T>>,
    next_arrival: u64,
    seen: u64,
    dropped: u64,
}

impl<T: PriorityAware> SamplingPriorityQueue<T> {
    pub fn new(capacity: usize) -> Self {
        SamplingPriorityQueue {
            capacity,
            entries: BinaryHeap::with_capacity(capacity.min(1_024)),
            next_arrival: 0,
            seen: 0,
            dropped: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Events offered since the last drain, retained or not.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Events discarded (or displaced) since the last drain.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Offers one entry. Returns whether the entry was retained.
    pub fn offer(&mut self, value: T) -> bool {
        self.seen += 1;
        self.insert(value)
    }

    /// Re-offers a previously drained batch (a transiently failed send).
    /// Retention follows the same priority bound; the seen counter is not
    /// bumped because these entries were already counted when first offered.
    pub fn retry_all(&mut self, batch: Vec<T>) {
        for value in batch {
            self.insert(value);
        }
    }

    fn insert(&mut self, value: T) -> bool {
        if self.capacity == 0 {
            self.dropped += 1;
            return false;
        }
        let slot = Slot {
            priority: value.priority(),
            arrival: self.next_arrival,
            value,
        };
        self.next_arrival += 1;

        if self.entries.len() < self.capacity {
            self.entries.push(slot);
            return true;
        }

        // Full: replace the minimum only on strictly greater priority.
        match self.entries.peek() {
            Some(min) if slot.priority > min.priority => {
                self.entries.pop();
                self.entries.push(slot);
                self.dropped += 1;
                true
            }
            _ => {
                self.dropped += 1;
                false
            }
        }
    }

    /// Atomically returns every retained entry (descending priority, earlier
    /// arrivals first among ties) plus the total number of entries offered
    /// since the previous drain, and resets to empty.
    pub fn drain_and_clear(&mut self) -> (Vec<T>, u64) {
        let heap = std::mem::take(&mut self.entries);
        let seen = self.seen;
        self.seen = 0;
        self.dropped = 0;
        self.next_arrival = 0;
        let entries = heap
            .into_sorted_vec()
            .into_iter()
            .map(|slot| slot.value)
            .collect();
        (entries, seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Sample {
        priority: f32,
        tag: u32,
    }

    impl Sample {
        fn new(priority: f32, tag: u32) -> Self {
            Sample { priority, tag }
        }
    }

    impl PriorityAware for Sample {
        fn priority(&self) -> f32 {
            self.priority
        }
    }

    fn priorities(entries: &[Sample]) -> Vec<f32> {
        entries.iter().map(|s| s.priority).collect()
    }

    #[test]
    fn test_filling_state_always_inserts() {
        let mut queue = SamplingPriorityQueue::new(3);
        assert!(queue.offer(Sample::new(0.1, 0)));
        assert!(queue.offer(Sample::new(0.2, 1)));
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.seen(), 2);
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_capacity_two_scenario() {
        // Offers [1.0, 3.0, 2.0, 0.5] at capacity 2 must retain {3.0, 2.0}.
        let mut queue = SamplingPriorityQueue::new(2);
        queue.offer(Sample::new(1.0, 0));
        queue.offer(Sample::new(3.0, 1));
        queue.offer(Sample::new(2.0, 2));
        queue.offer(Sample::new(0.5, 3));

        let (entries, seen) = queue.drain_and_clear();
        assert_eq!(seen, 4);
        assert_eq!(priorities(&entries), vec![3.0, 2.0]);
    }

    #[test]
    fn test_equal_priority_keeps_earlier_arrival() {
        let mut queue = SamplingPriorityQueue::new(1);
        queue.offer(Sample::new(1.0, 0));
        assert!(!queue.offer(Sample::new(1.0, 1)));

        let (entries, _) = queue.drain_and_clear();
        assert_eq!(entries, vec![Sample::new(1.0, 0)]);
    }

    #[test]
    fn test_zero_capacity_retains_nothing() {
        let mut queue = SamplingPriorityQueue::new(0);
        for i in 0..33 {
            queue.offer(Sample::new(1.0, i));
        }
        assert_eq!(queue.size(), 0);
        let (entries, seen) = queue.drain_and_clear();
        assert!(entries.is_empty());
        assert_eq!(seen, 33);
    }

    #[test]
    fn test_drain_is_descending_and_idempotent() {
        let mut queue = SamplingPriorityQueue::new(5);
        for (i, p) in [1.2f32, 0.1, 1.3, 1.4, 1.5, 1.6, 0.7, 2.3].iter().enumerate() {
            queue.offer(Sample::new(*p, i as u32));
        }
        assert_eq!(queue.size(), 5);

        let (entries, seen) = queue.drain_and_clear();
        assert_eq!(seen, 8);
        assert_eq!(priorities(&entries), vec![2.3, 1.6, 1.5, 1.4, 1.3]);

        let (empty, seen) = queue.drain_and_clear();
        assert!(empty.is_empty());
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_retry_all_respects_priority_bound() {
        let mut target = SamplingPriorityQueue::new(5);
        for (i, p) in [1.2f32, 0.1, 1.3, 1.4, 1.5, 1.6, 0.7, 2.3].iter().enumerate() {
            target.offer(Sample::new(*p, i as u32));
        }
        let (failed_batch, _) = target.drain_and_clear();

        let mut retry_target = SamplingPriorityQueue::new(5);
        retry_target.offer(Sample::new(1.1, 100));
        retry_target.offer(Sample::new(0.9, 101));
        retry_target.offer(Sample::new(1.7, 102));
        retry_target.retry_all(failed_batch);

        assert_eq!(retry_target.size(), 5);
        // The retried batch was counted when first offered elsewhere.
        assert_eq!(retry_target.seen(), 3);
        let (entries, _) = retry_target.drain_and_clear();
        let total: f32 = priorities(&entries).iter().sum();
        assert!((total - 8.5).abs() < 1e-4);
        assert_eq!(priorities(&entries), vec![2.3, 1.7, 1.6, 1.5, 1.4]);
    }

    proptest! {
        /// Every retained entry's priority is >= every discarded entry's
        /// priority, and the size bound always holds.
        #[test]
        fn prop_retained_dominates_discarded(
            offered in proptest::collection::vec(0.0f32..10.0, 1..60),
            capacity in 1usize..8,
        ) {
            let mut queue = SamplingPriorityQueue::new(capacity);
            for (i, p) in offered.iter().enumerate() {
                queue.offer(Sample::new(*p, i as u32));
            }
            prop_assert!(queue.size() <= capacity);

            let (retained, seen) = queue.drain_and_clear();
            prop_assert_eq!(seen, offered.len() as u64);

            let retained_tags: Vec<u32> = retained.iter().map(|s| s.tag).collect();
            let min_retained = retained
                .iter()
                .map(|s| s.priority)
                .fold(f32::INFINITY, f32::min);
            for (i, p) in offered.iter().enumerate() {
                if !retained_tags.contains(&(i as u32)) {
                    prop_assert!(*p <= min_retained);
                }
            }
        }
    }
}

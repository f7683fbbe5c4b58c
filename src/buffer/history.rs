//! Bounded history of shared items
//!
//! Producers push from their own worker thread; the recorder takes ordered
//! snapshots at trigger time. The lock is held only for the O(1) push or the
//! copy of `Arc` handles, never across I/O.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Fixed-capacity FIFO that evicts the oldest item when full
#[derive(Debug)]
pub struct History<T> {
    items: Mutex<VecDeque<Arc<T>>>,
    capacity: Mutex<usize>,
}

impl<T> History<T> {
    /// Capacity is clamped to at least one slot
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: Mutex::new(capacity),
        }
    }

    /// Store an item, evicting the oldest if full. Never blocks for longer
    /// than a concurrent snapshot copy.
    pub fn push(&self, item: T) -> Arc<T> {
        let item = Arc::new(item);
        self.push_shared(item.clone());
        item
    }

    /// Store an already shared item
    pub fn push_shared(&self, item: Arc<T>) {
        let capacity = *self.capacity.lock();
        let mut items = self.items.lock();
        while items.len() >= capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    /// Ordered copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.items.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        *self.capacity.lock()
    }

    /// Replace the storage with an empty buffer of a new capacity. Snapshots
    /// already taken are unaffected; a snapshot in progress completes first.
    pub fn reallocate(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut items = self.items.lock();
        *items = VecDeque::with_capacity(capacity);
        *self.capacity.lock() = capacity;
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_last_n_in_order() {
        for capacity in [1usize, 3, 30] {
            for extra in [0usize, 1, 7, 100] {
                let history = History::new(capacity);
                let total = capacity + extra;
                for i in 0..total {
                    history.push(i);
                }
                let snapshot: Vec<usize> = history.snapshot().iter().map(|v| **v).collect();
                let expected: Vec<usize> = (extra..total).collect();
                assert_eq!(snapshot, expected, "capacity {} extra {}", capacity, extra);
            }
        }
    }

    #[test]
    fn test_partial_fill() {
        let history = History::new(5);
        history.push("a");
        history.push("b");
        assert_eq!(history.len(), 2);
        let snapshot: Vec<&str> = history.snapshot().iter().map(|v| **v).collect();
        assert_eq!(snapshot, vec!["a", "b"]);
    }

    #[test]
    fn test_snapshot_is_independent_of_later_pushes() {
        let history = History::new(2);
        history.push(1);
        history.push(2);
        let snapshot = history.snapshot();
        history.push(3);
        history.push(4);
        assert_eq!(*snapshot[0], 1);
        assert_eq!(*snapshot[1], 2);
    }

    #[test]
    fn test_zero_capacity_clamps_to_one() {
        let history = History::new(0);
        history.push(1);
        history.push(2);
        assert_eq!(history.capacity(), 1);
        assert_eq!(*history.snapshot()[0], 2);
    }

    #[test]
    fn test_reallocate_empties_and_resizes() {
        let history = History::new(2);
        history.push(1);
        history.reallocate(4);
        assert!(history.is_empty());
        for i in 0..6 {
            history.push(i);
        }
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn test_concurrent_push_and_snapshot() {
        let history = Arc::new(History::new(64));
        let producer = {
            let history = history.clone();
            std::thread::spawn(move || {
                for i in 0..10_000u64 {
                    history.push(i);
                }
            })
        };
        for _ in 0..100 {
            let snapshot = history.snapshot();
            assert!(snapshot.len() <= 64);
            assert!(snapshot.windows(2).all(|w| *w[0] + 1 == *w[1]));
        }
        producer.join().unwrap();
        assert_eq!(*history.snapshot()[63], 9_999);
    }
}

//! Reactor-owned bounded squash queue (§4.3).
//!
//! Mutated only from the server reactor thread, so this is a plain
//! `VecDeque` with no synchronization. The cross-thread variant used by
//! `dataserv-client` lives in that crate and adds a `Mutex`/`Condvar`.

use std::collections::VecDeque;

use crate::proto::QUEUE_CAPACITY;

/// Single-producer/single-consumer queue that drops everything pending and
/// keeps only the newest item when it would otherwise exceed capacity.
pub struct SquashQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> Default for SquashQueue<T> {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY)
    }
}

impl<T> SquashQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "squash queue capacity must be > 0");
        Self { items: VecDeque::with_capacity(capacity), capacity }
    }

    /// Enqueues `item`. If the queue is already at capacity, every pending
    /// item is dropped first so only `item` (the newest) remains.
    pub fn try_put(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.clear();
        }
        self.items.push_back(item);
    }

    /// Non-blocking pop of the oldest pending item.
    pub fn try_pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squashes_on_overflow_keeping_only_newest() {
        let mut q = SquashQueue::new(3);
        q.try_put(1);
        q.try_put(2);
        q.try_put(3);
        assert_eq!(q.len(), 3);
        q.try_put(4);
        assert_eq!(q.len(), 1);
        assert_eq!(q.try_pop(), Some(4));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn fifo_order_under_capacity() {
        let mut q: SquashQueue<i32> = SquashQueue::new(5);
        q.try_put(1);
        q.try_put(2);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn default_capacity_matches_q() {
        let q: SquashQueue<()> = SquashQueue::default();
        assert_eq!(q.capacity, QUEUE_CAPACITY);
    }
}

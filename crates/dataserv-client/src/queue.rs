//! Cross-thread squash queue: same latest-wins overflow policy as
//! `dataserv_core::queue::SquashQueue` (§4.3), but `Mutex`/`Condvar`-backed
//! since it is shared between a client's background reactor thread and the
//! user thread calling `push`/`pop`, rather than owned by a single reactor.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

pub struct ClientQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> ClientQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "squash queue capacity must be > 0");
        Self { items: Mutex::new(VecDeque::with_capacity(capacity)), not_empty: Condvar::new(), capacity }
    }

    /// Enqueues `item`, squashing (dropping everything pending) if the
    /// queue was already at capacity.
    pub fn try_put(&self, item: T) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.len() >= self.capacity {
            items.clear();
        }
        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Non-blocking pop of the oldest pending item.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    /// Blocks until an item is available or `timeout` elapses. `None`
    /// timeout blocks indefinitely (matches the reference `pop(timeout=None)`
    /// contract).
    pub fn get(&self, timeout: Option<Duration>) -> Option<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let Some(timeout) = timeout else {
            while items.is_empty() {
                items = self.not_empty.wait(items).unwrap_or_else(|e| e.into_inner());
            }
            return items.pop_front();
        };

        let deadline = Instant::now() + timeout;
        while items.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) =
                self.not_empty.wait_timeout(items, remaining).unwrap_or_else(|e| e.into_inner());
            items = guard;
        }
        items.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn squashes_on_overflow_keeping_only_newest() {
        let q: ClientQueue<i32> = ClientQueue::new(2);
        q.try_put(1);
        q.try_put(2);
        q.try_put(3);
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn get_returns_none_on_timeout_when_empty() {
        let q: ClientQueue<i32> = ClientQueue::new(5);
        assert_eq!(q.get(Some(Duration::from_millis(20))), None);
    }

    #[test]
    fn get_wakes_up_as_soon_as_an_item_arrives() {
        let q = Arc::new(ClientQueue::<i32>::new(5));
        let producer = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.try_put(7);
        });
        assert_eq!(q.get(Some(Duration::from_secs(5))), Some(7));
        handle.join().unwrap();
    }
}

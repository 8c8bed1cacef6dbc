//! The processor's FIFO event queue: a mutex-guarded deque with a condition
//! variable. Network contexts and background timers enqueue; the single
//! processor thread dequeues.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct MetaQueue<T> {
    items: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> MetaQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    pub fn enqueue(&self, item: T) {
        let mut items = self.items.lock();
        items.push_back(item);
        self.cond.notify_one();
    }

    /// Block until an item is available.
    pub fn dequeue(&self) -> T {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            self.cond.wait(&mut items);
        }
    }

    /// Dequeue with a timeout; `None` when the queue stayed empty.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock();
        if let Some(item) = items.pop_front() {
            return Some(item);
        }
        let _ = self.cond.wait_for(&mut items, timeout);
        items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for MetaQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let q = MetaQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), 1);
        assert_eq!(q.dequeue(), 2);
        assert_eq!(q.dequeue(), 3);
    }

    #[test]
    fn test_dequeue_timeout_on_empty() {
        let q: MetaQueue<i32> = MetaQueue::new();
        assert_eq!(q.dequeue_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_cross_thread_handoff() {
        let q = Arc::new(MetaQueue::new());
        let producer = Arc::clone(&q);
        let t = std::thread::spawn(move || {
            for i in 0..100 {
                producer.enqueue(i);
            }
        });
        let mut got = Vec::new();
        for _ in 0..100 {
            got.push(q.dequeue());
        }
        t.join().unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }
}

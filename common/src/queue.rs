//! Blocking hand-off primitives shared between tasks.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Bounded FIFO with blocking pop. Producers that want "latest value wins"
/// call [`Queue::reset`] before [`Queue::push`].
#[derive(Debug)]
pub struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuses the item when the queue is full.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        self.available.notify_one();
        true
    }

    /// Drops everything pending, then pushes `item`.
    pub fn replace(&self, item: T) {
        let mut items = self.lock();
        items.clear();
        items.push_back(item);
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Waits up to `timeout` for an item.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            items = self
                .available
                .wait_timeout(items, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn num_waiting(&self) -> usize {
        self.lock().len()
    }
}

/// Level-triggered flag that tasks can block on.
#[derive(Debug, Default)]
pub struct EventFlag {
    set: Mutex<bool>,
    changed: Condvar,
}

impl EventFlag {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self) {
        *self.lock() = true;
        self.changed.notify_all();
    }

    pub fn clear(&self) {
        *self.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// True if the flag is (or becomes) set within `timeout`.
    pub fn wait_for_set(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn replace_keeps_only_latest() {
        let queue = Queue::new(1);
        assert!(queue.push(1));
        assert!(!queue.push(2));

        queue.replace(3);

        assert_eq!(queue.num_waiting(), 1);
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn pop_times_out_when_empty() {
        let queue: Queue<u8> = Queue::new(1);

        assert_eq!(queue.pop(Duration::from_millis(10)), None);
    }

    #[test]
    fn pop_wakes_on_push_from_other_thread() {
        let queue = Arc::new(Queue::new(1));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(7u8);
            })
        };

        assert_eq!(queue.pop(Duration::from_secs(5)), Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn event_flag_wait_reflects_state() {
        let flag = Arc::new(EventFlag::new());
        assert!(!flag.wait_for_set(Duration::from_millis(5)));

        let setter = {
            let flag = flag.clone();
            thread::spawn(move || flag.set())
        };
        assert!(flag.wait_for_set(Duration::from_secs(5)));
        setter.join().unwrap();

        flag.clear();
        assert!(!flag.is_set());
    }
}

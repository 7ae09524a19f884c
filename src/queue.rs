//! Bounded blocking FIFO used to hand work between threads.
//!
//! Producers block while the queue is at capacity, consumers block while
//! it is empty. `close` wakes everyone; a closed queue can still be
//! drained, so `pop` only reports failure once it is closed *and* empty.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// A capacity-capped FIFO with blocking push/pop and close semantics.
#[derive(Debug)]
pub struct BlockQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BlockQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        BlockQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Appends `item`, blocking while the queue is full. Returns `false`
    /// if the queue was closed before the item could be stored.
    pub fn push_back(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() >= inner.capacity && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.closed {
            return false;
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Prepends `item`, blocking while the queue is full. Returns `false`
    /// if the queue was closed before the item could be stored.
    pub fn push_front(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() >= inner.capacity && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.closed {
            return false;
        }
        inner.items.push_front(item);
        self.not_empty.notify_one();
        true
    }

    /// Non-blocking append. Hands the item back when the queue is full or
    /// closed.
    pub fn try_push_back(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed || inner.items.len() >= inner.capacity {
            return Err(item);
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the front item, blocking while the queue is empty.
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.is_empty() && !inner.closed {
            inner = self.not_empty.wait(inner).unwrap();
        }
        let item = inner.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.items.is_empty() && !inner.closed {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, wait) = self.not_empty.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
            if wait.timed_out() && inner.items.is_empty() {
                return None;
            }
        }
        let item = inner.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Wakes one blocked consumer without touching the queue contents.
    pub fn flush(&self) {
        self.not_empty.notify_one();
    }

    /// Closes the queue and wakes every waiter. Queued items stay
    /// poppable so consumers can drain.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// True when no items are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    /// True when the queue is at capacity.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.items.len() >= inner.capacity
    }

    /// The capacity cap.
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }
}

//! Indexed min-heap of per-connection deadlines.
//!
//! Each entry carries a typed event payload instead of a callback; the
//! reactor pulls expired `(id, event)` pairs out and performs the effect
//! itself, so no closure ever captures connection state. The auxiliary
//! id-to-position map makes arbitrary-key adjust and delete O(log n) and
//! peek O(1).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct TimerNode<E> {
    id: RawFd,
    deadline: Instant,
    event: E,
}

/// Min-heap keyed by deadline with an id-to-index map.
#[derive(Debug)]
pub struct HeapTimer<E> {
    heap: Vec<TimerNode<E>>,
    index: HashMap<RawFd, usize>,
}

impl<E> HeapTimer<E> {
    /// Creates an empty timer.
    pub fn new() -> Self {
        HeapTimer {
            heap: Vec::with_capacity(64),
            index: HashMap::new(),
        }
    }

    /// Number of tracked deadlines.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// True when `id` has a pending deadline.
    pub fn contains(&self, id: RawFd) -> bool {
        self.index.contains_key(&id)
    }

    /// Schedules `id` to fire after `timeout`. A known id has its
    /// deadline and event replaced in place and is re-ordered from its
    /// current position.
    pub fn add(&mut self, id: RawFd, timeout: Duration, event: E) {
        let deadline = Instant::now() + timeout;
        if let Some(&at) = self.index.get(&id) {
            self.heap[at].deadline = deadline;
            self.heap[at].event = event;
            if !self.sift_down(at) {
                self.sift_up(at);
            }
        } else {
            let at = self.heap.len();
            self.index.insert(id, at);
            self.heap.push(TimerNode {
                id,
                deadline,
                event,
            });
            self.sift_up(at);
        }
    }

    /// Pushes `id`'s deadline out to `timeout` from now. Deadlines only
    /// grow here, so a sift-down suffices; use [`add`](Self::add) to
    /// shorten one. Unknown ids are ignored.
    pub fn adjust(&mut self, id: RawFd, timeout: Duration) {
        if let Some(&at) = self.index.get(&id) {
            self.heap[at].deadline = Instant::now() + timeout;
            self.sift_down(at);
        }
    }

    /// Removes `id` and hands its event back so the caller can run the
    /// effect immediately.
    pub fn take(&mut self, id: RawFd) -> Option<E> {
        let at = *self.index.get(&id)?;
        Some(self.remove_at(at).event)
    }

    /// Removes and returns every entry whose deadline has passed, in
    /// deadline order.
    pub fn pop_expired(&mut self) -> Vec<(RawFd, E)> {
        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some(root) = self.heap.first() {
            if root.deadline > now {
                break;
            }
            let node = self.remove_at(0);
            fired.push((node.id, node.event));
        }
        fired
    }

    /// Time until the earliest deadline, clamped at zero. `None` means
    /// nothing is scheduled and the caller may sleep forever.
    pub fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.heap
            .first()
            .map(|node| node.deadline.saturating_duration_since(now))
    }

    fn remove_at(&mut self, at: usize) -> TimerNode<E> {
        let last = self.heap.len() - 1;
        if at != last {
            self.swap_nodes(at, last);
        }
        let node = self.heap.pop().expect("remove_at on empty heap");
        self.index.remove(&node.id);
        if at < self.heap.len() && !self.sift_down(at) {
            self.sift_up(at);
        }
        node
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.heap[parent].deadline <= self.heap[at].deadline {
                break;
            }
            self.swap_nodes(at, parent);
            at = parent;
        }
    }

    /// Returns whether the node moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let len = self.heap.len();
        let mut at = start;
        loop {
            let mut child = 2 * at + 1;
            if child >= len {
                break;
            }
            if child + 1 < len && self.heap[child + 1].deadline < self.heap[child].deadline {
                child += 1;
            }
            if self.heap[child].deadline >= self.heap[at].deadline {
                break;
            }
            self.swap_nodes(at, child);
            at = child;
        }
        at > start
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].id, a);
        self.index.insert(self.heap[b].id, b);
    }
}

impl<E> Default for HeapTimer<E> {
    fn default() -> Self {
        Self::new()
    }
}

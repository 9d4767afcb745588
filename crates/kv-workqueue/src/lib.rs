//! A work queue decoupling a connection acceptor from a fixed-size pool of
//! worker threads. Any number of threads may call [`WorkQueue::pop`]
//! concurrently; each pushed item is handed to exactly one of them, and a
//! thread blocked on an empty queue never busy-waits.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// An unbounded, multi-producer multi-consumer queue of jobs.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        WorkQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Pushes an item and wakes one waiting consumer. A no-op once the
    /// queue has been [`close`](Self::close)d.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available or the queue is closed with no
    /// items left, in which case it returns `None`.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Stops accepting new work and wakes every blocked consumer; each
    /// drains remaining items before observing the close.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! # Bounded Hand-Off Queue
//!
//! Blocking MPMC queue used for every thread hand-off in the pipeline:
//! subbands into a collector, assembled blocks to the output loop, and
//! outgoing subbands to the per-destination send workers.
//!
//! ## Design
//!
//! - Fixed capacity, chosen at construction, never reallocated
//! - Ownership moves through the queue: the producer gives the value up at
//!   `push`, the consumer is its sole owner after `pop`
//! - Overflow behavior is a policy parameter, not a call-site conditional:
//!   [`OverflowPolicy::Block`] parks the producer, [`OverflowPolicy::DropOldest`]
//!   evicts the front entry and hands it back to the caller
//! - `close()` ends the stream: producers are refused, consumers drain what
//!   is left and then observe `None`
//!
//! ## Example
//!
//! ```rust
//! use tabx_core::queue::{BoundedQueue, OverflowPolicy};
//!
//! let q: BoundedQueue<u32> = BoundedQueue::new(2, OverflowPolicy::DropOldest);
//! q.push(1).unwrap();
//! q.push(2).unwrap();
//! // Full: the oldest entry is evicted and returned
//! let evicted = q.push(3).unwrap();
//! assert_eq!(evicted, Some(1));
//!
//! q.close();
//! assert_eq!(q.pop(), Some(2));
//! assert_eq!(q.pop(), Some(3));
//! assert_eq!(q.pop(), None);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// What a full queue does to an incoming value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Park the producer until the consumer makes room.
    Block,
    /// Evict the oldest queued value to make room; never park.
    DropOldest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::Block
    }
}

/// The queue was closed; the value is handed back untouched.
#[derive(Debug, thiserror::Error)]
#[error("queue closed")]
pub struct QueueClosed<T>(pub T);

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    evicted: u64,
}

/// Bounded blocking queue with a configurable overflow policy.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` values (minimum 1).
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                evicted: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            policy,
        }
    }

    /// Maximum number of queued values.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current queue depth. A snapshot; stale as soon as it returns.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of values evicted so far under [`OverflowPolicy::DropOldest`].
    pub fn evicted(&self) -> u64 {
        self.inner.lock().unwrap().evicted
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Queue a value.
    ///
    /// Under `Block`, parks until space is available or the queue closes.
    /// Under `DropOldest`, returns `Ok(Some(oldest))` when a full queue had
    /// to evict. A closed queue refuses the value and hands it back.
    pub fn push(&self, value: T) -> Result<Option<T>, QueueClosed<T>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(QueueClosed(value));
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(value);
                self.not_empty.notify_one();
                return Ok(None);
            }
            match self.policy {
                OverflowPolicy::Block => {
                    inner = self.not_full.wait(inner).unwrap();
                }
                OverflowPolicy::DropOldest => {
                    let old = inner.items.pop_front();
                    inner.evicted += 1;
                    inner.items.push_back(value);
                    self.not_empty.notify_one();
                    return Ok(old);
                }
            }
        }
    }

    /// Take the oldest value, parking while the queue is empty and open.
    ///
    /// Returns `None` once the queue is closed and drained — the
    /// end-of-stream signal for consumer loops.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(value) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(value);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Take the oldest value if one is immediately available.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.items.pop_front();
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    /// Refuse further producers. Queued values stay poppable; once drained,
    /// `pop` returns `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

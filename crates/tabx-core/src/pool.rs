//! # Output Buffer Pool
//!
//! Pre-allocated pool of [`BlockBuffer`]s shared between a collector's output
//! loop and the downstream consumer. The pool is the pipeline's designed
//! backpressure point: when the consumer falls behind, the output loop parks
//! in [`BlockPool::acquire_blocking`] until a buffer comes back, and that
//! stall propagates upstream into the collector's bounded in-flight window.
//!
//! Buffers return to the pool automatically when their [`PoolBuffer`] handle
//! is dropped, so the consumer never has to hand them back explicitly.
//!
//! ## Example
//!
//! ```rust
//! use tabx_core::pool::BlockPool;
//!
//! let pool: BlockPool<f32> = BlockPool::new(2, 16, 4, 1);
//! assert_eq!(pool.available(), 2);
//!
//! let buf = pool.acquire_blocking();
//! assert_eq!(pool.available(), 1);
//! drop(buf);
//! assert_eq!(pool.available(), 2);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

use crate::block::BlockBuffer;
use crate::types::Element;

struct PoolInner<E> {
    free: Mutex<Vec<BlockBuffer<E>>>,
    returned: Condvar,
    count: usize,
    shape: (usize, usize, usize),
}

/// Fixed set of pre-allocated block buffers with blocking acquisition.
pub struct BlockPool<E: Element> {
    inner: Arc<PoolInner<E>>,
}

impl<E: Element> BlockPool<E> {
    /// Allocate `count` buffers shaped `(nr_samples, nr_subbands, nr_channels)`.
    pub fn new(count: usize, nr_samples: usize, nr_subbands: usize, nr_channels: usize) -> Self {
        let count = count.max(1);
        let free = (0..count)
            .map(|_| BlockBuffer::new(nr_samples, nr_subbands, nr_channels))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                returned: Condvar::new(),
                count,
                shape: (nr_samples, nr_subbands, nr_channels),
            }),
        }
    }

    /// Total number of buffers owned by the pool.
    pub fn buffer_count(&self) -> usize {
        self.inner.count
    }

    /// Shape of every buffer in the pool.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.inner.shape
    }

    /// Buffers currently free. A snapshot.
    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    /// Take a buffer if one is free right now.
    pub fn try_acquire(&self) -> Option<PoolBuffer<E>> {
        let buf = self.inner.free.lock().unwrap().pop()?;
        Some(PoolBuffer {
            pool: Arc::clone(&self.inner),
            buf: Some(buf),
        })
    }

    /// Take a buffer, parking until one is returned.
    pub fn acquire_blocking(&self) -> PoolBuffer<E> {
        let mut free = self.inner.free.lock().unwrap();
        loop {
            if let Some(buf) = free.pop() {
                return PoolBuffer {
                    pool: Arc::clone(&self.inner),
                    buf: Some(buf),
                };
            }
            free = self.inner.returned.wait(free).unwrap();
        }
    }
}

impl<E: Element> Clone for BlockPool<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Exclusive handle to one pooled buffer; returns it to the pool on drop.
pub struct PoolBuffer<E: Element> {
    pool: Arc<PoolInner<E>>,
    buf: Option<BlockBuffer<E>>,
}

impl<E: Element> Deref for PoolBuffer<E> {
    type Target = BlockBuffer<E>;

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().unwrap()
    }
}

impl<E: Element> DerefMut for PoolBuffer<E> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().unwrap()
    }
}

impl<E: Element> Drop for PoolBuffer<E> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.lock().unwrap().push(buf);
            self.pool.returned.notify_one();
        }
    }
}

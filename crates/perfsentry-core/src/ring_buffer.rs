//! Fixed-capacity sample storage.
//!
//! [`RingBuffer`] is the single-owner circular buffer; [`SampleRingBuffer`]
//! wraps it behind one lock so a sampler can publish while the aggregator
//! takes copies. Every sampler history in the engine is one of these.
//!
//! - **Thread snapshots**: newest N captures for the deadlock diff.
//! - **Frame intervals**: instantaneous window and per-second FPS history.
//! - **Hitch / block events**: bounded finding logs for reports.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// =============================================================================
// RingBuffer
// =============================================================================

/// A fixed-capacity ring buffer.
///
/// When the buffer is full, new items overwrite the oldest items.
/// Iteration yields items from oldest to newest.
pub struct RingBuffer<T> {
    buf: Vec<Option<T>>,
    capacity: usize,
    head: usize, // next write position
    len: usize,
    total: u64, // total items ever pushed
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0. Configured capacities are validated before
    /// they reach here.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);
        Self {
            buf,
            capacity,
            head: 0,
            len: 0,
            total: 0,
        }
    }

    /// Push an item, returning the evicted oldest item when full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = self.buf[self.head].replace(item);
        self.head = (self.head + 1) % self.capacity;
        self.total += 1;
        if self.len < self.capacity {
            self.len += 1;
            None
        } else {
            evicted
        }
    }

    fn start(&self) -> usize {
        if self.len < self.capacity { 0 } else { self.head }
    }

    /// Most recently pushed item.
    #[must_use]
    pub fn back(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.capacity - 1) % self.capacity;
        self.buf[idx].as_ref()
    }

    /// Oldest retained item.
    #[must_use]
    pub fn front(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.buf[self.start()].as_ref()
    }

    /// Item at logical index (0 = oldest).
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.buf[(self.start() + index) % self.capacity].as_ref()
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        let start = self.start();
        (0..self.len).filter_map(move |i| self.buf[(start + i) % self.capacity].as_ref())
    }

    /// The newest `n` items, oldest first.
    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &T> + '_ {
        self.iter().skip(self.len.saturating_sub(n))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items ever pushed (including overwrites).
    #[must_use]
    pub fn total_pushed(&self) -> u64 {
        self.total
    }

    /// Total items that were overwritten.
    #[must_use]
    pub fn total_evicted(&self) -> u64 {
        self.total.saturating_sub(self.len as u64)
    }

    /// Clear all items and counters.
    pub fn clear(&mut self) {
        for slot in &mut self.buf {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
        self.total = 0;
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> RingBufferStats {
        RingBufferStats {
            capacity: self.capacity,
            len: self.len,
            total_pushed: self.total,
            total_evicted: self.total_evicted(),
            fill_ratio: self.len as f64 / self.capacity as f64,
        }
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Collect to an owned Vec (oldest to newest).
    #[must_use]
    pub fn to_owned_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .field("total_pushed", &self.total)
            .finish()
    }
}

/// Serializable statistics about a ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingBufferStats {
    pub capacity: usize,
    pub len: usize,
    pub total_pushed: u64,
    /// Items dropped by overwrite.
    pub total_evicted: u64,
    /// len / capacity.
    pub fill_ratio: f64,
}

// =============================================================================
// SampleRingBuffer
// =============================================================================

/// Thread-safe [`RingBuffer`] shared between one sampler and its readers.
///
/// The lock is held only for the push or for the copy made by
/// [`snapshot`](Self::snapshot); consumers process the copy lock-free.
pub struct SampleRingBuffer<T> {
    inner: Mutex<RingBuffer<T>>,
}

impl<T> SampleRingBuffer<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    /// Publish a sample, evicting the oldest when full.
    pub fn push(&self, item: T) -> Option<T> {
        self.inner.lock().push(item)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    #[must_use]
    pub fn stats(&self) -> RingBufferStats {
        self.inner.lock().stats()
    }

    /// Drop every retained sample.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Run `f` against the buffer while holding the lock.
    ///
    /// Keep `f` short: writers wait for it.
    pub fn with<R>(&self, f: impl FnOnce(&RingBuffer<T>) -> R) -> R {
        f(&self.inner.lock())
    }
}

impl<T: Clone> SampleRingBuffer<T> {
    /// Owned copy of current contents, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().to_owned_vec()
    }

    /// The newest `n` samples, oldest first.
    #[must_use]
    pub fn last_n(&self, n: usize) -> Vec<T> {
        self.inner.lock().last_n(n).cloned().collect()
    }

    /// Most recent sample.
    #[must_use]
    pub fn latest(&self) -> Option<T> {
        self.inner.lock().back().cloned()
    }
}

impl<T> std::fmt::Debug for SampleRingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("SampleRingBuffer")
            .field("capacity", &stats.capacity)
            .field("len", &stats.len)
            .field("total_pushed", &stats.total_pushed)
            .finish()
    }
}

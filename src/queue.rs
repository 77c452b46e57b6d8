//! Bounded drop-oldest queues for live-plot consumers.
//!
//! A [`ChannelQueue`] favours recency over completeness: when full, `push`
//! evicts the single oldest item and appends the new one. The producer never
//! blocks and never loses the newest value. Plot consumers are visualization
//! only, so the persisted log never reads from these queues.
//!
//! [`ChannelQueue::split`] hands out one [`QueueWriter`] and one
//! [`QueueReader`]; neither is `Clone`, so each queue has exactly one producer
//! and one consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default capacity for high-rate telemetry channels.
pub const DEFAULT_CAPACITY: usize = 2000;

/// Bounded FIFO with drop-oldest admission.
#[derive(Debug)]
pub struct ChannelQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl<T> ChannelQueue<T> {
    /// Create a queue; a capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    /// Create a queue and split it into its two single-owner ends.
    pub fn split(capacity: usize) -> (QueueWriter<T>, QueueReader<T>) {
        let shared = Arc::new(Self::new(capacity));
        (QueueWriter { queue: Arc::clone(&shared) }, QueueReader { queue: shared })
    }

    // A panic while holding the lock cannot leave the deque half-updated, so
    // the poisoned guard is still consistent.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, evicting the oldest one when full.
    pub fn push(&self, item: T) {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            items.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(item);
    }

    /// Take the oldest item, if any.
    pub fn pop_nowait(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Take up to `max` items in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.lock();
        let n = items.len().min(max);
        items.drain(..n).collect()
    }

    /// Items currently buffered.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted by drop-oldest since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Producer end of a queue. Owned by the router.
#[derive(Debug)]
pub struct QueueWriter<T> {
    queue: Arc<ChannelQueue<T>>,
}

impl<T> QueueWriter<T> {
    pub fn push(&self, item: T) {
        self.queue.push(item);
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    /// Whether the reader has been dropped.
    pub fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.queue) == 1
    }
}

/// Consumer end of a queue. Owned by exactly one plot consumer.
#[derive(Debug)]
pub struct QueueReader<T> {
    queue: Arc<ChannelQueue<T>>,
}

impl<T> QueueReader<T> {
    pub fn pop_nowait(&self) -> Option<T> {
        self.queue.pop_nowait()
    }

    pub fn drain(&self, max: usize) -> Vec<T> {
        self.queue.drain(max)
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn evicted(&self) -> u64 {
        self.queue.evicted()
    }

    /// Whether the writer has been dropped.
    pub fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.queue) == 1
    }
}

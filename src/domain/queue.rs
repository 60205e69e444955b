//! Bounded intake queue feeding the dispatch loop.
//!
//! Capacity is checked under the same lock that inserts, so admission
//! decisions are atomic with respect to concurrent producers. The queue
//! carries no policy itself; backpressure behavior lives in the resilience
//! layer, which composes these primitives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify};

/// A bounded FIFO queue with wakeup notification for a single consumer.
pub struct IntakeQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    high_watermark: AtomicUsize,
    dropped: AtomicU64,
}

impl<T> IntakeQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
            high_watermark: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append an item, failing when the queue is full. The item is handed
    /// back on failure so the caller can retry or answer the producer.
    pub async fn try_push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        self.record_depth(items.len());
        drop(items);
        self.notify.notify_one();
        Ok(())
    }

    /// Remove and return the first item matching the predicate.
    pub async fn remove_where(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let mut items = self.items.lock().await;
        let idx = items.iter().position(|item| pred(item))?;
        items.remove(idx)
    }

    /// Append an item, evicting the oldest entry when full. Returns the
    /// evicted item so the caller can answer its producer.
    pub async fn push_dropping_oldest(&self, item: T) -> Option<T> {
        let mut items = self.items.lock().await;
        let evicted = if items.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        self.record_depth(items.len());
        drop(items);
        self.notify.notify_one();
        evicted
    }

    /// Remove up to `max` items from the front, preserving order.
    pub async fn pop_batch(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock().await;
        let take = max.min(items.len());
        items.drain(..take).collect()
    }

    /// Remove and return everything currently queued.
    pub async fn drain_all(&self) -> Vec<T> {
        let mut items = self.items.lock().await;
        items.drain(..).collect()
    }

    /// Current number of queued items.
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    /// Whether the queue is currently empty.
    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Current depth as a fraction of capacity, in `0.0..=1.0`.
    pub async fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.items.lock().await.len() as f64 / self.capacity as f64
        }
    }

    /// Configured capacity.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deepest the queue has ever been.
    pub fn high_watermark(&self) -> usize {
        self.high_watermark.load(Ordering::Relaxed)
    }

    /// Total items evicted by [`Self::push_dropping_oldest`].
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until a producer pushes. Spurious wakeups are possible; callers
    /// re-check emptiness after waking.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Wake the consumer without pushing, used during shutdown.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    fn record_depth(&self, depth: usize) {
        self.high_watermark.fetch_max(depth, Ordering::Relaxed);
    }
}

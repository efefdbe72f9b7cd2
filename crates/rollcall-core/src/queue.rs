//! Bounded capture→processing hand-off that drops the oldest frame when full.
//!
//! The producer never blocks: a stale frame is worth nothing for blink timing,
//! so under backpressure the queue discards from the front.

use crate::types::Frame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    Timeout,
    /// Closed and fully drained.
    Closed,
}

struct Slots<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct FrameQueue<T = Frame> {
    slots: Mutex<Slots<T>>,
    ready: Condvar,
    capacity: usize,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl<T> FrameQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(Slots {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue, evicting the oldest item when full.
    ///
    /// Returns `false` if the queue is closed and the item was discarded.
    pub fn push(&self, item: T) -> bool {
        let mut slots = self.lock();
        if slots.closed {
            return false;
        }
        if slots.items.len() >= self.capacity {
            slots.items.pop_front();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(dropped = total, "frame queue full, dropped oldest");
        }
        slots.items.push_back(item);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        drop(slots);
        self.ready.notify_one();
        true
    }

    /// Wait up to `timeout` for the oldest queued item.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, PopError> {
        let slots = self.lock();
        let (mut slots, _) = self
            .ready
            .wait_timeout_while(slots, timeout, |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        match slots.items.pop_front() {
            Some(item) => Ok(item),
            None if slots.closed => Err(PopError::Closed),
            None => Err(PopError::Timeout),
        }
    }

    /// Block until an item arrives; `None` once closed and drained.
    pub fn pop(&self) -> Option<T> {
        let slots = self.lock();
        let mut slots = self
            .ready
            .wait_while(slots, |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        slots.items.pop_front()
    }

    /// Stop accepting items; queued items can still be drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

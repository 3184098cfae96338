//! Bounded hand-off queues between pipeline stages
//!
//! Producers never block: when the queue is full the oldest droppable entry
//! makes room. Entries that must not be dropped are refused instead, and the
//! producer is told so it can treat the loss as a sequence gap.

use crate::image::I420Image;
use camlink_core::Frame;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Instant;

/// Entries a [`StageQueue`] can evict under pressure
pub trait Droppable {
    /// Whether a full queue may discard this entry
    fn can_drop(&self) -> bool;
}

impl Droppable for Frame {
    fn can_drop(&self) -> bool {
        self.frame_type.can_drop()
    }
}

impl Droppable for I420Image {
    fn can_drop(&self) -> bool {
        true
    }
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without loss
    Queued,
    /// Queued after evicting the oldest droppable entry
    EvictedOldest,
    /// The incoming entry was droppable and nothing queued was; it was dropped
    DroppedIncoming,
    /// Queue full of entries that must not be dropped; the incoming entry was refused
    Overflow,
    /// Queue has been closed
    Closed,
}

impl PushOutcome {
    /// Whether something was lost
    pub fn lost_entry(&self) -> bool {
        !matches!(self, PushOutcome::Queued)
    }
}

struct Inner<T> {
    items: VecDeque<(T, Instant)>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer queue
pub struct StageQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T: Droppable> StageQueue<T> {
    /// Create a queue holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue without blocking
    pub fn push(&self, item: T) -> PushOutcome {
        let mut inner = self.inner.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }

        let mut outcome = PushOutcome::Queued;
        if inner.items.len() >= self.capacity {
            match inner.items.iter().position(|(queued, _)| queued.can_drop()) {
                Some(index) => {
                    inner.items.remove(index);
                    outcome = PushOutcome::EvictedOldest;
                }
                None if item.can_drop() => return PushOutcome::DroppedIncoming,
                None => return PushOutcome::Overflow,
            }
        }

        inner.items.push_back((item, Instant::now()));
        drop(inner);
        self.ready.notify_one();
        outcome
    }

    /// Wait for the next entry and the time it was queued
    ///
    /// Returns `None` once the queue is closed; entries still queued at that
    /// point are discarded.
    pub fn pop(&self) -> Option<(T, Instant)> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(entry) = inner.items.pop_front() {
                return Some(entry);
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Close the queue, drop queued entries and wake the consumer
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.items.clear();
        drop(inner);
        self.ready.notify_all();
    }

    /// Entries currently queued
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

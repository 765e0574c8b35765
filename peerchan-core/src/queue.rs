//! Bounded event queue between engine-side producers and the host-side dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use tracing::warn;

use crate::error::{Result, SessionError};
use crate::event::Event;

/// Default number of slots.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Fixed-capacity FIFO. `push` never blocks: when full, the new event is dropped and counted.
pub struct EventQueue {
    slots: ArrayQueue<Event>,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SessionError::AllocationFailure("event queue"));
        }
        Ok(Self {
            slots: ArrayQueue::new(capacity),
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueue without blocking. Returns false if the queue was full and the event dropped.
    pub fn push(&self, event: Event) -> bool {
        match self.slots.push(event) {
            Ok(()) => true,
            Err(rejected) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    category = ?rejected.category(),
                    capacity = self.slots.capacity(),
                    dropped_total = total,
                    "event queue full, dropping event"
                );
                false
            }
        }
    }

    pub fn pop(&self) -> Option<Event> {
        self.slots.pop()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

//! In-process event channel
//!
//! A fixed pool of [`CapturedEvent`] records cycling between two lock-free
//! queues:
//!
//! ```text
//!   free ──reserve──▶ (slot being filled) ──commit──▶ ready ──pop──▶ consumer
//!    ▲                        │                                        │
//!    └────────discard─────────┘                                        │
//!    └───────────────────────────── guard dropped ─────────────────────┘
//! ```
//!
//! A record only enters `ready` once it is fully written, so the consumer
//! never observes a reserved-but-uncommitted slot. When `free` is empty the
//! channel is full and `reserve` returns `None`; the producer drops its event
//! and never waits.

use crossbeam::queue::ArrayQueue;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use tlstap_common::{CapturedEvent, EventChannel, EventSlot};

/// Bounded ring of fixed-size event records
pub struct EventRing {
    free: ArrayQueue<Box<CapturedEvent>>,
    ready: ArrayQueue<Box<CapturedEvent>>,
    committed: AtomicU64,
    rejected: AtomicU64,
}

impl EventRing {
    /// Create a ring holding at most `capacity` records.
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event ring capacity must be > 0");

        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            // Cannot fail: exactly `capacity` pushes into an empty queue
            let _ = free.push(Box::new(CapturedEvent::zeroed()));
        }

        Self {
            free,
            ready: ArrayQueue::new(capacity),
            committed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Committed records waiting for the consumer
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Take the oldest committed record.
    ///
    /// The record goes back to the free pool when the returned guard drops.
    pub fn pop(&self) -> Option<Committed<'_>> {
        self.ready.pop().map(|record| Committed {
            ring: self,
            record: Some(record),
        })
    }

    /// Total records committed since creation
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Total reservations refused because the ring was full
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn recycle(&self, record: Box<CapturedEvent>) {
        // The pool never holds more records than it was created with
        let _ = self.free.push(record);
    }
}

impl EventChannel for EventRing {
    type Slot<'a>
        = RingSlot<'a>
    where
        Self: 'a;

    fn reserve(&self) -> Option<RingSlot<'_>> {
        match self.free.pop() {
            Some(record) => Some(RingSlot {
                ring: self,
                record: Some(record),
            }),
            None => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

/// A reserved record being filled by a producer
pub struct RingSlot<'a> {
    ring: &'a EventRing,
    record: Option<Box<CapturedEvent>>,
}

impl EventSlot for RingSlot<'_> {
    fn event(&mut self) -> &mut CapturedEvent {
        // Only `commit`/`discard`/`drop` take the record, and all consume self
        self.record
            .as_deref_mut()
            .expect("slot record present until commit or discard")
    }

    fn commit(mut self) {
        if let Some(record) = self.record.take() {
            match self.ring.ready.push(record) {
                Ok(()) => {
                    self.ring.committed.fetch_add(1, Ordering::Relaxed);
                }
                Err(record) => self.ring.recycle(record),
            }
        }
    }

    fn discard(mut self) {
        if let Some(record) = self.record.take() {
            self.ring.recycle(record);
        }
    }
}

impl Drop for RingSlot<'_> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.ring.recycle(record);
        }
    }
}

/// A committed record handed to the consumer
pub struct Committed<'a> {
    ring: &'a EventRing,
    record: Option<Box<CapturedEvent>>,
}

impl Deref for Committed<'_> {
    type Target = CapturedEvent;

    fn deref(&self) -> &CapturedEvent {
        self.record
            .as_deref()
            .expect("committed record present until drop")
    }
}

impl Drop for Committed<'_> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.ring.recycle(record);
        }
    }
}

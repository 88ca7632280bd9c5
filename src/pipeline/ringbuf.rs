//! Fixed pool of frame buffers filled by a single writer.
//!
//! The writer appends transfer payloads into the `next` slot, then either
//! commits it (publishing it as `last`) or rolls it back. Slots are
//! allocated once; after `capacity` commits the oldest slot is overwritten
//! whether or not anybody looked at it.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use thiserror::Error;

/// The current slot cannot hold the appended bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frame slot overflow: {len} + {extra} exceeds {capacity} bytes")]
pub struct Overflow {
    pub len: usize,
    pub extra: usize,
    pub capacity: usize,
}

pub struct RingBuffer {
    slots: Vec<Vec<u8>>,
    slot_size: usize,
    next: usize,
    last: Option<usize>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    overflows: AtomicUsize,
}

/// Snapshot of the ring counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    pub commits: usize,
    pub rollbacks: usize,
    pub overflows: usize,
}

impl RingBuffer {
    /// `count` slots of `slot_size` bytes each, allocated up front.
    pub fn new(count: usize, slot_size: usize) -> Self {
        let count = count.max(1);
        Self {
            slots: (0..count).map(|_| Vec::with_capacity(slot_size)).collect(),
            slot_size,
            next: 0,
            last: None,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Copy `data` onto the frame being assembled.
    pub fn append(&mut self, data: &[u8]) -> Result<(), Overflow> {
        let slot = &mut self.slots[self.next];
        if slot.len() + data.len() > self.slot_size {
            self.stats.overflows.fetch_add(1, Ordering::Relaxed);
            return Err(Overflow {
                len: slot.len(),
                extra: data.len(),
                capacity: self.slot_size,
            });
        }
        slot.extend_from_slice(data);
        Ok(())
    }

    /// Publish the frame being assembled and move on to the next slot.
    pub fn commit(&mut self) -> &[u8] {
        let committed = self.next;
        self.last = Some(committed);
        self.next = (self.next + 1) % self.slots.len();
        self.slots[self.next].clear();
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        &self.slots[committed]
    }

    /// Drop whatever was appended since the last commit.
    pub fn rollback(&mut self) {
        self.slots[self.next].clear();
        self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes appended to the frame being assembled.
    pub fn len(&self) -> usize {
        self.slots[self.next].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recently committed frame.
    pub fn last(&self) -> Option<&[u8]> {
        self.last.map(|i| self.slots[i].as_slice())
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            commits: self.stats.commits.load(Ordering::Relaxed),
            rollbacks: self.stats.rollbacks.load(Ordering::Relaxed),
            overflows: self.stats.overflows.load(Ordering::Relaxed),
        }
    }
}

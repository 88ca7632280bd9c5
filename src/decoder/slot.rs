//! Per-slot working sets with a pending-request token.
//!
//! `K` is whatever a backend needs to find out whether the slot's work is
//! done: `()` for backends that finish inside `request`, a GPU submission
//! index otherwise.

use crate::{Error, Result};

#[derive(Debug)]
struct Slot<T, K> {
    state: T,
    pending: Option<K>,
}

#[derive(Debug)]
pub struct SlotPool<T, K = ()> {
    slots: Vec<Slot<T, K>>,
}

impl<T, K> SlotPool<T, K> {
    pub fn new(count: usize, mut init: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: (0..count)
                .map(|i| Slot {
                    state: init(i),
                    pending: None,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, slot: usize) -> Result<&Slot<T, K>> {
        let count = self.slots.len();
        self.slots.get(slot).ok_or(Error::InvalidSlot { slot, count })
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut Slot<T, K>> {
        let count = self.slots.len();
        self.slots
            .get_mut(slot)
            .ok_or(Error::InvalidSlot { slot, count })
    }

    pub fn get(&self, slot: usize) -> Result<&T> {
        Ok(&self.slot(slot)?.state)
    }

    pub fn get_mut(&mut self, slot: usize) -> Result<&mut T> {
        Ok(&mut self.slot_mut(slot)?.state)
    }

    /// Record `token` as the slot's pending work, returning the token it
    /// replaces. A replaced request is never fetched.
    pub fn submit(&mut self, slot: usize, token: K) -> Result<Option<K>> {
        Ok(self.slot_mut(slot)?.pending.replace(token))
    }

    pub fn pending(&self, slot: usize) -> Result<Option<&K>> {
        Ok(self.slot(slot)?.pending.as_ref())
    }

    pub fn is_pending(&self, slot: usize) -> bool {
        self.slots.get(slot).is_some_and(|s| s.pending.is_some())
    }

    /// Take the pending token of `slot` along with its state.
    pub fn complete(&mut self, slot: usize) -> Result<(K, &mut T)> {
        let entry = self.slot_mut(slot)?;
        let token = entry.pending.take().ok_or(Error::NotRequested(slot))?;
        Ok((token, &mut entry.state))
    }

    /// Take every pending token, in slot order.
    pub fn drain_pending(&mut self) -> Vec<(usize, K)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.pending.take().map(|k| (i, k)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().map(|s| &s.state)
    }
}

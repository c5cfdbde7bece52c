//! Fixed-capacity event table owned by one device.

use super::EventDescriptor;
use crate::backend::NativeEvent;
use crate::error::{Error, Result};
use parking_lot::Mutex;

/// What the pool records for a bound `local_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSlot {
    pub descriptor: EventDescriptor,
    pub tag: u64,
    pub native: NativeEvent,
}

#[derive(Debug, Default)]
struct PoolInner {
    slots: Vec<Option<EventSlot>>,
    free: Vec<usize>,
    in_use: usize,
}

/// `local_id -> (descriptor, tag, native)` with a LIFO free list.
///
/// Slots are created lazily up to `capacity`; released ids are reused before
/// new ones are minted.
#[derive(Debug)]
pub struct EventPool {
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl EventPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// Bind `slot` to a free `local_id`.
    pub fn register(&self, slot: EventSlot) -> Result<usize> {
        let mut inner = self.inner.lock();
        let local_id = match inner.free.pop() {
            Some(id) => id,
            None if inner.slots.len() < self.capacity => {
                inner.slots.push(None);
                inner.slots.len() - 1
            }
            None => {
                return Err(Error::EventPoolExhausted {
                    capacity: self.capacity,
                })
            }
        };
        inner.slots[local_id] = Some(slot);
        inner.in_use += 1;
        Ok(local_id)
    }

    /// Unbind `local_id` and return what it held.
    pub fn release(&self, local_id: usize) -> Result<EventSlot> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(local_id)
            .and_then(Option::take)
            .ok_or_else(|| Error::invalid_state(format!("event {} is not bound", local_id)))?;
        inner.free.push(local_id);
        inner.in_use -= 1;
        Ok(slot)
    }

    /// `None` when `local_id` is not bound.
    pub fn lookup(&self, local_id: usize) -> Option<EventSlot> {
        self.inner.lock().slots.get(local_id).copied().flatten()
    }
}

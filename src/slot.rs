//! # Shared Slot Pool
//!
//! Fixed-size shared-memory slots used to move computed payloads from
//! worker processes back to the consumer without a pipe copy.
//!
//! The pool is one `MAP_SHARED` mapping over an unlinked temp file,
//! partitioned into equally sized slots. Forked workers inherit the mapping,
//! so a worker can encode a payload in place and hand over nothing but a
//! slot id. The unlinked backing file keeps cleanup automatic: once the last
//! mapping goes away the memory is gone, there is no name to leak.
//!
//! Ownership protocol:
//! - `acquire` hands out a free [`SlotId`]; at most one live task ever owns
//!   a given slot.
//! - the owning worker writes the whole payload before its result frame is
//!   sent; the parent reads the region only after that frame arrives, so the
//!   pipe message is the synchronization point.
//! - `release` returns the slot once the payload has been decoded.

use crossbeam_queue::ArrayQueue;
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Identifies one slot in the pool for the lifetime of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SlotId(pub u32);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    /// The payload does not fit in one slot; the task must fall back to
    /// in-band serialized transport.
    #[error("payload of {required} bytes exceeds slot capacity of {capacity} bytes")]
    TooLarge { required: usize, capacity: usize },
    /// No free slot at assignment time. The scheduler sizes the pool to the
    /// delivery window, so this indicates a bookkeeping bug, not load.
    #[error("all {capacity} slots are in flight")]
    Exhausted { capacity: usize },
    /// A slot id outside the pool, which only a corrupt frame can produce.
    #[error("slot {id} out of range for pool of {count} slots")]
    InvalidSlot { id: u32, count: usize },
}

/// A pool of `count` shared-memory slots of `slot_size` bytes each.
pub struct SlotPool {
    map: MmapMut,
    slot_size: usize,
    count: usize,
    free: ArrayQueue<SlotId>,
}

impl SlotPool {
    pub fn new(count: usize, slot_size: usize) -> io::Result<Self> {
        assert!(count > 0, "slot pool needs at least one slot");
        assert!(slot_size > 0, "slot size must be positive");
        let file = tempfile::tempfile()?;
        file.set_len((count * slot_size) as u64)?;
        // SAFETY: the mapping covers an unlinked temp file that this process
        // just created; nothing else can resize it. Concurrent access is
        // bounded by the single-owner slot protocol above.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let free = ArrayQueue::new(count);
        for id in 0..count as u32 {
            let _ = free.push(SlotId(id));
        }
        Ok(SlotPool { map, slot_size, count, free })
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.count
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Takes ownership of a free slot.
    pub fn acquire(&self) -> Result<SlotId, SlotError> {
        self.free
            .pop()
            .ok_or(SlotError::Exhausted { capacity: self.count })
    }

    /// Returns a slot to the pool once its payload has been fully read.
    pub fn release(&self, id: SlotId) {
        let returned = self.free.push(id);
        debug_assert!(returned.is_ok(), "slot {} released twice", id.0);
    }

    /// Read access to the first `len` bytes of a slot.
    pub fn region(&self, id: SlotId, len: usize) -> Result<&[u8], SlotError> {
        if id.0 as usize >= self.count {
            return Err(SlotError::InvalidSlot { id: id.0, count: self.count });
        }
        if len > self.slot_size {
            return Err(SlotError::TooLarge { required: len, capacity: self.slot_size });
        }
        let start = id.0 as usize * self.slot_size;
        Ok(&self.map[start..start + len])
    }

    /// Copies a serialized payload into a slot.
    pub fn write(&mut self, id: SlotId, payload: &[u8]) -> Result<(), SlotError> {
        if id.0 as usize >= self.count {
            return Err(SlotError::InvalidSlot { id: id.0, count: self.count });
        }
        if payload.len() > self.slot_size {
            return Err(SlotError::TooLarge { required: payload.len(), capacity: self.slot_size });
        }
        let start = id.0 as usize * self.slot_size;
        self.map[start..start + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Raw write handle for a forked worker. Captured before the fork so the
    /// child addresses the same pages the parent mapped.
    pub(crate) fn writer(&mut self) -> SlotWriter {
        let base: &mut [u8] = &mut self.map;
        SlotWriter { base: base.as_mut_ptr(), slot_size: self.slot_size, count: self.count }
    }
}

/// Write access to the slot mapping from inside a worker process.
#[derive(Clone, Copy)]
pub(crate) struct SlotWriter {
    base: *mut u8,
    slot_size: usize,
    count: usize,
}

impl SlotWriter {
    pub(crate) fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// The full byte region of `id`.
    ///
    /// SAFETY: callers must be the single task owner of `id`, and must call
    /// this from the worker the task was assigned to. The parent does not
    /// touch the region until the worker's result frame for `id` arrives.
    pub(crate) unsafe fn region_mut(&self, id: SlotId) -> &mut [u8] {
        debug_assert!((id.0 as usize) < self.count);
        // SAFETY: the mapping outlives every worker (the pool is dropped only
        // after workers are reaped) and slots are disjoint per the ownership
        // protocol, so no aliasing write can exist.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base.add(id.0 as usize * self.slot_size),
                self.slot_size,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn acquire_hands_out_distinct_slots_until_exhausted() {
        let pool = SlotPool::new(4, 64).unwrap();
        assert_eq!(pool.available(), 4);
        let mut seen = HashSet::new();
        for _ in 0..4 {
            assert!(seen.insert(pool.acquire().unwrap()));
        }
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.acquire(), Err(SlotError::Exhausted { capacity: 4 }));
        for id in seen {
            pool.release(id);
        }
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn slots_round_trip_payloads() {
        let mut pool = SlotPool::new(2, 16).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.write(a, b"first").unwrap();
        pool.write(b, b"second").unwrap();
        assert_eq!(pool.region(a, 5).unwrap(), b"first");
        assert_eq!(pool.region(b, 6).unwrap(), b"second");
    }

    #[test]
    fn oversized_payloads_are_rejected_with_sizes() {
        let mut pool = SlotPool::new(1, 8).unwrap();
        let id = pool.acquire().unwrap();
        let err = pool.write(id, &[0u8; 9]).unwrap_err();
        assert_eq!(err, SlotError::TooLarge { required: 9, capacity: 8 });
        assert_eq!(
            pool.region(id, 9).unwrap_err(),
            SlotError::TooLarge { required: 9, capacity: 8 }
        );
    }

    #[test]
    fn foreign_slot_ids_are_rejected() {
        let pool = SlotPool::new(2, 8).unwrap();
        assert_eq!(
            pool.region(SlotId(7), 1).unwrap_err(),
            SlotError::InvalidSlot { id: 7, count: 2 }
        );
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn releasing_into_a_full_pool_panics_in_debug() {
        let pool = SlotPool::new(1, 8).unwrap();
        pool.release(SlotId(0));
    }

    #[test]
    fn writer_addresses_the_same_slots() {
        let mut pool = SlotPool::new(2, 8).unwrap();
        let writer = pool.writer();
        let id = pool.acquire().unwrap();
        // SAFETY: single-threaded test, single owner.
        let region = unsafe { writer.region_mut(id) };
        region[..4].copy_from_slice(b"ping");
        assert_eq!(pool.region(id, 4).unwrap(), b"ping");
    }
}

//! Priority-ordered subtable vector.
//!
//! Lookup walks subtables in descending max-priority order and stops as
//! soon as the best match so far beats everything that follows. The
//! vector is an immutable snapshot: the writer rebuilds it, sorts it and
//! publishes it with a single pointer swap.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{Atomic, Guard, Owned};

use crate::subtable::Subtable;
use crate::sync::drop_atomic;

pub(crate) struct PVecEntry {
    /// The subtable's max priority at publication time.
    pub priority: u32,
    pub subtable: Arc<Subtable>,
}

pub(crate) struct PVector {
    slots: Atomic<Vec<PVecEntry>>,
}

impl PVector {
    pub fn new() -> Self {
        PVector { slots: Atomic::new(Vec::new()) }
    }

    #[inline]
    pub fn load<'g>(&self, guard: &'g Guard) -> &'g [PVecEntry] {
        unsafe { self.slots.load(Ordering::Acquire, guard).deref() }.as_slice()
    }

    /// Writer: publish a new snapshot, highest priority first.
    pub fn publish(&self, mut entries: Vec<PVecEntry>, guard: &Guard) {
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        let old = self.slots.swap(Owned::new(entries), Ordering::AcqRel, guard);
        unsafe { guard.defer_destroy(old) };
    }
}

impl Drop for PVector {
    fn drop(&mut self) {
        drop_atomic(&self.slots);
    }
}

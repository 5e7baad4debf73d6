//! Single-writer / many-reader container primitives.
//!
//! Readers never block: every pointer a reader traverses is a
//! `crossbeam_epoch::Atomic` loaded under a pinned guard, and writers
//! retire replaced memory through the epoch collector so it outlives every
//! guard pinned before retirement.

pub(crate) mod cmap;
pub(crate) mod pvector;

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic};

/// Drop whatever `cell` currently points at. Only valid with exclusive
/// access (`Drop` impls), when no reader can hold the pointee.
pub(crate) fn drop_atomic<T>(cell: &Atomic<T>) {
    unsafe {
        let guard = epoch::unprotected();
        let cur = cell.load(Ordering::Relaxed, guard);
        if !cur.is_null() {
            drop(cur.into_owned());
        }
    }
}

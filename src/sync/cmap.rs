//! A hash map for one writer and any number of wait-free readers.
//!
//! Buckets hold singly linked chains of epoch-managed nodes. Duplicate
//! hashes are permitted (the map is effectively a multimap keyed by
//! digest), so lookups take a predicate. The writer grows the table by
//! building a fresh bucket array of shallow node copies and publishing it
//! in one pointer store; readers keep using the retired table until their
//! guard drops.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};

use crate::hint::likely;

const MIN_BUCKETS: usize = 8;

/// Payloads are duplicated when the table grows; the copy must alias the
/// original's pointees rather than own them, so plain `Clone` is not the
/// right bound.
pub(crate) trait ShallowClone {
    fn shallow_clone(&self) -> Self;
}

impl ShallowClone for () {
    #[inline]
    fn shallow_clone(&self) {}
}

pub(crate) struct Node<T> {
    hash: u64,
    value: T,
    next: Atomic<Node<T>>,
}

struct Table<T> {
    mask: usize,
    buckets: Box<[Atomic<Node<T>>]>,
}

impl<T> Table<T> {
    fn new(buckets: usize) -> Self {
        debug_assert!(buckets.is_power_of_two());
        let buckets: Box<[Atomic<Node<T>>]> =
            (0..buckets).map(|_| Atomic::null()).collect();
        Table { mask: buckets.len() - 1, buckets }
    }

    #[inline]
    fn bucket(&self, hash: u64) -> &Atomic<Node<T>> {
        &self.buckets[(hash as usize) & self.mask]
    }
}

pub(crate) struct CMap<T> {
    table: Atomic<Table<T>>,
    len: AtomicUsize,
}

impl<T: ShallowClone> CMap<T> {
    pub fn new() -> Self {
        CMap {
            table: Atomic::new(Table::new(MIN_BUCKETS)),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writer: insert a node for `hash`. Duplicates are fine.
    pub fn insert(&self, hash: u64, value: T, guard: &Guard) {
        self.maybe_grow(guard);
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        let bucket = table.bucket(hash);
        let head = bucket.load(Ordering::Acquire, guard);
        let node = Owned::new(Node { hash, value, next: Atomic::null() });
        node.next.store(head, Ordering::Relaxed);
        bucket.store(node, Ordering::Release);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Writer: unlink and retire the first node matching `hash` and `pred`.
    pub fn remove_one(
        &self,
        hash: u64,
        mut pred: impl FnMut(&T) -> bool,
        guard: &Guard,
    ) -> bool {
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        let mut cell = table.bucket(hash);
        let mut cur = cell.load(Ordering::Acquire, guard);
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.hash == hash && pred(&node.value) {
                let next = node.next.load(Ordering::Acquire, guard);
                cell.store(next, Ordering::Release);
                unsafe { guard.defer_destroy(cur) };
                self.len.fetch_sub(1, Ordering::Relaxed);
                return true;
            }
            cell = &node.next;
            cur = cell.load(Ordering::Acquire, guard);
        }
        false
    }

    /// Reader: first value matching `hash` and `pred`.
    #[inline]
    pub fn find<'g>(
        &self,
        hash: u64,
        mut pred: impl FnMut(&T) -> bool,
        guard: &'g Guard,
    ) -> Option<&'g T> {
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        let mut cur = table.bucket(hash).load(Ordering::Acquire, guard);
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.hash == hash && pred(&node.value) {
                return Some(&node.value);
            }
            cur = node.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Reader: is any node present for `hash`? The staged-index probe.
    #[inline]
    pub fn contains(&self, hash: u64, guard: &Guard) -> bool {
        self.find(hash, |_| true, guard).is_some()
    }

    /// Snapshot iteration over every value. The iterator is only coherent
    /// for the guard it was created with.
    pub fn iter<'g>(&self, guard: &'g Guard) -> CMapIter<'g, T> {
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        CMapIter { table, bucket: 0, cur: None, guard }
    }

    fn maybe_grow(&self, guard: &Guard) {
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        if likely(self.len() < table.buckets.len()) {
            return;
        }
        let new = Table::new(table.buckets.len() * 2);
        for bucket in table.buckets.iter() {
            let mut cur = bucket.load(Ordering::Acquire, guard);
            while let Some(node) = unsafe { cur.as_ref() } {
                let target = new.bucket(node.hash);
                let copy = Owned::new(Node {
                    hash: node.hash,
                    value: node.value.shallow_clone(),
                    next: Atomic::null(),
                });
                copy.next.store(target.load(Ordering::Relaxed, guard), Ordering::Relaxed);
                target.store(copy, Ordering::Relaxed);
                cur = node.next.load(Ordering::Acquire, guard);
            }
        }
        let old = self.table.swap(Owned::new(new), Ordering::AcqRel, guard);
        unsafe {
            // Old nodes are shallow-retired; their pointees now belong to
            // the copies in the new table.
            let t = old.deref();
            for bucket in t.buckets.iter() {
                let mut cur = bucket.load(Ordering::Relaxed, guard);
                while let Some(node) = cur.as_ref() {
                    let next = node.next.load(Ordering::Relaxed, guard);
                    guard.defer_destroy(cur);
                    cur = next;
                }
            }
            guard.defer_destroy(old);
        }
    }
}

impl<T> Drop for CMap<T> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let table = self.table.load(Ordering::Relaxed, guard);
            if let Some(t) = table.as_ref() {
                for bucket in t.buckets.iter() {
                    let mut cur = bucket.load(Ordering::Relaxed, guard);
                    while !cur.is_null() {
                        let next = cur.deref().next.load(Ordering::Relaxed, guard);
                        drop(cur.into_owned());
                        cur = next;
                    }
                }
                drop(table.into_owned());
            }
        }
    }
}

pub(crate) struct CMapIter<'g, T> {
    table: &'g Table<T>,
    bucket: usize,
    cur: Option<&'g Node<T>>,
    guard: &'g Guard,
}

impl<'g, T> Iterator for CMapIter<'g, T> {
    type Item = &'g T;

    fn next(&mut self) -> Option<&'g T> {
        loop {
            if let Some(node) = self.cur.take() {
                self.cur = unsafe {
                    node.next.load(Ordering::Acquire, self.guard).as_ref()
                };
                return Some(&node.value);
            }
            if self.bucket >= self.table.buckets.len() {
                return None;
            }
            self.cur = unsafe {
                self.table.buckets[self.bucket]
                    .load(Ordering::Acquire, self.guard)
                    .as_ref()
            };
            self.bucket += 1;
        }
    }
}

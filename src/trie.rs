//! Per-field prefix tries.
//!
//! A trie tracks, for one prefix-eligible field, which prefix lengths are
//! present in the classifier and how many rules sit at each. Lookup
//! returns the deepest prefix length with at least one rule together with
//! the number of value bits the descent examined; the classifier can then
//! skip every subtable that constrains the field to a longer prefix,
//! without un-wildcarding anything beyond the examined bits.
//!
//! Nodes are path compressed: an edge carries up to 64 bits, MSB first,
//! and the branch bit doubles as the first bit of each child's edge.
//! Readers traverse edges through epoch pointers; the writer replaces
//! split or merged nodes wholesale and retires the originals.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::flow::FieldId;

pub(crate) struct TrieNode {
    /// Edge bits, MSB-aligned; bits past `n_bits` are zero.
    prefix: u64,
    n_bits: u8,
    /// Rules whose prefix ends exactly at this node.
    n_rules: AtomicU32,
    edges: [Atomic<TrieNode>; 2],
}

impl TrieNode {
    fn new(prefix: u64, n_bits: u8, n_rules: u32) -> TrieNode {
        debug_assert!(n_bits as usize <= 64);
        debug_assert_eq!(prefix & !upper_mask(n_bits), 0);
        TrieNode {
            prefix,
            n_bits,
            n_rules: AtomicU32::new(n_rules),
            edges: [Atomic::null(), Atomic::null()],
        }
    }

    /// Copy of this node minus the first `cut` edge bits, sharing the
    /// children. Used when an edge is split.
    fn tail(&self, cut: u8, guard: &Guard) -> TrieNode {
        debug_assert!(cut < self.n_bits);
        let node = TrieNode::new(
            (self.prefix << cut) & upper_mask(self.n_bits - cut),
            self.n_bits - cut,
            self.n_rules.load(Ordering::Relaxed),
        );
        node.edges[0].store(self.edges[0].load(Ordering::Relaxed, guard), Ordering::Relaxed);
        node.edges[1].store(self.edges[1].load(Ordering::Relaxed, guard), Ordering::Relaxed);
        node
    }

    #[inline]
    fn bit_at(&self, idx: u8) -> usize {
        ((self.prefix >> (63 - idx)) & 1) as usize
    }
}

#[inline]
fn upper_mask(n_bits: u8) -> u64 {
    match n_bits {
        0 => 0,
        64 => !0,
        n => !0u64 << (64 - n),
    }
}

/// Bit `ofs` of an MSB-aligned value, as an edge index.
#[inline]
fn branch_bit(value: u64, ofs: u8) -> usize {
    debug_assert!(ofs < 64);
    ((value >> (63 - ofs)) & 1) as usize
}

/// Number of leading bits (at most `limit`) on which the node edge agrees
/// with `value` starting at bit offset `ofs`.
#[inline]
fn equal_bits(prefix: u64, limit: u8, value: u64, ofs: u8) -> u8 {
    debug_assert!(ofs < 64);
    let diff = (value << ofs) ^ prefix;
    (diff.leading_zeros() as u8).min(limit)
}

/// Prefix trie over one field.
pub(crate) struct PrefixTrie {
    pub field: FieldId,
    root: Atomic<TrieNode>,
}

impl PrefixTrie {
    pub fn new(field: FieldId) -> Self {
        debug_assert!(field.prefix_eligible());
        PrefixTrie { field, root: Atomic::null() }
    }

    /// Writer: add one rule at `value`/`plen`. `value` is MSB-aligned and
    /// canonical (no bits past `plen`).
    pub fn insert<'g>(&'g self, value: u64, plen: u8, guard: &'g Guard) {
        debug_assert!(plen >= 1 && plen as usize <= 64);
        debug_assert_eq!(value & !upper_mask(plen), 0);
        let mut ofs: u8 = 0;
        let mut cell: &'g Atomic<TrieNode> = &self.root;
        loop {
            let cur = cell.load(Ordering::Acquire, guard);
            let node = match unsafe { cur.as_ref() } {
                None => {
                    let leaf = TrieNode::new(
                        (value << ofs) & upper_mask(plen - ofs),
                        plen - ofs,
                        1,
                    );
                    cell.store(Owned::new(leaf), Ordering::Release);
                    return;
                }
                Some(n) => n,
            };
            let limit = node.n_bits.min(plen - ofs);
            let eq = equal_bits(node.prefix, limit, value, ofs);
            if eq == node.n_bits {
                // Whole edge consumed.
                ofs += node.n_bits;
                if ofs == plen {
                    node.n_rules.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                cell = &node.edges[branch_bit(value, ofs)];
                continue;
            }
            // The edge must be split `eq` bits in.
            let tail = Owned::new(node.tail(eq, guard));
            let tail_bit = node.bit_at(eq);
            let head_prefix = node.prefix & upper_mask(eq);
            let new = if ofs + eq == plen {
                // The rule's prefix ends at the split point.
                let head = TrieNode::new(head_prefix, eq, 1);
                head.edges[tail_bit].store(tail, Ordering::Relaxed);
                head
            } else {
                // Genuine mismatch: a junction with the old edge on one
                // side and a fresh leaf on the other.
                let head = TrieNode::new(head_prefix, eq, 0);
                let leaf = TrieNode::new(
                    (value << (ofs + eq)) & upper_mask(plen - ofs - eq),
                    plen - ofs - eq,
                    1,
                );
                debug_assert_ne!(tail_bit, branch_bit(value, ofs + eq));
                head.edges[tail_bit].store(tail, Ordering::Relaxed);
                head.edges[1 - tail_bit].store(Owned::new(leaf), Ordering::Relaxed);
                head
            };
            cell.store(Owned::new(new), Ordering::Release);
            unsafe { guard.defer_destroy(cur) };
            return;
        }
    }

    /// Writer: remove one rule previously inserted at `value`/`plen`.
    pub fn remove<'g>(&'g self, value: u64, plen: u8, guard: &'g Guard) {
        debug_assert!(plen >= 1 && plen as usize <= 64);
        let mut cells: Vec<&'g Atomic<TrieNode>> = Vec::new();
        let mut nodes: Vec<Shared<'g, TrieNode>> = Vec::new();
        let mut ofs: u8 = 0;
        let mut cell: &'g Atomic<TrieNode> = &self.root;
        loop {
            let cur = cell.load(Ordering::Acquire, guard);
            let node = match unsafe { cur.as_ref() } {
                None => {
                    debug_assert!(false, "prefix not present in trie");
                    return;
                }
                Some(n) => n,
            };
            debug_assert_eq!(equal_bits(node.prefix, node.n_bits, value, ofs), node.n_bits);
            cells.push(cell);
            nodes.push(cur);
            ofs += node.n_bits;
            if ofs == plen {
                let prev = node.n_rules.fetch_sub(1, Ordering::Relaxed);
                debug_assert!(prev > 0);
                if prev == 1 {
                    self.cleanup(&mut cells, &mut nodes, guard);
                }
                return;
            }
            debug_assert!(ofs < plen);
            cell = &node.edges[branch_bit(value, ofs)];
        }
    }

    /// Restore canonical form around a node whose rule count dropped to
    /// zero: merge pass-through nodes, cut childless ones.
    fn cleanup<'g>(
        &self,
        cells: &mut Vec<&'g Atomic<TrieNode>>,
        nodes: &mut Vec<Shared<'g, TrieNode>>,
        guard: &'g Guard,
    ) {
        let cell = cells.pop().unwrap();
        let cur = nodes.pop().unwrap();
        let node = unsafe { cur.deref() };
        let e0 = node.edges[0].load(Ordering::Acquire, guard);
        let e1 = node.edges[1].load(Ordering::Acquire, guard);
        match (e0.is_null(), e1.is_null()) {
            (false, false) => {} // still a junction
            (true, true) => {
                cell.store(Shared::<TrieNode>::null(), Ordering::Release);
                unsafe { guard.defer_destroy(cur) };
                // The parent may have become a rule-less pass-through.
                if let (Some(pcell), Some(pcur)) = (cells.pop(), nodes.pop()) {
                    let parent = unsafe { pcur.deref() };
                    if parent.n_rules.load(Ordering::Relaxed) == 0 {
                        let s0 = parent.edges[0].load(Ordering::Acquire, guard);
                        let s1 = parent.edges[1].load(Ordering::Acquire, guard);
                        let sibling = if s0.is_null() { s1 } else { s0 };
                        debug_assert!(s0.is_null() || s1.is_null());
                        if !sibling.is_null() {
                            Self::merge(pcell, pcur, sibling, guard);
                        }
                    }
                }
            }
            _ => {
                // One child left and no rules here: merge the edges.
                let child = if e0.is_null() { e1 } else { e0 };
                Self::merge(cell, cur, child, guard);
            }
        }
    }

    /// Replace `parent` (rule-less, single child) and `child` with one
    /// node carrying the concatenated edge.
    fn merge<'g>(
        cell: &Atomic<TrieNode>,
        parent: Shared<'g, TrieNode>,
        child: Shared<'g, TrieNode>,
        guard: &'g Guard,
    ) {
        let p = unsafe { parent.deref() };
        let c = unsafe { child.deref() };
        debug_assert_eq!(p.n_rules.load(Ordering::Relaxed), 0);
        debug_assert!(p.n_bits as usize + c.n_bits as usize <= 64);
        let merged = TrieNode::new(
            p.prefix | (c.prefix >> p.n_bits),
            p.n_bits + c.n_bits,
            c.n_rules.load(Ordering::Relaxed),
        );
        merged.edges[0].store(c.edges[0].load(Ordering::Relaxed, guard), Ordering::Relaxed);
        merged.edges[1].store(c.edges[1].load(Ordering::Relaxed, guard), Ordering::Relaxed);
        cell.store(Owned::new(merged), Ordering::Release);
        unsafe {
            guard.defer_destroy(parent);
            guard.defer_destroy(child);
        }
    }

    /// Reader: longest present prefix length matching `value` (0 if none)
    /// and how many bits of `value` the descent examined.
    pub fn lookup(&self, value: u64, width: u8, guard: &Guard) -> (u8, u8) {
        debug_assert!(width >= 1 && width as usize <= 64);
        let mut ofs: u8 = 0;
        let mut match_len: u8 = 0;
        let mut checked: u8 = 0;
        let mut cur = self.root.load(Ordering::Acquire, guard);
        while let Some(node) = unsafe { cur.as_ref() } {
            let eq = equal_bits(node.prefix, node.n_bits, value, ofs);
            if eq < node.n_bits {
                // Mismatch; the first differing bit was examined too.
                checked = (ofs + eq + 1).min(width);
                return (match_len, checked);
            }
            ofs += node.n_bits;
            checked = ofs.min(width);
            if node.n_rules.load(Ordering::Relaxed) > 0 {
                match_len = ofs;
            }
            if ofs >= width {
                return (match_len, width);
            }
            cur = node.edges[branch_bit(value, ofs)].load(Ordering::Acquire, guard);
            checked = ofs + 1;
        }
        (match_len, checked)
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        fn walk(cell: &Atomic<TrieNode>, depth: usize) -> usize {
            let guard = epoch::pin();
            let cur = cell.load(Ordering::Acquire, &guard);
            let node = match unsafe { cur.as_ref() } {
                None => return 0,
                Some(n) => n,
            };
            assert_eq!(node.prefix & !upper_mask(node.n_bits), 0);
            assert!(depth + node.n_bits as usize <= 64);
            let c0 = !node.edges[0].load(Ordering::Acquire, &guard).is_null();
            let c1 = !node.edges[1].load(Ordering::Acquire, &guard).is_null();
            let rules = node.n_rules.load(Ordering::Relaxed);
            // Canonical form: a node without two children carries rules,
            // otherwise it would have been cut or merged away.
            if !(c0 && c1) {
                assert!(rules > 0, "non-canonical trie node");
            }
            let mut total = rules as usize;
            total += walk(&node.edges[0], depth + node.n_bits as usize);
            total += walk(&node.edges[1], depth + node.n_bits as usize);
            total
        }
        walk(&self.root, 0);
    }

    #[cfg(test)]
    fn total_rules(&self) -> usize {
        fn walk(cell: &Atomic<TrieNode>) -> usize {
            let guard = epoch::pin();
            let cur = cell.load(Ordering::Acquire, &guard);
            match unsafe { cur.as_ref() } {
                None => 0,
                Some(n) => {
                    n.n_rules.load(Ordering::Relaxed) as usize
                        + walk(&n.edges[0])
                        + walk(&n.edges[1])
                }
            }
        }
        walk(&self.root)
    }
}

impl Drop for PrefixTrie {
    fn drop(&mut self) {
        fn free(cell: &Atomic<TrieNode>) {
            unsafe {
                let guard = epoch::unprotected();
                let cur = cell.load(Ordering::Relaxed, guard);
                if let Some(node) = cur.as_ref() {
                    free(&node.edges[0]);
                    free(&node.edges[1]);
                    drop(cur.into_owned());
                }
            }
        }
        free(&self.root);
    }
}

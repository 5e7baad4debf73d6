//! Subtables: one per distinct rule mask.
//!
//! All rules sharing a mask live in one [`Subtable`], a hash table keyed
//! by the masked value's digest. Rules that differ only in priority form
//! an equivalence-class chain, strictly decreasing, whose head sits in
//! the hash bucket. On top of the plain table sit up to three staged
//! indices: hash multisets keyed by the digest of the leading flow-word
//! ranges, letting a lookup bail out of the subtable after examining only
//! a prefix of the mask.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};

use crate::flow::{
    prefix_field_index, prefix_len_of, Flow, FlowWildcards, FieldId, FLOW_WORDS, PREFIX_FIELDS,
};
use crate::hint::unlikely;
use crate::miniflow::{FlowWords, Minimask};
use crate::partition::{tag_deterministic, Tag, TAG_ALL};
use crate::rule::ClsRule;
use crate::sync::cmap::{CMap, ShallowClone};
use crate::trie::PrefixTrie;

/// Maximum number of staged indices per subtable, and of configured
/// segment boundaries.
pub const CLS_MAX_INDICES: usize = 3;

/// Maximum number of prefix tries per classifier.
pub const CLS_MAX_TRIES: usize = 3;

/// Installed shadow of a rule: one link in an equivalence-class chain.
pub(crate) struct ClsMatch {
    pub priority: u32,
    pub rule: Arc<ClsRule>,
    /// Next lower priority with the identical (value, mask); null at the
    /// tail.
    pub next: Atomic<ClsMatch>,
}

/// Hash-bucket payload: the head of an equivalence-class chain. The chain
/// nodes are owned by the subtable and retired individually; the cell
/// itself is duplicated freely when the map grows.
pub(crate) struct RuleChain {
    pub head: Atomic<ClsMatch>,
}

impl ShallowClone for RuleChain {
    fn shallow_clone(&self) -> Self {
        RuleChain { head: self.head.clone() }
    }
}

/// Per-lookup memo of one trie's result, shared across subtables.
pub(crate) struct TrieCtx<'g> {
    pub trie: &'g PrefixTrie,
    pub field: FieldId,
    pub pidx: usize,
    pub word: usize,
    pub looked_up: bool,
    pub match_len: u8,
}

impl<'g> TrieCtx<'g> {
    pub fn new(trie: &'g PrefixTrie) -> Self {
        let field = trie.field;
        TrieCtx {
            trie,
            field,
            pidx: prefix_field_index(field).expect("trie field is prefix eligible"),
            word: field.word(),
            looked_up: false,
            match_len: 0,
        }
    }
}

pub(crate) struct Subtable {
    pub mask: Minimask,
    pub tag: Tag,
    /// Cumulative word boundaries of the staged indices.
    index_ofs: [u8; CLS_MAX_INDICES],
    n_indices: usize,
    indices: [CMap<()>; CLS_MAX_INDICES],
    pub(crate) rules: CMap<RuleChain>,
    /// Prefix length the mask constrains each prefix-eligible field to;
    /// zero when unconstrained or not a clean prefix.
    plen: [u8; PREFIX_FIELDS.len()],
}

impl Subtable {
    pub fn new(mask: Minimask, segments: &[usize]) -> Self {
        let tag = if mask.get(FieldId::Metadata.word()) == u64::MAX {
            tag_deterministic(mask.digest())
        } else {
            TAG_ALL
        };

        // An index is worth keeping only where its segment range adds mask
        // bits, and the last one is dropped again if nothing follows it
        // (it would equal the full-mask table).
        let mut index_ofs = [0u8; CLS_MAX_INDICES];
        let mut n_indices = 0;
        let mut prev = 0usize;
        for &seg in segments {
            if mask.mini().has_map_in_range(prev..seg) {
                index_ofs[n_indices] = seg as u8;
                n_indices += 1;
            }
            prev = seg;
        }
        if n_indices > 0
            && !mask
                .mini()
                .has_map_in_range(index_ofs[n_indices - 1] as usize..FLOW_WORDS)
        {
            n_indices -= 1;
        }

        let mask_flow = mask.mini().expand();
        let mut plen = [0u8; PREFIX_FIELDS.len()];
        for (i, &field) in PREFIX_FIELDS.iter().enumerate() {
            let (bits, width) = mask_flow.field_be_bits(field);
            plen[i] = prefix_len_of(bits, width).unwrap_or(0);
        }

        Subtable {
            mask,
            tag,
            index_ofs,
            n_indices,
            indices: [CMap::new(), CMap::new(), CMap::new()],
            rules: CMap::new(),
            plen,
        }
    }

    #[inline]
    pub fn n_rules(&self) -> usize {
        let mut n = 0;
        let guard = epoch::pin();
        for chain in self.rules.iter(&guard) {
            let mut cur = chain.head.load(Ordering::Acquire, &guard);
            while let Some(m) = unsafe { cur.as_ref() } {
                n += 1;
                cur = m.next.load(Ordering::Acquire, &guard);
            }
        }
        n
    }

    #[inline]
    pub fn plen_for(&self, field: FieldId) -> u8 {
        prefix_field_index(field).map_or(0, |i| self.plen[i])
    }

    /// Staged digests of `w` under this subtable's mask: one per index
    /// plus the full digest, chained with a running basis exactly as the
    /// lookup side computes them.
    pub(crate) fn hashes<W: FlowWords>(&self, w: &W) -> ([u64; CLS_MAX_INDICES], u64) {
        let mut ih = [0u64; CLS_MAX_INDICES];
        let mut basis = 0u64;
        let mut start = 0usize;
        for i in 0..self.n_indices {
            let end = self.index_ofs[i] as usize;
            ih[i] = self.mask.hash_range(w, start, end, &mut basis);
            start = end;
        }
        let full = self.mask.hash_range(w, start, FLOW_WORDS, &mut basis);
        (ih, full)
    }

    #[inline]
    fn chain_has_key<W: FlowWords>(&self, chain: &RuleChain, w: &W, guard: &Guard) -> bool {
        let head = chain.head.load(Ordering::Acquire, guard);
        if unlikely(head.is_null()) {
            return false;
        }
        let head = unsafe { head.deref() };
        self.mask.values_equal(head.rule.minimatch().flow(), w)
    }

    /// Writer: is a rule with identical value and priority installed?
    pub(crate) fn has_identical(&self, rule: &ClsRule, guard: &Guard) -> bool {
        let (_, full) = self.hashes(rule.minimatch().flow());
        let chain = match self.rules.find(
            full,
            |c| self.chain_has_key(c, rule.minimatch().flow(), guard),
            guard,
        ) {
            Some(c) => c,
            None => return false,
        };
        let mut cur = chain.head.load(Ordering::Acquire, guard);
        while let Some(m) = unsafe { cur.as_ref() } {
            if m.priority == rule.priority() {
                return true;
            }
            if m.priority < rule.priority() {
                return false;
            }
            cur = m.next.load(Ordering::Acquire, guard);
        }
        false
    }

    /// Writer: install `rule`. Returns the displaced identical rule, if
    /// any, and whether a new equivalence class was created.
    pub(crate) fn insert_rule<'g>(
        &'g self,
        rule: &Arc<ClsRule>,
        guard: &'g Guard,
    ) -> (Option<Arc<ClsRule>>, bool) {
        let (ih, full) = self.hashes(rule.minimatch().flow());
        let priority = rule.priority();

        if let Some(chain) = self.rules.find(
            full,
            |c| self.chain_has_key(c, rule.minimatch().flow(), guard),
            guard,
        ) {
            let mut cell: &'g Atomic<ClsMatch> = &chain.head;
            loop {
                let cur = cell.load(Ordering::Acquire, guard);
                match unsafe { cur.as_ref() } {
                    Some(m) if m.priority > priority => {
                        cell = &m.next;
                    }
                    Some(m) if m.priority == priority => {
                        // Identical (value, mask, priority): replace.
                        let displaced = m.rule.clone();
                        let fresh = Owned::new(ClsMatch {
                            priority,
                            rule: rule.clone(),
                            next: m.next.clone(),
                        })
                        .into_shared(guard);
                        rule.set_cls_match(fresh);
                        cell.store(fresh, Ordering::Release);
                        displaced.clear_cls_match();
                        unsafe { guard.defer_destroy(cur) };
                        return (Some(displaced), false);
                    }
                    _ => {
                        // First strictly lower priority (or the tail):
                        // splice in before it.
                        let fresh = Owned::new(ClsMatch {
                            priority,
                            rule: rule.clone(),
                            next: Atomic::null(),
                        });
                        fresh.next.store(cur, Ordering::Relaxed);
                        let fresh = fresh.into_shared(guard);
                        rule.set_cls_match(fresh);
                        cell.store(fresh, Ordering::Release);
                        return (None, false);
                    }
                }
            }
        }

        // New equivalence class. Indices first: a stray index hit is just
        // a wasted probe, a missing one would hide the rule.
        for i in 0..self.n_indices {
            self.indices[i].insert(ih[i], (), guard);
        }
        let fresh = Owned::new(ClsMatch {
            priority,
            rule: rule.clone(),
            next: Atomic::null(),
        })
        .into_shared(guard);
        rule.set_cls_match(fresh);
        let chain = RuleChain { head: Atomic::null() };
        chain.head.store(fresh, Ordering::Relaxed);
        self.rules.insert(full, chain, guard);
        (None, true)
    }

    /// Writer: unlink `rule`. Returns the classifier's Arc and whether
    /// its equivalence class disappeared.
    pub(crate) fn remove_rule<'g>(
        &'g self,
        rule: &ClsRule,
        guard: &'g Guard,
    ) -> Option<(Arc<ClsRule>, bool)> {
        let (ih, full) = self.hashes(rule.minimatch().flow());
        let chain = self.rules.find(
            full,
            |c| self.chain_has_key(c, rule.minimatch().flow(), guard),
            guard,
        )?;
        let mut cell: &'g Atomic<ClsMatch> = &chain.head;
        let mut at_head = true;
        loop {
            let cur = cell.load(Ordering::Acquire, guard);
            let m = unsafe { cur.as_ref() }?;
            if std::ptr::eq(&*m.rule, rule) {
                let owned = m.rule.clone();
                let next = m.next.load(Ordering::Acquire, guard);
                rule.clear_cls_match();
                let class_gone = at_head && next.is_null();
                if class_gone {
                    let raw = cur.as_raw();
                    self.rules.remove_one(
                        full,
                        |c| c.head.load(Ordering::Relaxed, guard).as_raw() == raw,
                        guard,
                    );
                    for i in 0..self.n_indices {
                        self.indices[i].remove_one(ih[i], |_| true, guard);
                    }
                } else {
                    cell.store(next, Ordering::Release);
                }
                unsafe { guard.defer_destroy(cur) };
                return Some((owned, class_gone));
            }
            cell = &m.next;
            at_head = false;
        }
    }

    /// Writer: is this exact rule object linked here?
    pub(crate) fn has_rule(&self, rule: &ClsRule, guard: &Guard) -> bool {
        let (_, full) = self.hashes(rule.minimatch().flow());
        if let Some(chain) = self.rules.find(
            full,
            |c| self.chain_has_key(c, rule.minimatch().flow(), guard),
            guard,
        ) {
            let mut cur = chain.head.load(Ordering::Acquire, guard);
            while let Some(m) = unsafe { cur.as_ref() } {
                if std::ptr::eq(&*m.rule, rule) {
                    return true;
                }
                cur = m.next.load(Ordering::Acquire, guard);
            }
        }
        false
    }

    /// Reader: installed rule with identical value, mask and priority.
    pub(crate) fn find_exact(&self, target: &ClsRule, guard: &Guard) -> Option<Arc<ClsRule>> {
        let (_, full) = self.hashes(target.minimatch().flow());
        let chain = self.rules.find(
            full,
            |c| self.chain_has_key(c, target.minimatch().flow(), guard),
            guard,
        )?;
        let mut cur = chain.head.load(Ordering::Acquire, guard);
        while let Some(m) = unsafe { cur.as_ref() } {
            if m.priority == target.priority() {
                return Some(m.rule.clone());
            }
            if m.priority < target.priority() {
                return None;
            }
            cur = m.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Writer: highest priority present, excluding `excluded` (the match
    /// being removed), with the number of rules at that priority.
    pub(crate) fn max_priority_excluding(
        &self,
        excluded: *const ClsMatch,
        guard: &Guard,
    ) -> Option<(u32, usize)> {
        let mut best: Option<(u32, usize)> = None;
        for chain in self.rules.iter(guard) {
            let mut cur = chain.head.load(Ordering::Acquire, guard);
            while let Some(m) = unsafe { cur.as_ref() } {
                if cur.as_raw() != excluded {
                    best = match best {
                        Some((p, n)) if p == m.priority => Some((p, n + 1)),
                        Some((p, n)) if p > m.priority => Some((p, n)),
                        _ => Some((m.priority, 1)),
                    };
                    // Chains decrease strictly; the head decides.
                    break;
                }
                cur = m.next.load(Ordering::Acquire, guard);
            }
        }
        best
    }

    /// Reader: plain probe without wildcard tracking. The digest must be
    /// chained over the index boundaries exactly like the insert side.
    pub(crate) fn find_match<'g, W: FlowWords>(
        &self,
        w: &W,
        guard: &'g Guard,
    ) -> Option<&'g ClsMatch> {
        let (_, h) = self.hashes(w);
        let chain = self
            .rules
            .find(h, |c| self.chain_has_key(c, w, guard), guard)?;
        unsafe { chain.head.load(Ordering::Acquire, guard).as_ref() }
    }

    /// Reader: staged probe with wildcard accumulation and trie pruning.
    pub(crate) fn find_match_wc<'g>(
        &self,
        flow: &Flow,
        ctxs: &mut [Option<TrieCtx<'g>>; CLS_MAX_TRIES],
        wc: &mut FlowWildcards,
        guard: &'g Guard,
    ) -> Option<&'g ClsMatch> {
        let mut basis = 0u64;
        let mut start = 0usize;
        for i in 0..self.n_indices {
            let end = self.index_ofs[i] as usize;
            if self.check_tries(ctxs, start, end, flow, wc, guard) {
                // Skipped by a trie: only the words consulted so far count.
                wc.fold_range(&self.mask, 0, start);
                return None;
            }
            let h = self.mask.hash_range(flow, start, end, &mut basis);
            if !self.indices[i].contains(h, guard) {
                wc.fold_range(&self.mask, 0, end);
                return None;
            }
            start = end;
        }
        if self.check_tries(ctxs, start, FLOW_WORDS, flow, wc, guard) {
            wc.fold_range(&self.mask, 0, start);
            return None;
        }
        let h = self.mask.hash_range(flow, start, FLOW_WORDS, &mut basis);
        let found = self
            .rules
            .find(h, |c| self.chain_has_key(c, flow, guard), guard);
        // Hit or miss, the whole mask was inspected at this point.
        wc.fold_mask(&self.mask);
        let chain = found?;
        unsafe { chain.head.load(Ordering::Acquire, guard).as_ref() }
    }

    /// Consult the tries whose field lies in `[start, end)`. True means
    /// the subtable cannot match and should be skipped; the trie bits
    /// examined have already been folded into `wc`.
    fn check_tries<'g>(
        &self,
        ctxs: &mut [Option<TrieCtx<'g>>; CLS_MAX_TRIES],
        start: usize,
        end: usize,
        flow: &Flow,
        wc: &mut FlowWildcards,
        guard: &'g Guard,
    ) -> bool {
        for ctx in ctxs.iter_mut().flatten() {
            let plen = self.plen[ctx.pidx];
            if plen == 0 || ctx.word < start || ctx.word >= end {
                continue;
            }
            if !ctx.looked_up {
                let (value, width) = flow.field_be_bits(ctx.field);
                let (match_len, checked) = ctx.trie.lookup(value, width, guard);
                ctx.match_len = match_len;
                ctx.looked_up = true;
                wc.or_field_prefix(ctx.field, checked.min(width));
            }
            if plen > ctx.match_len {
                return true;
            }
        }
        false
    }
}

impl Drop for Subtable {
    fn drop(&mut self) {
        // Chains are owned here; the cmap below only shallow-frees its
        // nodes.
        unsafe {
            let guard = epoch::unprotected();
            for chain in self.rules.iter(guard) {
                let mut cur = chain.head.load(Ordering::Relaxed, guard);
                while !cur.is_null() {
                    let next = cur.deref().next.load(Ordering::Relaxed, guard);
                    drop(cur.into_owned());
                    cur = next;
                }
            }
        }
    }
}

impl FlowWildcards {
    /// OR every word of `mask` into the accumulator.
    pub(crate) fn fold_mask(&mut self, mask: &Minimask) {
        let words = self.masks.words_mut();
        for (i, w) in mask.mini().iter() {
            words[i] |= w;
        }
    }

    /// OR the words of `mask` with index in `[start, end)`.
    pub(crate) fn fold_range(&mut self, mask: &Minimask, start: usize, end: usize) {
        let words = self.masks.words_mut();
        for (i, w) in mask.mini().iter_range(start..end) {
            words[i] |= w;
        }
    }
}

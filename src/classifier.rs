//! The classifier: priority-ordered tuple-space search with megaflow
//! un-wildcarding.
//!
//! Writers serialize on one mutex; lookups, overlap checks and exact-match
//! probes run on any number of threads without taking it, pinning an epoch
//! guard instead. Everything a reader can reach is either immutable or
//! published through an epoch pointer, so a reader observes the state
//! before or after any write, never a torn version of it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use fxhash::FxHashMap;

use crate::error::{ClassifierError, Result};
use crate::flow::{FieldId, Flow, FlowWildcards, FLOW_SEGMENTS, FLOW_WORDS};
use crate::miniflow::{Match, Miniflow, Minimask};
use crate::partition::{PartitionMap, PartitionTracker, Tag, TAG_ALL, TAG_NONE};
use crate::rule::ClsRule;
use crate::subtable::{ClsMatch, Subtable, TrieCtx, CLS_MAX_TRIES};
use crate::sync::drop_atomic;
use crate::sync::pvector::{PVecEntry, PVector};
use crate::trie::PrefixTrie;

/// Upper bound on [`Classifier::lookup_miniflow_batch`] batch size.
pub const MAX_BATCH: usize = 256;

pub(crate) struct SubtableEntry {
    pub st: Arc<Subtable>,
    pub max_priority: u32,
    pub max_count: usize,
    pub n_rules: usize,
}

pub(crate) struct WriterState {
    pub subtables: FxHashMap<Minimask, SubtableEntry>,
    pub partitions: PartitionTracker,
    pub trie_fields: Vec<FieldId>,
}

pub struct Classifier {
    pub(crate) writer: Mutex<WriterState>,
    segments: Vec<usize>,
    pub(crate) subtables: PVector,
    partitions: Atomic<PartitionMap>,
    tries: Atomic<Vec<PrefixTrie>>,
    n_rules: AtomicUsize,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("segments", &self.segments)
            .field("n_rules", &self.n_rules.load(Ordering::Relaxed))
            .finish()
    }
}

impl Classifier {
    /// A classifier with the default staged-lookup segment boundaries.
    pub fn new() -> Self {
        Self::with_segments(&FLOW_SEGMENTS).expect("default segments are valid")
    }

    /// A classifier with explicit segment boundaries: up to three strictly
    /// ascending word offsets inside the flow. Boundaries are fixed for
    /// the classifier's lifetime.
    pub fn with_segments(segments: &[usize]) -> Result<Self> {
        if segments.len() > crate::subtable::CLS_MAX_INDICES {
            return Err(ClassifierError::BadSegments);
        }
        let mut prev = 0;
        for &s in segments {
            if s <= prev || s >= FLOW_WORDS {
                return Err(ClassifierError::BadSegments);
            }
            prev = s;
        }
        Ok(Classifier {
            writer: Mutex::new(WriterState {
                subtables: FxHashMap::default(),
                partitions: PartitionTracker::default(),
                trie_fields: Vec::new(),
            }),
            segments: segments.to_vec(),
            subtables: PVector::new(),
            partitions: Atomic::new(PartitionMap::default()),
            tries: Atomic::new(Vec::new()),
            n_rules: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.n_rules.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the set of fields prefix tries are kept for (at most
    /// three, each prefix eligible). Rebuilds the tries from the installed
    /// rules and publishes them atomically; returns whether anything
    /// changed.
    pub fn set_prefix_fields(&self, fields: &[FieldId]) -> Result<bool> {
        if fields.len() > CLS_MAX_TRIES {
            return Err(ClassifierError::TooManyPrefixFields);
        }
        for (i, &f) in fields.iter().enumerate() {
            if !f.prefix_eligible() {
                return Err(ClassifierError::NotPrefixEligible(f));
            }
            if fields[..i].contains(&f) {
                return Err(ClassifierError::DuplicatePrefixField(f));
            }
        }

        let pin = epoch::pin();
        let guard = &pin;
        let mut ws = self.writer.lock().unwrap();
        if ws.trie_fields.as_slice() == fields {
            return Ok(false);
        }

        let mut tries = Vec::with_capacity(fields.len());
        for &field in fields {
            let trie = PrefixTrie::new(field);
            for entry in ws.subtables.values() {
                let plen = entry.st.plen_for(field);
                if plen == 0 {
                    continue;
                }
                for chain in entry.st.rules.iter(guard) {
                    let mut cur = chain.head.load(Ordering::Acquire, guard);
                    while let Some(m) = unsafe { cur.as_ref() } {
                        let rflow = m.rule.minimatch().flow().expand();
                        let (value, _) = rflow.field_be_bits(field);
                        trie.insert(value, plen, guard);
                        cur = m.next.load(Ordering::Acquire, guard);
                    }
                }
            }
            tries.push(trie);
        }
        ws.trie_fields = fields.to_vec();
        log::debug!("rebuilt {} prefix trie(s)", tries.len());

        let old = self.tries.swap(Owned::new(tries), Ordering::AcqRel, guard);
        unsafe { guard.defer_destroy(old) };
        Ok(true)
    }

    /// Install `rule`. An installed rule with identical value, mask and
    /// priority is displaced and dropped.
    pub fn insert(&self, rule: Arc<ClsRule>) {
        drop(self.replace(rule));
    }

    /// Install `rule`, returning the identical rule it displaced, if any.
    /// Readers see either the old state or the fully linked new one.
    pub fn replace(&self, rule: Arc<ClsRule>) -> Option<Arc<ClsRule>> {
        let pin = epoch::pin();
        let guard = &pin;
        let mut ws = self.writer.lock().unwrap();
        let ws = &mut *ws;
        debug_assert!(
            rule.installed(guard).is_null(),
            "rule is already installed in a classifier"
        );

        let mask = rule.minimatch().mask().clone();
        let mut republish = false;
        if !ws.subtables.contains_key(&mask) {
            let st = Arc::new(Subtable::new(mask.clone(), &self.segments));
            log::debug!("new subtable, tag {:#010x}", st.tag);
            ws.subtables.insert(
                mask.clone(),
                SubtableEntry { st, max_priority: 0, max_count: 0, n_rules: 0 },
            );
            republish = true;
        }
        let st = ws.subtables[&mask].st.clone();

        let displacing = st.has_identical(&rule, guard);
        if !displacing {
            // Tries and partitions go in before the rule is linked; an
            // over-approximation costs a probe, never a match.
            let tries = unsafe { self.tries.load(Ordering::Acquire, guard).deref() };
            if !tries.is_empty() {
                let rflow = rule.minimatch().flow().expand();
                for trie in tries.iter() {
                    let plen = st.plen_for(trie.field);
                    if plen > 0 {
                        let (value, _) = rflow.field_be_bits(trie.field);
                        trie.insert(value, plen, guard);
                    }
                }
            }
            if st.tag != TAG_ALL {
                let metadata = rule.minimatch().flow().get(FieldId::Metadata.word());
                if ws.partitions.add(metadata, st.tag) {
                    self.publish_partitions(&ws.partitions, guard);
                }
            }
        }

        let (displaced, _new_class) = st.insert_rule(&rule, guard);
        debug_assert_eq!(displaced.is_some(), displacing);

        if displaced.is_none() {
            self.n_rules.fetch_add(1, Ordering::Relaxed);
            let entry = ws.subtables.get_mut(&mask).unwrap();
            entry.n_rules += 1;
            let p = rule.priority();
            if entry.n_rules == 1 || p > entry.max_priority {
                entry.max_priority = p;
                entry.max_count = 1;
                republish = true;
            } else if p == entry.max_priority {
                entry.max_count += 1;
            }
        }
        if republish {
            // The rule is fully linked; only now may its subtable move up.
            self.publish_pvector(&ws.subtables, guard);
        }
        displaced
    }

    /// Unlink `rule` and hand it back. `None` if it is not installed.
    pub fn remove(&self, rule: &ClsRule) -> Option<Arc<ClsRule>> {
        let pin = epoch::pin();
        let guard = &pin;
        let mut ws = self.writer.lock().unwrap();
        let ws = &mut *ws;

        let installed = rule.installed(guard);
        if installed.is_null() {
            return None;
        }
        let mask = rule.minimatch().mask();
        let st = match ws.subtables.get(mask) {
            Some(entry) => entry.st.clone(),
            None => {
                debug_assert!(false, "installed rule without a subtable");
                return None;
            }
        };
        if !st.has_rule(rule, guard) {
            debug_assert!(false, "rule is installed in a different classifier");
            return None;
        }

        // Shrink tries and partitions up front; a reader that already
        // misses the rule observes the post-removal state.
        let tries = unsafe { self.tries.load(Ordering::Acquire, guard).deref() };
        if !tries.is_empty() {
            let rflow = rule.minimatch().flow().expand();
            for trie in tries.iter() {
                let plen = st.plen_for(trie.field);
                if plen > 0 {
                    let (value, _) = rflow.field_be_bits(trie.field);
                    trie.remove(value, plen, guard);
                }
            }
        }
        if st.tag != TAG_ALL {
            let metadata = rule.minimatch().flow().get(FieldId::Metadata.word());
            if ws.partitions.remove(metadata, st.tag) {
                self.publish_partitions(&ws.partitions, guard);
            }
        }

        let entry = ws.subtables.get_mut(mask).unwrap();
        entry.n_rules -= 1;
        let remaining = entry.n_rules;
        let p = rule.priority();
        debug_assert_eq!(st.n_rules(), remaining + 1);

        if remaining == 0 {
            let removed = ws.subtables.remove(mask).unwrap();
            log::debug!("dropping empty subtable, tag {:#010x}", removed.st.tag);
            // Priority order first, unlinking second.
            self.publish_pvector(&ws.subtables, guard);
            let (owned, _) = removed.st.remove_rule(rule, guard)?;
            self.n_rules.fetch_sub(1, Ordering::Relaxed);
            return Some(owned);
        }

        let entry = ws.subtables.get_mut(mask).unwrap();
        if p == entry.max_priority {
            entry.max_count -= 1;
            if entry.max_count == 0 {
                let (np, nc) = st
                    .max_priority_excluding(installed.as_raw(), guard)
                    .expect("non-empty subtable");
                entry.max_priority = np;
                entry.max_count = nc;
                self.publish_pvector(&ws.subtables, guard);
            }
        }

        let (owned, _) = st.remove_rule(rule, guard)?;
        self.n_rules.fetch_sub(1, Ordering::Relaxed);
        Some(owned)
    }

    /// Find the highest-priority rule matching `flow`. When `wc` is given,
    /// every header bit the decision depended on is OR-ed into it; bits
    /// left at zero are provably irrelevant to this result.
    pub fn lookup(&self, flow: &Flow, mut wc: Option<&mut FlowWildcards>) -> Option<Arc<ClsRule>> {
        let pin = epoch::pin();
        let guard = &pin;

        let tries = unsafe { self.tries.load(Ordering::Acquire, guard).deref() };
        let mut ctxs: [Option<TrieCtx<'_>>; CLS_MAX_TRIES] = [None, None, None];
        for (i, trie) in tries.iter().take(CLS_MAX_TRIES).enumerate() {
            ctxs[i] = Some(TrieCtx::new(trie));
        }

        let tags = self.lookup_tags(flow.metadata, wc.as_deref_mut(), guard);

        let mut best: Option<&ClsMatch> = None;
        for entry in self.subtables.load(guard).iter() {
            if let Some(b) = best {
                if b.priority >= entry.priority {
                    break;
                }
            }
            let st = &*entry.subtable;
            if st.tag != TAG_ALL && tags & st.tag == 0 {
                continue;
            }
            let found = match wc.as_deref_mut() {
                Some(w) => st.find_match_wc(flow, &mut ctxs, w, guard),
                None => st.find_match(flow, guard),
            };
            if let Some(m) = found {
                if best.map_or(true, |b| m.priority > b.priority) {
                    best = Some(m);
                }
            }
        }
        best.map(|m| m.rule.clone())
    }

    /// Look up `flows` as a batch, filling `rules` slot for slot exactly
    /// as per-flow [`lookup`](Self::lookup) without wildcards would.
    /// Returns true iff every slot matched.
    pub fn lookup_miniflow_batch(
        &self,
        flows: &[Miniflow],
        rules: &mut [Option<Arc<ClsRule>>],
    ) -> bool {
        assert!(flows.len() <= MAX_BATCH);
        assert_eq!(flows.len(), rules.len());
        let pin = epoch::pin();
        let guard = &pin;

        let tags: Vec<Tag> = flows
            .iter()
            .map(|mf| self.lookup_tags(mf.get(FieldId::Metadata.word()), None, guard))
            .collect();

        let mut best: Vec<Option<(u32, &ClsMatch)>> = vec![None; flows.len()];
        let mut unmatched = flows.len();
        for entry in self.subtables.load(guard).iter() {
            if unmatched == 0
                && best.iter().all(|b| b.map_or(false, |(p, _)| p >= entry.priority))
            {
                break;
            }
            let st = &*entry.subtable;
            for (i, mf) in flows.iter().enumerate() {
                if let Some((p, _)) = best[i] {
                    if p >= entry.priority {
                        continue;
                    }
                }
                if st.tag != TAG_ALL && tags[i] & st.tag == 0 {
                    continue;
                }
                if let Some(m) = st.find_match(mf, guard) {
                    match best[i] {
                        Some((p, _)) if p >= m.priority => {}
                        prev => {
                            if prev.is_none() {
                                unmatched -= 1;
                            }
                            best[i] = Some((m.priority, m));
                        }
                    }
                }
            }
        }
        for (slot, b) in rules.iter_mut().zip(best.iter()) {
            *slot = b.map(|(_, m)| m.rule.clone());
        }
        unmatched == 0
    }

    /// Would some concrete flow match both `target` and an installed rule
    /// of the same priority?
    pub fn rule_overlaps(&self, target: &ClsRule) -> bool {
        let pin = epoch::pin();
        let guard = &pin;
        for entry in self.subtables.load(guard).iter() {
            let st = &*entry.subtable;
            let combined = target.minimatch().mask().and(&st.mask);
            for chain in st.rules.iter(guard) {
                let mut cur = chain.head.load(Ordering::Acquire, guard);
                while let Some(m) = unsafe { cur.as_ref() } {
                    if m.priority == target.priority()
                        && combined
                            .values_equal(m.rule.minimatch().flow(), target.minimatch().flow())
                    {
                        return true;
                    }
                    cur = m.next.load(Ordering::Acquire, guard);
                }
            }
        }
        false
    }

    /// The installed rule with identical value, mask and priority.
    pub fn find_rule_exactly(&self, target: &ClsRule) -> Option<Arc<ClsRule>> {
        let pin = epoch::pin();
        let guard = &pin;
        let snap = self.subtables.load(guard);
        let entry = snap
            .iter()
            .find(|e| e.subtable.mask == *target.minimatch().mask())?;
        entry.subtable.find_exact(target, guard)
    }

    /// Convenience wrapper constructing the probe rule.
    pub fn find_match_exactly(&self, m: &Match, priority: u32) -> Option<Arc<ClsRule>> {
        self.find_rule_exactly(&ClsRule::new(m, priority))
    }

    fn lookup_tags(
        &self,
        metadata: u64,
        wc: Option<&mut FlowWildcards>,
        guard: &Guard,
    ) -> Tag {
        let parts = unsafe { self.partitions.load(Ordering::Acquire, guard).deref() };
        if parts.is_empty() {
            return TAG_ALL;
        }
        // The skip decision depends on the whole metadata value.
        if let Some(w) = wc {
            w.or_metadata();
        }
        parts.get(&metadata).copied().unwrap_or(TAG_NONE)
    }

    fn publish_partitions(&self, tracker: &PartitionTracker, guard: &Guard) {
        let old = self
            .partitions
            .swap(Owned::new(tracker.snapshot()), Ordering::AcqRel, guard);
        unsafe { guard.defer_destroy(old) };
    }

    fn publish_pvector(&self, subtables: &FxHashMap<Minimask, SubtableEntry>, guard: &Guard) {
        let entries = subtables
            .values()
            .map(|e| PVecEntry { priority: e.max_priority, subtable: e.st.clone() })
            .collect();
        self.subtables.publish(entries, guard);
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Classifier {
    fn drop(&mut self) {
        drop_atomic(&self.partitions);
        drop_atomic(&self.tries);
    }
}

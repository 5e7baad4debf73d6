//! Rule iteration.
//!
//! A cursor yields every installed rule, optionally restricted to loose
//! matches of a target rule. The rule list is snapshotted when the cursor
//! starts, so the order is stable for the whole iteration. Two modes:
//!
//! * locked: the cursor holds the writer exclusion until it is dropped;
//!   nothing can change mid-iteration, and the loop body must not call a
//!   mutating classifier operation.
//! * safe: nothing is held; the loop body may remove any rule, including
//!   the one just yielded.

use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};

use crossbeam_epoch as epoch;

use crate::classifier::{Classifier, WriterState};
use crate::rule::ClsRule;

pub struct Cursor<'a> {
    _excl: Option<MutexGuard<'a, WriterState>>,
    rules: std::vec::IntoIter<Arc<ClsRule>>,
}

impl<'a> Iterator for Cursor<'a> {
    type Item = Arc<ClsRule>;

    #[inline]
    fn next(&mut self) -> Option<Arc<ClsRule>> {
        self.rules.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rules.size_hint()
    }
}

impl Classifier {
    /// Locked cursor over every installed rule.
    pub fn cursor(&self) -> Cursor<'_> {
        self.cursor_with(None, false)
    }

    /// Safe cursor over every installed rule; the body may remove rules.
    pub fn cursor_safe(&self) -> Cursor<'_> {
        self.cursor_with(None, true)
    }

    /// Cursor restricted to rules loosely matching `target` (the target's
    /// constraints are a subset of the rule's).
    pub fn cursor_with(&self, target: Option<&ClsRule>, safe: bool) -> Cursor<'_> {
        let excl = if safe { None } else { Some(self.writer.lock().unwrap()) };
        let rules = self.collect_rules(target);
        Cursor { _excl: excl, rules: rules.into_iter() }
    }

    fn collect_rules(&self, target: Option<&ClsRule>) -> Vec<Arc<ClsRule>> {
        let pin = epoch::pin();
        let guard = &pin;
        let mut out = Vec::new();
        for entry in self.subtables.load(guard).iter() {
            let st = &*entry.subtable;
            if let Some(t) = target {
                // A rule here can only loosely match the target if this
                // subtable's mask covers every bit the target constrains.
                if t.minimatch().mask().has_extra(&st.mask) {
                    continue;
                }
            }
            for chain in st.rules.iter(guard) {
                let mut cur = chain.head.load(Ordering::Acquire, guard);
                while let Some(m) = unsafe { cur.as_ref() } {
                    if target.map_or(true, |t| m.rule.is_loose_match(t.minimatch())) {
                        out.push(m.rule.clone());
                    }
                    cur = m.next.load(Ordering::Acquire, guard);
                }
            }
        }
        out
    }
}

//! Classifier rules.
//!
//! A [`ClsRule`] is a match plus a priority. Callers build rules, hand the
//! classifier an `Arc` on insert and get it back on remove; an installed
//! rule must not be mutated, which the immutable representation enforces.

use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Shared};
use fxhash::FxHasher;

use crate::flow::{FieldId, FIELDS};
use crate::miniflow::{Match, MiniMatch};
use crate::subtable::ClsMatch;

pub struct ClsRule {
    mm: MiniMatch,
    priority: u32,
    /// Installed shadow, null while detached. Owned by the classifier.
    cls_match: Atomic<ClsMatch>,
}

impl ClsRule {
    pub fn new(m: &Match, priority: u32) -> Self {
        Self::from_minimatch(MiniMatch::from_match(m), priority)
    }

    pub fn from_minimatch(mm: MiniMatch, priority: u32) -> Self {
        ClsRule { mm, priority, cls_match: Atomic::null() }
    }

    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    #[inline]
    pub fn minimatch(&self) -> &MiniMatch {
        &self.mm
    }

    /// Does this rule match every packet?
    #[inline]
    pub fn is_catchall(&self) -> bool {
        self.mm.mask().is_catchall()
    }

    /// Identical match and priority.
    pub fn equals(&self, other: &ClsRule) -> bool {
        self.priority == other.priority && self.mm == other.mm
    }

    /// Digest over match and priority.
    pub fn digest(&self, basis: u64) -> u64 {
        let mut h = FxHasher::default();
        h.write_u64(basis);
        h.write_u64(self.mm.mask().digest());
        h.write_u64(self.mm.mask().hash(self.mm.flow()));
        h.write_u32(self.priority);
        h.finish()
    }

    /// True iff `target`'s constraints are a subset of this rule's and the
    /// values agree wherever the target constrains. This is the loose
    /// sense used by cursor filtering: the target describes a superset of
    /// the packets the rule matches.
    pub fn is_loose_match(&self, target: &MiniMatch) -> bool {
        !target.mask().has_extra(self.mm.mask())
            && target.mask().values_equal(self.mm.flow(), target.flow())
    }

    #[inline]
    pub(crate) fn set_cls_match(&self, m: Shared<'_, ClsMatch>) {
        self.cls_match.store(m, Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_cls_match(&self) {
        self.cls_match.store(Shared::<ClsMatch>::null(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn installed<'g>(&self, guard: &'g Guard) -> Shared<'g, ClsMatch> {
        self.cls_match.load(Ordering::Acquire, guard)
    }
}

impl Clone for ClsRule {
    /// Clones match and priority; the clone starts out detached.
    fn clone(&self) -> Self {
        ClsRule::from_minimatch(self.mm.clone(), self.priority)
    }
}

impl PartialEq for ClsRule {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Eq for ClsRule {}

impl fmt::Display for ClsRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "priority={}", self.priority)?;
        let m = self.mm.expand();
        for desc in FIELDS.iter() {
            let (mask_bits, width) = m.mask.field_be_bits(desc.id);
            if mask_bits == 0 {
                continue;
            }
            let (value_bits, _) = m.flow.field_be_bits(desc.id);
            write!(f, ",{}=", desc.name)?;
            match desc.id {
                FieldId::NwSrc | FieldId::NwDst => {
                    let addr = (value_bits >> 32) as u32;
                    let [a, b, c, d] = addr.to_be_bytes();
                    write!(f, "{}.{}.{}.{}", a, b, c, d)?;
                    let plen = mask_bits.leading_ones() as u8;
                    if mask_bits != full_mask(plen) {
                        write!(f, "/{:#x}", (mask_bits >> 32) as u32)?;
                    } else if plen < 32 {
                        write!(f, "/{}", plen)?;
                    }
                }
                FieldId::DlSrc | FieldId::DlDst => {
                    let v = value_bits >> 16;
                    write!(
                        f,
                        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                        (v >> 40) & 0xff,
                        (v >> 32) & 0xff,
                        (v >> 24) & 0xff,
                        (v >> 16) & 0xff,
                        (v >> 8) & 0xff,
                        v & 0xff
                    )?;
                }
                _ => {
                    let shift = 64 - width as u32;
                    write!(f, "{:#x}", value_bits >> shift)?;
                    if mask_bits != full_mask(width) {
                        write!(f, "/{:#x}", mask_bits >> shift)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[inline]
fn full_mask(width: u8) -> u64 {
    if width == 0 {
        0
    } else if width >= 64 {
        !0
    } else {
        !0u64 << (64 - width)
    }
}

impl fmt::Debug for ClsRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClsRule({})", self)
    }
}

//! Metadata partitions.
//!
//! Subtables whose mask exact-matches the metadata field get a small tag
//! fingerprint; for every metadata value present in an installed rule the
//! classifier keeps the OR of the tags of the subtables holding such
//! rules. A lookup fetches the tag set for the flow's metadata and skips
//! every tagged subtable outside it. Subtables that do not constrain
//! metadata carry [`TAG_ALL`] and are never skipped.

use fxhash::FxHashMap;

pub(crate) type Tag = u32;

/// Matches every tag set; the tag of metadata-insensitive subtables.
pub(crate) const TAG_ALL: Tag = u32::MAX;

/// Matches nothing but [`TAG_ALL`] subtables; the result of a partition
/// miss.
pub(crate) const TAG_NONE: Tag = 0;

/// Two deterministic bits from a seed. Distinct subtables usually get
/// distinct tags; collisions cost extra probes, never correctness.
pub(crate) fn tag_deterministic(seed: u64) -> Tag {
    let x = (seed & 31) as u32;
    let mut y = ((seed >> 5) % 31) as u32;
    if y >= x {
        y += 1;
    }
    (1u32 << x) | (1u32 << y)
}

/// Published, read-only view: metadata value to the tags that must be
/// consulted for it.
pub(crate) type PartitionMap = FxHashMap<u64, Tag>;

/// Writer-side bookkeeping: per metadata value, a refcount for each
/// contributing subtable tag.
#[derive(Default)]
pub(crate) struct PartitionTracker {
    counts: FxHashMap<u64, FxHashMap<Tag, usize>>,
}

impl PartitionTracker {
    /// Account one rule for `metadata` in a subtable tagged `tag`.
    /// Returns true if the published view changed.
    pub fn add(&mut self, metadata: u64, tag: Tag) -> bool {
        let tags = self.counts.entry(metadata).or_default();
        let count = tags.entry(tag).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop one rule's contribution. Returns true if the published view
    /// changed; empty partitions disappear entirely.
    pub fn remove(&mut self, metadata: u64, tag: Tag) -> bool {
        let tags = match self.counts.get_mut(&metadata) {
            Some(t) => t,
            None => {
                debug_assert!(false, "partition refcount underflow");
                return false;
            }
        };
        let gone = match tags.get_mut(&tag) {
            Some(c) => {
                *c -= 1;
                *c == 0
            }
            None => {
                debug_assert!(false, "partition refcount underflow");
                false
            }
        };
        if gone {
            tags.remove(&tag);
            if tags.is_empty() {
                self.counts.remove(&metadata);
            }
        }
        gone
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Materialize the read-only view.
    pub fn snapshot(&self) -> PartitionMap {
        self.counts
            .iter()
            .map(|(&m, tags)| (m, tags.keys().fold(TAG_NONE, |acc, &t| acc | t)))
            .collect()
    }
}

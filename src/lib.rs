#![cfg_attr(feature = "nightly", feature(core_intrinsics))]

//! A flow classifier: the table at the heart of an OpenFlow-style
//! software switch.
//!
//! The classifier stores prioritized [`ClsRule`]s matching on packet
//! header fields with per-bit wildcards and, given a concrete [`Flow`],
//! returns the highest-priority matching rule. As a side effect of every
//! lookup it accumulates a [`FlowWildcards`] mask marking the header bits
//! that actually influenced the decision, so a datapath can cache one
//! megaflow covering every flow that agrees on those bits.
//!
//! Four techniques interlock to keep both the lookup and that mask small:
//!
//! * tuple-space search: one hash table (subtable) per distinct rule
//!   mask, walked in decreasing max-priority order with early
//!   termination;
//! * staged lookup: each subtable is additionally indexed by digests of
//!   the leading flow-word ranges, so a miss is usually detected before
//!   the whole mask has been examined (and un-wildcarded);
//! * prefix tries: per-field tries over the configured address fields
//!   prune subtables whose prefixes are longer than anything that can
//!   match;
//! * partitions: subtables that exact-match metadata are tagged, and a
//!   per-metadata-value tag set skips them wholesale.
//!
//! Any number of threads may look up concurrently with a single writer;
//! readers never block, and reclamation of replaced structure is deferred
//! until every reader that could see it has moved on.

/// Ambient error types.
pub mod error;

mod classifier;
mod cursor;
mod flow;
mod hint;
mod miniflow;
mod partition;
mod rule;
mod subtable;
mod sync;
mod trie;

pub use classifier::{Classifier, MAX_BATCH};
pub use cursor::Cursor;
pub use error::{ClassifierError, Result};
pub use flow::{FieldDesc, FieldId, Flow, FlowWildcards, FIELDS, FLOW_SEGMENTS, FLOW_WORDS};
pub use miniflow::{Match, MiniMatch, Miniflow, Minimask};
pub use rule::ClsRule;
pub use subtable::{CLS_MAX_INDICES, CLS_MAX_TRIES};

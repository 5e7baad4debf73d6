//! Sparse flow and mask representations.
//!
//! A [`Miniflow`] keeps only the nonzero 64-bit words of a [`Flow`]: a
//! presence bitmap plus a packed value array. A [`Minimask`] is a miniflow
//! of mask words and is the identity of a subtable. All the masked digest
//! and equality operations the classifier relies on live here.

use std::hash::Hasher;
use std::ops::Range;

use fxhash::FxHasher;

use crate::flow::{Flow, FLOW_WORDS};

/// Something the classifier can fetch flow words from.
pub(crate) trait FlowWords {
    fn word(&self, idx: usize) -> u64;
}

impl FlowWords for Flow {
    #[inline]
    fn word(&self, idx: usize) -> u64 {
        self.words()[idx]
    }
}

impl FlowWords for Miniflow {
    #[inline]
    fn word(&self, idx: usize) -> u64 {
        self.get(idx)
    }
}

/// Compressed flow: presence bitmap over the flow's 64-bit slots and the
/// packed nonzero words. `map.count_ones() == values.len()` always holds.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Miniflow {
    map: u64,
    values: Vec<u64>,
}

impl Miniflow {
    pub fn from_flow(flow: &Flow) -> Self {
        let mut map = 0u64;
        let mut values = Vec::new();
        for (i, &w) in flow.words().iter().enumerate() {
            if w != 0 {
                map |= 1u64 << i;
                values.push(w);
            }
        }
        Miniflow { map, values }
    }

    /// Expand back into a full flow; absent words are zero.
    pub fn expand(&self) -> Flow {
        let mut flow = Flow::new();
        let words = flow.words_mut();
        for (i, w) in self.iter() {
            words[i] = w;
        }
        flow
    }

    #[inline]
    pub fn map(&self) -> u64 {
        self.map
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map == 0
    }

    /// Value of flow word `idx`, zero if absent.
    #[inline]
    pub fn get(&self, idx: usize) -> u64 {
        debug_assert!(idx < FLOW_WORDS);
        let bit = 1u64 << idx;
        if self.map & bit == 0 {
            0
        } else {
            let rank = (self.map & (bit - 1)).count_ones() as usize;
            self.values[rank]
        }
    }

    /// Populated words as `(word_index, value)` in ascending index order.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter { map: self.map, values: &self.values, at: 0 }
    }

    /// Populated words restricted to word indexes in `range`.
    #[inline]
    pub fn iter_range(&self, range: Range<usize>) -> Iter<'_> {
        let sel = self.map & range_map(range.start, range.end);
        let at = (self.map & ((1u64 << range.start) - 1)).count_ones() as usize;
        Iter { map: sel, values: &self.values, at }
    }

    #[inline]
    pub fn has_map_in_range(&self, range: Range<usize>) -> bool {
        self.map & range_map(range.start, range.end) != 0
    }
}

#[inline]
fn range_map(start: usize, end: usize) -> u64 {
    debug_assert!(start <= end && end <= 64);
    let hi = if end == 64 { !0u64 } else { (1u64 << end) - 1 };
    hi & !((1u64 << start) - 1)
}

pub struct Iter<'a> {
    map: u64,
    values: &'a [u64],
    at: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (usize, u64);

    #[inline]
    fn next(&mut self) -> Option<(usize, u64)> {
        if self.map == 0 {
            return None;
        }
        let idx = self.map.trailing_zeros() as usize;
        self.map &= self.map - 1;
        let value = self.values[self.at];
        self.at += 1;
        Some((idx, value))
    }
}

/// A miniflow of mask words. Canonical: never stores an all-zero word.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Minimask(Miniflow);

impl Minimask {
    /// Build from a full flow of mask words, dropping zero words.
    pub fn from_flow(masks: &Flow) -> Self {
        Minimask(Miniflow::from_flow(masks))
    }

    #[inline]
    pub fn mini(&self) -> &Miniflow {
        &self.0
    }

    #[inline]
    pub fn is_catchall(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> u64 {
        self.0.get(idx)
    }

    /// Does `self` constrain any bit `other` does not?
    pub fn has_extra(&self, other: &Minimask) -> bool {
        self.0.iter().any(|(i, w)| w & !other.0.get(i) != 0)
    }

    /// Bitwise AND of two masks, recanonicalized.
    pub fn and(&self, other: &Minimask) -> Minimask {
        let mut map = 0u64;
        let mut values = Vec::new();
        for (i, w) in self.0.iter() {
            let v = w & other.0.get(i);
            if v != 0 {
                map |= 1u64 << i;
                values.push(v);
            }
        }
        Minimask(Miniflow { map, values })
    }

    /// True iff `a` and `b` agree on every bit this mask constrains.
    #[inline]
    pub(crate) fn values_equal<A: FlowWords, B: FlowWords>(&self, a: &A, b: &B) -> bool {
        self.0.iter().all(|(i, m)| (a.word(i) ^ b.word(i)) & m == 0)
    }

    /// Digest of `w` under this mask restricted to flow words in
    /// `[start, end)`. `basis` chains digests across consecutive ranges so
    /// that staged index keys are cumulative prefixes of the full key.
    pub(crate) fn hash_range<W: FlowWords>(
        &self,
        w: &W,
        start: usize,
        end: usize,
        basis: &mut u64,
    ) -> u64 {
        let mut h = FxHasher::default();
        h.write_u64(*basis);
        for (i, m) in self.0.iter_range(start..end) {
            h.write_u64(w.word(i) & m);
        }
        let digest = h.finish();
        *basis = digest;
        digest
    }

    /// Digest over the whole flow, used where staging does not apply.
    #[inline]
    pub(crate) fn hash<W: FlowWords>(&self, w: &W) -> u64 {
        let mut basis = 0;
        self.hash_range(w, 0, FLOW_WORDS, &mut basis)
    }

    /// Digest of the mask itself (subtable identity, tag seed).
    pub(crate) fn digest(&self) -> u64 {
        let mut h = FxHasher::default();
        h.write_u64(self.0.map);
        for &v in self.0.values.iter() {
            h.write_u64(v);
        }
        h.finish()
    }
}

/// A match in compressed form: value under mask.
///
/// Canonical: every value bit outside the mask is zero, so value equality
/// under the mask degenerates to packed-word equality.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MiniMatch {
    flow: Miniflow,
    mask: Minimask,
}

impl MiniMatch {
    pub fn from_match(m: &Match) -> Self {
        let mut masked = Flow::new();
        {
            let words = masked.words_mut();
            for (i, w) in m.flow.words().iter().enumerate() {
                words[i] = w & m.mask.words()[i];
            }
        }
        MiniMatch {
            flow: Miniflow::from_flow(&masked),
            mask: Minimask::from_flow(&m.mask),
        }
    }

    #[inline]
    pub fn flow(&self) -> &Miniflow {
        &self.flow
    }

    #[inline]
    pub fn mask(&self) -> &Minimask {
        &self.mask
    }

    /// Expand back to the full value/mask pair.
    pub fn expand(&self) -> Match {
        Match { flow: self.flow.expand(), mask: self.mask.mini().expand() }
    }
}

/// User-facing match: a full flow of values and a full flow of masks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Match {
    pub flow: Flow,
    pub mask: Flow,
}

impl Match {
    /// A match with everything wildcarded.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_metadata(&mut self, value: u64) -> &mut Self {
        self.flow.metadata = value;
        self.mask.metadata = u64::MAX;
        self
    }

    pub fn set_reg(&mut self, idx: usize, value: u32) -> &mut Self {
        self.flow.regs[idx] = value;
        self.mask.regs[idx] = u32::MAX;
        self
    }

    pub fn set_in_port(&mut self, port: u32) -> &mut Self {
        self.flow.in_port = port;
        self.mask.in_port = u32::MAX;
        self
    }

    pub fn set_dl_src(&mut self, mac: [u8; 6]) -> &mut Self {
        self.flow.dl_src = mac;
        self.mask.dl_src = [0xff; 6];
        self
    }

    pub fn set_dl_dst(&mut self, mac: [u8; 6]) -> &mut Self {
        self.flow.dl_dst = mac;
        self.mask.dl_dst = [0xff; 6];
        self
    }

    pub fn set_dl_type(&mut self, dl_type: u16) -> &mut Self {
        self.flow.dl_type = dl_type;
        self.mask.dl_type = u16::MAX;
        self
    }

    pub fn set_vlan_tci(&mut self, tci: u16) -> &mut Self {
        self.flow.vlan_tci = tci;
        self.mask.vlan_tci = u16::MAX;
        self
    }

    pub fn set_nw_src(&mut self, addr: u32) -> &mut Self {
        self.set_nw_src_prefix(addr, 32)
    }

    pub fn set_nw_src_prefix(&mut self, addr: u32, plen: u8) -> &mut Self {
        let mask = ipv4_prefix_mask(plen);
        self.flow.nw_src = addr & mask;
        self.mask.nw_src = mask;
        self
    }

    pub fn set_nw_dst(&mut self, addr: u32) -> &mut Self {
        self.set_nw_dst_prefix(addr, 32)
    }

    pub fn set_nw_dst_prefix(&mut self, addr: u32, plen: u8) -> &mut Self {
        let mask = ipv4_prefix_mask(plen);
        self.flow.nw_dst = addr & mask;
        self.mask.nw_dst = mask;
        self
    }

    pub fn set_nw_proto(&mut self, proto: u8) -> &mut Self {
        self.flow.nw_proto = proto;
        self.mask.nw_proto = u8::MAX;
        self
    }

    pub fn set_nw_tos(&mut self, tos: u8) -> &mut Self {
        self.flow.nw_tos = tos;
        self.mask.nw_tos = u8::MAX;
        self
    }

    pub fn set_tp_src(&mut self, port: u16) -> &mut Self {
        self.flow.tp_src = port;
        self.mask.tp_src = u16::MAX;
        self
    }

    pub fn set_tp_dst(&mut self, port: u16) -> &mut Self {
        self.flow.tp_dst = port;
        self.mask.tp_dst = u16::MAX;
        self
    }

    pub fn set_tcp_flags(&mut self, flags: u16) -> &mut Self {
        self.flow.tcp_flags = flags;
        self.mask.tcp_flags = u16::MAX;
        self
    }
}

#[inline]
fn ipv4_prefix_mask(plen: u8) -> u32 {
    debug_assert!(plen <= 32);
    if plen == 0 {
        0
    } else {
        !0u32 << (32 - plen)
    }
}

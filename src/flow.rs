//! The canonical flow vector and the field registry.
//!
//! A [`Flow`] is a fixed-layout blob of header fields, metadata first, then
//! L2, L3 and L4. Everything the classifier does is word granular: the
//! struct is exactly [`FLOW_WORDS`] 64-bit words with no implicit padding,
//! and [`Flow::words`] exposes it as such.

use std::fmt;
use std::mem;

/// Number of 64-bit words in a [`Flow`].
pub const FLOW_WORDS: usize = 9;

/// Word offsets where the metadata, L2, L3 and L4 stages of the flow begin
/// (the metadata stage starts at 0). Used as the default staged-lookup
/// segment boundaries.
pub const FLOW_SEGMENTS: [usize; 3] = [4, 6, 8];

/// A packet header vector.
///
/// Field order is chosen so that every field is naturally aligned and each
/// protocol stage starts on a 64-bit word boundary. The two `pad` fields
/// are always zero.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Flow {
    pub metadata: u64,
    pub regs: [u32; 4],
    pub in_port: u32,
    pub skb_priority: u32,
    pub dl_src: [u8; 6],
    pub dl_dst: [u8; 6],
    pub dl_type: u16,
    pub vlan_tci: u16,
    pub nw_src: u32,
    pub nw_dst: u32,
    pub nw_proto: u8,
    pub nw_tos: u8,
    pub nw_ttl: u8,
    pub nw_frag: u8,
    pad: [u8; 4],
    pub tp_src: u16,
    pub tp_dst: u16,
    pub tcp_flags: u16,
    pad2: [u8; 2],
}

const _: () = assert!(mem::size_of::<Flow>() == FLOW_WORDS * 8);
const _: () = assert!(mem::align_of::<Flow>() == 8);

impl Flow {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// The flow as 64-bit words. Sound because the layout is fully
    /// specified, naturally aligned and free of uninitialized bytes.
    #[inline]
    pub fn words(&self) -> &[u64; FLOW_WORDS] {
        unsafe { &*(self as *const Flow as *const [u64; FLOW_WORDS]) }
    }

    #[inline]
    pub(crate) fn words_mut(&mut self) -> &mut [u64; FLOW_WORDS] {
        unsafe { &mut *(self as *mut Flow as *mut [u64; FLOW_WORDS]) }
    }

    /// The field's value MSB-aligned in a u64, plus its width in bits.
    /// This is the bit string the prefix tries operate on.
    pub fn field_be_bits(&self, field: FieldId) -> (u64, u8) {
        match field {
            FieldId::Metadata => (self.metadata, 64),
            FieldId::Reg0 => ((self.regs[0] as u64) << 32, 32),
            FieldId::Reg1 => ((self.regs[1] as u64) << 32, 32),
            FieldId::Reg2 => ((self.regs[2] as u64) << 32, 32),
            FieldId::Reg3 => ((self.regs[3] as u64) << 32, 32),
            FieldId::InPort => ((self.in_port as u64) << 32, 32),
            FieldId::SkbPriority => ((self.skb_priority as u64) << 32, 32),
            FieldId::DlSrc => (mac_bits(&self.dl_src), 48),
            FieldId::DlDst => (mac_bits(&self.dl_dst), 48),
            FieldId::DlType => ((self.dl_type as u64) << 48, 16),
            FieldId::VlanTci => ((self.vlan_tci as u64) << 48, 16),
            FieldId::NwSrc => ((self.nw_src as u64) << 32, 32),
            FieldId::NwDst => ((self.nw_dst as u64) << 32, 32),
            FieldId::NwProto => ((self.nw_proto as u64) << 56, 8),
            FieldId::NwTos => ((self.nw_tos as u64) << 56, 8),
            FieldId::NwTtl => ((self.nw_ttl as u64) << 56, 8),
            FieldId::NwFrag => ((self.nw_frag as u64) << 56, 8),
            FieldId::TpSrc => ((self.tp_src as u64) << 48, 16),
            FieldId::TpDst => ((self.tp_dst as u64) << 48, 16),
            FieldId::TcpFlags => ((self.tcp_flags as u64) << 48, 16),
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flow{:x?}", self.words())
    }
}

#[inline]
fn mac_bits(mac: &[u8; 6]) -> u64 {
    let mut v = 0u64;
    for &b in mac.iter() {
        v = (v << 8) | b as u64;
    }
    v << 16
}

/// Header fields the classifier knows about.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FieldId {
    Metadata,
    Reg0,
    Reg1,
    Reg2,
    Reg3,
    InPort,
    SkbPriority,
    DlSrc,
    DlDst,
    DlType,
    VlanTci,
    NwSrc,
    NwDst,
    NwProto,
    NwTos,
    NwTtl,
    NwFrag,
    TpSrc,
    TpDst,
    TcpFlags,
}

/// Immutable field descriptor: byte offset and width inside [`Flow`], and
/// whether MSB-anchored prefixes of the field are meaningful.
pub struct FieldDesc {
    pub id: FieldId,
    pub name: &'static str,
    pub offset: usize,
    pub n_bytes: usize,
    pub prefix_eligible: bool,
}

pub const FIELDS: [FieldDesc; 20] = [
    FieldDesc { id: FieldId::Metadata, name: "metadata", offset: 0, n_bytes: 8, prefix_eligible: false },
    FieldDesc { id: FieldId::Reg0, name: "reg0", offset: 8, n_bytes: 4, prefix_eligible: false },
    FieldDesc { id: FieldId::Reg1, name: "reg1", offset: 12, n_bytes: 4, prefix_eligible: false },
    FieldDesc { id: FieldId::Reg2, name: "reg2", offset: 16, n_bytes: 4, prefix_eligible: false },
    FieldDesc { id: FieldId::Reg3, name: "reg3", offset: 20, n_bytes: 4, prefix_eligible: false },
    FieldDesc { id: FieldId::InPort, name: "in_port", offset: 24, n_bytes: 4, prefix_eligible: false },
    FieldDesc { id: FieldId::SkbPriority, name: "skb_priority", offset: 28, n_bytes: 4, prefix_eligible: false },
    FieldDesc { id: FieldId::DlSrc, name: "dl_src", offset: 32, n_bytes: 6, prefix_eligible: true },
    FieldDesc { id: FieldId::DlDst, name: "dl_dst", offset: 38, n_bytes: 6, prefix_eligible: true },
    FieldDesc { id: FieldId::DlType, name: "dl_type", offset: 44, n_bytes: 2, prefix_eligible: false },
    FieldDesc { id: FieldId::VlanTci, name: "vlan_tci", offset: 46, n_bytes: 2, prefix_eligible: false },
    FieldDesc { id: FieldId::NwSrc, name: "nw_src", offset: 48, n_bytes: 4, prefix_eligible: true },
    FieldDesc { id: FieldId::NwDst, name: "nw_dst", offset: 52, n_bytes: 4, prefix_eligible: true },
    FieldDesc { id: FieldId::NwProto, name: "nw_proto", offset: 56, n_bytes: 1, prefix_eligible: false },
    FieldDesc { id: FieldId::NwTos, name: "nw_tos", offset: 57, n_bytes: 1, prefix_eligible: false },
    FieldDesc { id: FieldId::NwTtl, name: "nw_ttl", offset: 58, n_bytes: 1, prefix_eligible: false },
    FieldDesc { id: FieldId::NwFrag, name: "nw_frag", offset: 59, n_bytes: 1, prefix_eligible: false },
    FieldDesc { id: FieldId::TpSrc, name: "tp_src", offset: 64, n_bytes: 2, prefix_eligible: false },
    FieldDesc { id: FieldId::TpDst, name: "tp_dst", offset: 66, n_bytes: 2, prefix_eligible: false },
    FieldDesc { id: FieldId::TcpFlags, name: "tcp_flags", offset: 68, n_bytes: 2, prefix_eligible: false },
];

impl FieldId {
    #[inline]
    pub fn desc(self) -> &'static FieldDesc {
        &FIELDS[self as usize]
    }

    /// Index of the flow word the field starts in.
    #[inline]
    pub fn word(self) -> usize {
        self.desc().offset / 8
    }

    #[inline]
    pub fn prefix_eligible(self) -> bool {
        self.desc().prefix_eligible
    }
}

/// The prefix-eligible fields, in the order [`crate::subtable::Subtable`]
/// caches per-field prefix lengths.
pub(crate) const PREFIX_FIELDS: [FieldId; 4] =
    [FieldId::DlSrc, FieldId::DlDst, FieldId::NwSrc, FieldId::NwDst];

#[inline]
pub(crate) fn prefix_field_index(field: FieldId) -> Option<usize> {
    PREFIX_FIELDS.iter().position(|&f| f == field)
}

/// Length of the contiguous MSB-anchored prefix in `bits` (MSB-aligned,
/// `width` wide), or `None` if the set bits do not form a prefix.
pub(crate) fn prefix_len_of(bits: u64, width: u8) -> Option<u8> {
    let ones = bits.leading_ones().min(width as u32) as u8;
    // Anything set past the leading run makes this a non-prefix mask.
    if ones < 64 && (bits << ones) != 0 {
        return None;
    }
    Some(ones)
}

/// Accumulator for the bits a lookup actually consulted.
///
/// Starts out all zero (everything wildcarded); lookup steps OR in the
/// bits they examined. The caller may then install a megaflow whose mask
/// is `masks`.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct FlowWildcards {
    pub masks: Flow,
}

impl FlowWildcards {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_catchall(&self) -> bool {
        self.masks.words().iter().all(|&w| w == 0)
    }

    /// OR the top `n_bits` of `field` into the mask. Only meaningful for
    /// prefix-eligible fields.
    pub(crate) fn or_field_prefix(&mut self, field: FieldId, n_bits: u8) {
        match field {
            FieldId::NwSrc => self.masks.nw_src |= be_mask32(n_bits),
            FieldId::NwDst => self.masks.nw_dst |= be_mask32(n_bits),
            FieldId::DlSrc => or_mac_prefix(&mut self.masks.dl_src, n_bits),
            FieldId::DlDst => or_mac_prefix(&mut self.masks.dl_dst, n_bits),
            _ => debug_assert!(false, "field {:?} is not prefix eligible", field),
        }
    }

    #[inline]
    pub(crate) fn or_metadata(&mut self) {
        self.masks.metadata = u64::MAX;
    }
}

#[inline]
fn be_mask32(n_bits: u8) -> u32 {
    debug_assert!(n_bits <= 32);
    if n_bits == 0 {
        0
    } else {
        !0u32 << (32 - n_bits)
    }
}

fn or_mac_prefix(mac: &mut [u8; 6], n_bits: u8) {
    debug_assert!(n_bits <= 48);
    let m = if n_bits == 0 { 0u64 } else { (!0u64 << (64 - n_bits)) >> 16 };
    for (i, b) in mac.iter_mut().enumerate() {
        *b |= ((m >> (40 - 8 * i)) & 0xff) as u8;
    }
}

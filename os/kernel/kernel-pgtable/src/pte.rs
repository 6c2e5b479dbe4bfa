//! # Page-Table Entry Codec
//!
//! Every entry is one 64-bit word. The same word is read by the hardware
//! walker, so entries are only ever replaced by a single aligned store.
//!
//! ## Bit layout
//!
//! | Bits   | Field      | Valid leaf | Valid table | Invalid |
//! |:-------|:-----------|:-----------|:------------|:--------|
//! | 0      | `valid`    | 1 | 1 | 0 |
//! | 1      | `table`    | L0–L2: 0 (block), L3: 1 (page) | 1 | – |
//! | 2..5   | `mem_attr` | memory type | 0 | owner id (low bits) |
//! | 6..7   | `ap`       | access permissions | 0 | owner id (high bits) |
//! | 8..9   | `sh`       | shareability | 0 | 0 |
//! | 10     | `af`       | access flag | 0 | 0 |
//! | 12..47 | `oa`       | output address | child table | 0 |
//! | 53..54 | `xn`       | execute-never | 0 | 0 |
//! | 55..58 | `sw`       | software bits | 0 | 0 |
//!
//! The meaning of `mem_attr` and `ap` differs per [`Stage`]:
//!
//! | Field | Stage-1 (hypervisor) | Stage-2 (guest) |
//! |:------|:---------------------|:----------------|
//! | `mem_attr` | index: `0` normal, `1` device | `0b1111` normal WB, `0b0001` device |
//! | `ap` | `0b01` read/write, `0b11` read-only | bit 6 read, bit 7 write |
//!
//! ## Decoding
//!
//! [`decode`] never fails: any pattern it does not recognize (for example a
//! valid entry at L3 without the page bit) is reported as
//! [`Entry::Invalid`] with the default owner, so nothing is ever followed
//! through a malformed descriptor.

use crate::addresses::PhysicalAddress;
use crate::level::Level;
use bitfield_struct::bitfield;
use core::fmt;

/// Number of bits an invalid entry spends on its owner id.
pub const OWNER_ID_BITS: u32 = 8;

/// First bit of the owner id inside an invalid entry.
const OWNER_ID_SHIFT: u32 = 2;

const OWNER_ID_MASK: u64 = ((1 << OWNER_ID_BITS) - 1) << OWNER_ID_SHIFT;

const _: () = assert!(OWNER_ID_SHIFT + OWNER_ID_BITS <= 64);

/// Output-address bits of a descriptor.
const OA_MASK: u64 = ((1 << 36) - 1) << 12;

/// First output address a descriptor cannot encode.
pub(crate) const OA_LIMIT: u64 = 1 << 48;

/// Attribute bits that encode a [`Prot`] (memory type, permissions, shareability, XN).
pub(crate) const PROT_ATTR_MASK: u64 = (0b1111 << 2) | (0b11 << 6) | (0b11 << 8) | (0b11 << 53);

/// Every leaf attribute bit, i.e. everything except the descriptor type and output address.
const LEAF_ATTR_MASK: u64 = !(OA_MASK | 0b11);

const S1_ATTR_IDX_NORMAL: u8 = 0;
const S1_ATTR_IDX_DEVICE: u8 = 1;
const S1_AP_RW: u8 = 0b01;
const S1_AP_RO: u8 = 0b11;

const S2_MEMATTR_NORMAL: u8 = 0b1111;
const S2_MEMATTR_DEVICE: u8 = 0b0001;
const S2_AP_R: u8 = 0b01;
const S2_AP_W: u8 = 0b10;

const SH_INNER: u8 = 0b11;
const XN: u8 = 0b10;

/// Which translation regime an entry belongs to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Stage {
    /// The hypervisor's own stage-1 tables.
    Hyp,
    /// Guest IPA to host PA.
    Stage2,
}

bitflags::bitflags! {
    /// Access permissions and memory type of a mapping.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
    pub struct Prot: u8 {
        /// Executable.
        const X      = 1 << 0;
        /// Writable.
        const W      = 1 << 1;
        /// Readable.
        const R      = 1 << 2;
        /// Device memory (uncached, no speculation).
        const DEVICE = 1 << 3;

        /// Read/write.
        const RW  = Self::R.bits() | Self::W.bits();
        /// Read/execute.
        const RX  = Self::R.bits() | Self::X.bits();
        /// Read/write/execute.
        const RWX = Self::RW.bits() | Self::X.bits();
    }
}

/// Tag stored in invalid stage-2 entries recording who owns the page.
///
/// Owner `0` is the default owner and encodes as an all-zero entry.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct OwnerId(u32);

impl OwnerId {
    /// The default owner; an unannotated invalid entry.
    pub const DEFAULT: Self = Self(0);

    /// Largest representable owner id.
    pub const MAX: Self = Self((1 << OWNER_ID_BITS) - 1);

    /// Create an owner id, or `None` if it does not fit into [`OWNER_ID_BITS`].
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Option<Self> {
        if id <= Self::MAX.0 { Some(Self(id)) } else { None }
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_default(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// A raw page-table entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq, Hash)]
pub struct Pte {
    /// Valid (bit 0).
    pub valid: bool,
    /// Table or page descriptor (bit 1); clear for blocks.
    pub table: bool,
    /// Memory type (bits 2..5).
    #[bits(4)]
    pub mem_attr: u8,
    /// Access permissions (bits 6..7).
    #[bits(2)]
    pub ap: u8,
    /// Shareability (bits 8..9).
    #[bits(2)]
    pub sh: u8,
    /// Access flag (bit 10).
    pub af: bool,
    /// Not-global (bit 11): unused.
    #[bits(1)]
    __ng: u8,
    /// Output address bits 12..47.
    #[bits(36)]
    oa_47_12: u64,
    /// Reserved (bits 48..52).
    #[bits(5)]
    __res48_52: u8,
    /// Execute-never (bits 53..54).
    #[bits(2)]
    pub xn: u8,
    /// Software bits (55..58); ignored by every comparison in this crate.
    #[bits(4)]
    pub sw: u8,
    /// Ignored (bits 59..63).
    #[bits(5)]
    __ignored: u8,
}

impl Pte {
    /// The all-zero entry: invalid and owned by the default owner.
    pub const INVALID: Self = Self::new();

    /// Output address (leaf) or child table address (table).
    #[inline]
    #[must_use]
    pub const fn output_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.oa_47_12() << 12)
    }

    /// Replace the output address; low bits of `pa` are dropped.
    ///
    /// Bits at or above [`OA_LIMIT`] are dropped too, so callers validate
    /// the address first.
    #[inline]
    #[must_use]
    pub const fn with_output_address(self, pa: PhysicalAddress) -> Self {
        self.with_oa_47_12((pa.as_u64() & OA_MASK) >> 12)
    }

    /// Whether this entry is accounted in its table page's reference count.
    ///
    /// Everything except the all-zero entry is counted, including owner annotations.
    #[inline]
    #[must_use]
    pub const fn is_counted(self) -> bool {
        self.into_bits() != 0
    }

    /// Whether this valid entry is a table descriptor at `level`.
    #[inline]
    #[must_use]
    pub const fn is_table(self, level: Level) -> bool {
        self.valid() && self.table() && !level.is_last()
    }

    /// Whether this entry is a valid block or page descriptor at `level`.
    #[inline]
    #[must_use]
    pub const fn is_leaf(self, level: Level) -> bool {
        self.valid() && (self.table() == level.is_last())
    }

    /// Whether the access flag is set on a valid leaf.
    #[inline]
    #[must_use]
    pub const fn young(self) -> bool {
        self.valid() && self.af()
    }

    /// Owner id carried by an invalid entry.
    #[inline]
    #[must_use]
    pub const fn owner(self) -> OwnerId {
        OwnerId(((self.into_bits() & OWNER_ID_MASK) >> OWNER_ID_SHIFT) as u32)
    }

    /// Permission/attribute bits relevant for [`Prot`] comparisons.
    #[inline]
    #[must_use]
    pub const fn prot_attrs(self) -> u64 {
        self.into_bits() & PROT_ATTR_MASK
    }

    /// Whether a valid leaf maps normal (cacheable) memory.
    #[inline]
    #[must_use]
    pub const fn is_cacheable(self, stage: Stage) -> bool {
        match stage {
            Stage::Hyp => self.mem_attr() == S1_ATTR_IDX_NORMAL,
            Stage::Stage2 => self.mem_attr() == S2_MEMATTR_NORMAL,
        }
    }

    /// Decode the permissions of a valid leaf.
    #[must_use]
    pub const fn prot(self, stage: Stage) -> Prot {
        let mut bits = 0;
        match stage {
            Stage::Hyp => {
                bits |= Prot::R.bits();
                if self.ap() == S1_AP_RW {
                    bits |= Prot::W.bits();
                }
                if self.mem_attr() == S1_ATTR_IDX_DEVICE {
                    bits |= Prot::DEVICE.bits();
                }
            }
            Stage::Stage2 => {
                if self.ap() & S2_AP_R != 0 {
                    bits |= Prot::R.bits();
                }
                if self.ap() & S2_AP_W != 0 {
                    bits |= Prot::W.bits();
                }
                if self.mem_attr() == S2_MEMATTR_DEVICE {
                    bits |= Prot::DEVICE.bits();
                }
            }
        }
        if self.xn() & XN == 0 {
            bits |= Prot::X.bits();
        }
        Prot::from_bits_truncate(bits)
    }
}

impl fmt::Display for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.into_bits())
    }
}

/// A decoded entry.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Entry {
    /// Not mapped; optionally annotated with an owner.
    Invalid(OwnerId),
    /// Points to a child table one level down.
    Table(PhysicalAddress),
    /// Maps `phys` with `prot`. `young` reflects the access flag.
    Leaf {
        phys: PhysicalAddress,
        prot: Prot,
        young: bool,
    },
}

/// Decode `pte` as found at `level` of a `stage` table.
#[must_use]
pub const fn decode(pte: Pte, level: Level, stage: Stage) -> Entry {
    if !pte.valid() {
        return Entry::Invalid(pte.owner());
    }
    if pte.is_table(level) {
        return Entry::Table(pte.output_address());
    }
    if pte.is_leaf(level) && level.supports_block() {
        return Entry::Leaf {
            phys: pte.output_address(),
            prot: pte.prot(stage),
            young: pte.af(),
        };
    }
    Entry::Invalid(OwnerId::DEFAULT)
}

/// Encode a table descriptor pointing at `child`.
#[inline]
#[must_use]
pub const fn encode_table(child: PhysicalAddress) -> Pte {
    Pte::new()
        .with_valid(true)
        .with_table(true)
        .with_output_address(child)
}

/// Encode an invalid entry annotated with `owner`.
#[inline]
#[must_use]
pub const fn encode_invalid(owner: OwnerId) -> Pte {
    Pte::from_bits(((owner.0 as u64) << OWNER_ID_SHIFT) & OWNER_ID_MASK)
}

/// Encode a leaf mapping `phys` at `level`.
///
/// `phys` is rounded down to the level's granule. The access flag is always
/// set and normal memory is marked inner-shareable.
#[must_use]
pub const fn encode_leaf(phys: PhysicalAddress, level: Level, prot: Prot, stage: Stage) -> Pte {
    let device = prot.contains(Prot::DEVICE);
    let mut pte = Pte::new()
        .with_valid(true)
        .with_table(level.is_last())
        .with_output_address(phys.align_down(level.granule()))
        .with_af(true);

    pte = match stage {
        Stage::Hyp => pte
            .with_mem_attr(if device { S1_ATTR_IDX_DEVICE } else { S1_ATTR_IDX_NORMAL })
            .with_ap(if prot.contains(Prot::W) { S1_AP_RW } else { S1_AP_RO }),
        Stage::Stage2 => {
            let mut ap = 0;
            if prot.contains(Prot::R) {
                ap |= S2_AP_R;
            }
            if prot.contains(Prot::W) {
                ap |= S2_AP_W;
            }
            pte.with_mem_attr(if device { S2_MEMATTR_DEVICE } else { S2_MEMATTR_NORMAL })
                .with_ap(ap)
        }
    };

    if !device {
        pte = pte.with_sh(SH_INNER);
    }
    if !prot.contains(Prot::X) {
        pte = pte.with_xn(XN);
    }
    pte
}

/// Re-encode the leaf `template` at `level` with output address `phys`,
/// keeping every attribute bit.
#[inline]
#[must_use]
pub(crate) const fn reencode_leaf(template: Pte, phys: PhysicalAddress, level: Level) -> Pte {
    Pte::from_bits(template.into_bits() & LEAF_ATTR_MASK)
        .with_valid(true)
        .with_table(level.is_last())
        .with_output_address(phys)
}

/// Stage-2 permission bits for [`relax`](crate::PageTable::stage2_relax_perms): `(set, clear)`.
#[must_use]
pub(crate) const fn stage2_relax_bits(prot: Prot) -> (u64, u64) {
    let mut ap = 0;
    if prot.contains(Prot::R) {
        ap |= S2_AP_R;
    }
    if prot.contains(Prot::W) {
        ap |= S2_AP_W;
    }
    let set = Pte::new().with_ap(ap).into_bits();
    let clear = if prot.contains(Prot::X) {
        Pte::new().with_xn(0b11).into_bits()
    } else {
        0
    };
    (set, clear)
}

/// The stage-2 write permission bit.
pub(crate) const S2_WRITE_BIT: u64 = (S2_AP_W as u64) << 6;

/// The access flag bit.
pub(crate) const AF_BIT: u64 = 1 << 10;

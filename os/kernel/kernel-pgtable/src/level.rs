//! # Translation Levels
//!
//! A 4 KiB granule resolves 9 input-address bits per level, so a 48-bit input
//! address splits into four indices plus the page offset:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L0   |  L1   |  L2   |  L3   | Offset |
//! ```
//!
//! | Level | Granule | Leaf kind |
//! |:------|:--------|:----------|
//! | 0 | 512 GiB | never a leaf |
//! | 1 | 1 GiB   | block |
//! | 2 | 2 MiB   | block |
//! | 3 | 4 KiB   | page |
//!
//! Smaller input spaces start the walk at a deeper level. Stage-2 may
//! additionally concatenate up to 16 root tables so that one level fewer is
//! needed for the same IPA size.

use crate::PAGE_SHIFT;
use core::fmt;

/// Number of input-address bits resolved by one table level.
pub const BITS_PER_LEVEL: u32 = PAGE_SHIFT - 3;

/// Number of 64-bit entries in one table page.
pub const PTES_PER_TABLE: usize = 1 << BITS_PER_LEVEL;

/// Maximum number of concatenated stage-2 root tables.
pub const MAX_STAGE2_ROOT_PAGES: u64 = 16;

/// One level of the translation tree, `0..=3`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Level(u8);

impl Level {
    /// Depth of a full tree.
    pub const MAX_LEVELS: u8 = 4;

    /// The top-most level of a 48-bit tree.
    pub const ZERO: Self = Self(0);

    /// The page level.
    pub const LAST: Self = Self(Self::MAX_LEVELS - 1);

    /// The coarsest level at which a block leaf may be installed.
    pub const MIN_BLOCK: Self = Self(1);

    #[inline]
    #[must_use]
    pub const fn new(level: u8) -> Option<Self> {
        if level < Self::MAX_LEVELS {
            Some(Self(level))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of low input-address bits translated below an entry of this level.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        BITS_PER_LEVEL * (Self::MAX_LEVELS - self.0) as u32 + 3
    }

    /// Bytes of input address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn granule(self) -> u64 {
        1 << self.shift()
    }

    /// Index of `addr` within a (non-root) table at this level.
    #[inline]
    #[must_use]
    pub const fn index(self, addr: u64) -> usize {
        ((addr >> self.shift()) as usize) & (PTES_PER_TABLE - 1)
    }

    /// The level one step closer to the leaves, if any.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        Self::new(self.0 + 1)
    }

    /// The level one step closer to the root, if any.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        match self.0 {
            0 => None,
            l => Some(Self(l - 1)),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_last(self) -> bool {
        self.0 == Self::LAST.0
    }

    /// Whether a leaf may live at this level.
    #[inline]
    #[must_use]
    pub const fn supports_block(self) -> bool {
        self.0 >= Self::MIN_BLOCK.0
    }

    /// Whether a leaf mapping `[addr, end)` onto `phys` can be installed at this level.
    ///
    /// `phys` is `None` for ownership annotations, which carry no output address.
    #[inline]
    #[must_use]
    pub const fn block_fits(self, addr: u64, end: u64, phys: Option<u64>) -> bool {
        if !self.supports_block() {
            return false;
        }
        let granule = self.granule();
        if addr & (granule - 1) != 0 || end - addr < granule {
            return false;
        }
        match phys {
            Some(pa) => pa & (granule - 1) == 0,
            None => true,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Root level of a stage-1 (hypervisor) tree covering `ia_bits` of input space.
#[must_use]
pub(crate) const fn hyp_start_level(ia_bits: u32) -> Level {
    let levels = (ia_bits - 4) / BITS_PER_LEVEL;
    Level(Level::MAX_LEVELS - levels as u8)
}

/// Root level of a stage-2 tree, allowing concatenated root tables.
#[must_use]
pub(crate) const fn stage2_start_level(ia_bits: u32) -> Level {
    let levels = (ia_bits - 8) / BITS_PER_LEVEL;
    Level(Level::MAX_LEVELS - levels as u8)
}

/// Number of entries in the root table(s) of a tree rooted at `start`.
#[must_use]
pub(crate) const fn root_entries(ia_bits: u32, start: Level) -> usize {
    1 << (ia_bits - start.shift())
}

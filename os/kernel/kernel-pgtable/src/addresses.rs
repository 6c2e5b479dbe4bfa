//! # Physical Addresses
//!
//! Input addresses (guest IPAs for stage-2, hypervisor VAs for stage-1) are
//! plain `u64` values throughout the walker; only the *output* side, i.e.
//! table pages and mapped memory, is wrapped in [`PhysicalAddress`] so the two
//! cannot be mixed up.

use crate::{PAGE_SIZE, align_down};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Physical memory address (host RAM / MMIO, or a table page).
///
/// ### Examples
/// ```rust
/// # use kernel_pgtable::PhysicalAddress;
/// let pa = PhysicalAddress::new(0x8000_0042);
/// assert_eq!(pa.page_base().as_u64(), 0x8000_0000);
/// assert_eq!((pa + 0x1000).as_u64(), 0x8000_1042);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Round down to the containing 4 KiB page.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    /// Round down to a multiple of `granule` (power of two).
    #[inline]
    #[must_use]
    pub const fn align_down(self, granule: u64) -> Self {
        Self(align_down(self.0, granule))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, granule: u64) -> bool {
        self.0 & (granule - 1) == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<PhysicalAddress> for u64 {
    #[inline]
    fn from(v: PhysicalAddress) -> Self {
        v.as_u64()
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<Self> for PhysicalAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

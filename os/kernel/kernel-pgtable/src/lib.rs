//! # Hypervisor Page Tables
//!
//! A radix page-table walker and the operations a hypervisor performs on top
//! of it, for two translation regimes:
//!
//! - **stage-2**: guest intermediate physical address (IPA) → host physical
//!   address, one tree per VM, and
//! - **stage-1**: the hypervisor's own virtual address space.
//!
//! ## What you get
//! - A [`PageTable`] with its lifecycle ([`hyp_init`](PageTable::hyp_init),
//!   [`stage2_init`](PageTable::stage2_init), [`destroy`](PageTable::destroy)).
//! - Mapping with automatic block coalescing, unmapping with table
//!   reclamation, ownership annotations, write protection, access-flag
//!   aging, permission relaxation, cache maintenance and range queries.
//! - A generic [`Walker`] for everything else.
//! - The seams to the rest of the system: [`MmOps`] for memory,
//!   [`ArchCapabilities`] and [`MmuHooks`] for CPU features and maintenance.
//! - [`ArenaMmOps`], a host-memory [`MmOps`] for tests and tools.
//!
//! ## Input address → output address walk
//!
//! With a 4 KiB granule each level resolves 9 bits; see [`level`] for the
//! exact split. A walk stops at the first leaf:
//!
//! ```text
//!  L0  →  L1  →  L2  →  L3  →  4 KiB page
//!          │      │
//!          │      └────────►  2 MiB block
//!          └───────────────►  1 GiB block
//! ```
//!
//! ## Break-before-make
//!
//! A valid entry is never overwritten with a different valid translation.
//! It is first cleared, the stale translation is invalidated through
//! [`MmuHooks::tlb_invalidate_ipa`], and only then is the new entry stored.
//! Table pages are returned to [`MmOps`] only after the entry pointing at
//! them has been cleared and invalidated.
//!
//! ## Example
//!
//! ```rust
//! use kernel_pgtable::{ArenaMmOps, PageTable, PhysicalAddress, Prot};
//!
//! let mm = ArenaMmOps::new(64);
//! let mut pgt = PageTable::hyp_init(39, &mm)?;
//! pgt.hyp_map(0x20_0000, 0x20_0000, PhysicalAddress::new(0x8020_0000), Prot::RW)?;
//!
//! let (pte, level) = pgt.get_leaf(0x20_1000)?;
//! assert_eq!(level.granule(), 0x20_0000);
//! assert_eq!(pte.output_address(), PhysicalAddress::new(0x8020_0000));
//! # Ok::<(), kernel_pgtable::PageTableError>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always, clippy::cast_possible_truncation)]

extern crate alloc;

mod addresses;
mod arch;
mod arena;
mod hyp;
pub mod level;
mod mm;
mod pte;
mod split;
mod stage2;
mod table;
mod unmap;
mod walker;

pub use crate::addresses::PhysicalAddress;
pub use crate::arch::{ArchCapabilities, MmuHooks, Stage2Flags, Stage2Mmu};
pub use crate::arena::{ArenaCache, ArenaMmOps};
pub use crate::level::Level;
pub use crate::mm::{MmOps, TablePage};
pub use crate::pte::{
    Entry, OWNER_ID_BITS, OwnerId, Prot, Pte, Stage, decode, encode_invalid, encode_leaf,
    encode_table,
};
pub use crate::stage2::MemRange;
pub use crate::table::PageTable;
pub use crate::walker::{Visit, Visitor, WalkFlags, Walker};

/// log2 of the translation granule.
pub const PAGE_SHIFT: u32 = 12;

/// The translation granule (4 KiB).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Errors reported by page-table operations.
///
/// Errors are propagated as soon as they occur. Work already done on the
/// range is not rolled back; the tree stays structurally valid.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageTableError {
    /// Misaligned, out-of-range or otherwise malformed arguments.
    #[error("invalid input")]
    InvalidInput,
    /// The memory callbacks could not provide a table page.
    #[error("out of memory")]
    NoMemory,
    /// The range already holds a different mapping.
    #[error("range already mapped")]
    AlreadyMapped,
    /// No valid leaf covers the address.
    #[error("address not mapped")]
    NotMapped,
    /// The operation does not apply to this kind of table or configuration.
    #[error("operation not supported")]
    Unsupported,
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, PageTableError>;

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_pgtable::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u64`.
///
/// ### Examples
/// ```rust
/// # use kernel_pgtable::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4096,    4096), 4096);
/// assert_eq!(align_up(0x12345,   16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Page-align an operation's `[addr, addr + size)`: the in-page offset of
/// `addr` is dropped and `size` is rounded up to whole pages.
pub(crate) const fn page_range(addr: u64, size: u64) -> Result<(u64, u64)> {
    let start = align_down(addr, PAGE_SIZE);
    match size.checked_add(PAGE_SIZE - 1) {
        Some(s) => Ok((start, align_down(s, PAGE_SIZE))),
        None => Err(PageTableError::InvalidInput),
    }
}

/// Page-align the output base of a `size`-byte mapping at `phys` and check
/// that the whole output range is encodable.
pub(crate) const fn output_range(phys: PhysicalAddress, size: u64) -> Result<PhysicalAddress> {
    let base = phys.page_base();
    match base.as_u64().checked_add(size) {
        Some(end) if end <= pte::OA_LIMIT => Ok(base),
        _ => Err(PageTableError::InvalidInput),
    }
}

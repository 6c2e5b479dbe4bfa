//! # Memory Callbacks
//!
//! The page-table code never owns memory. Table pages come from, and go back
//! to, an embedder-supplied [`MmOps`] implementation, which also translates
//! between physical addresses and pointers usable by the current CPU
//! (identity map, HHDM, or a host-side arena as in [`ArenaMmOps`](crate::ArenaMmOps)).
//!
//! ## Reference counts
//!
//! Every table page carries a reference count managed through
//! [`MmOps::get_page`] / [`MmOps::put_page`]:
//!
//! - one reference for the page's own existence (dropped when the table is unlinked),
//! - one reference per *counted* entry in it (see [`Pte::is_counted`](crate::Pte::is_counted)).
//!
//! A page is returned to the allocator when its count reaches zero. Root pages
//! of a stage-2 table are allocated with [`MmOps::zalloc_pages_exact`] and are
//! released with [`MmOps::free_pages_exact`] regardless of their count.

use crate::addresses::PhysicalAddress;
use core::ptr::NonNull;

/// Memory-management callbacks supplied by the embedder.
///
/// Implementations must hand out zeroed, 4 KiB-aligned pages and keep them
/// mapped (at the address returned by [`phys_to_virt`](Self::phys_to_virt))
/// until they are released.
pub trait MmOps {
    /// Per-operation page reserve consulted by [`zalloc_page`](Self::zalloc_page).
    ///
    /// Stage-2 operations that may allocate (map, set-owner) take an optional
    /// `&mut Cache` so the caller can top up pages ahead of time, outside of
    /// any lock protecting the table.
    type Cache;

    /// Allocate one zeroed page with a reference count of one.
    fn zalloc_page(&self, cache: Option<&mut Self::Cache>) -> Option<TablePage>;

    /// Allocate `size` bytes (a multiple of 4 KiB) of zeroed, physically
    /// contiguous memory. Every page starts with a reference count of one.
    fn zalloc_pages_exact(&self, size: usize) -> Option<PhysicalAddress>;

    /// Release memory obtained from [`zalloc_pages_exact`](Self::zalloc_pages_exact).
    fn free_pages_exact(&self, pa: PhysicalAddress, size: usize);

    /// Take a reference on the page containing `pa`.
    fn get_page(&self, pa: PhysicalAddress);

    /// Drop a reference on the page containing `pa`, freeing it when none remain.
    fn put_page(&self, pa: PhysicalAddress);

    /// Current reference count of the page containing `pa`.
    fn page_count(&self, pa: PhysicalAddress) -> u32;

    /// Pointer to the first word of the page at `pa`.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> NonNull<u64>;

    /// Physical address behind a pointer previously produced by
    /// [`phys_to_virt`](Self::phys_to_virt).
    fn virt_to_phys(&self, va: NonNull<u64>) -> PhysicalAddress;
}

/// A freshly allocated, zeroed page that is not yet linked into a table.
///
/// The handle must either be linked into a parent entry with
/// [`into_linked`](Self::into_linked) or handed back with
/// [`release`](Self::release); dropping it on the floor leaks the page.
#[must_use = "a table page must be linked into a table or released"]
#[derive(Debug, Eq, PartialEq)]
pub struct TablePage(PhysicalAddress);

impl TablePage {
    /// Wrap a page allocated by an [`MmOps`] implementation.
    ///
    /// Only allocators should construct handles.
    #[inline]
    pub const fn new(pa: PhysicalAddress) -> Self {
        Self(pa)
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.0
    }

    /// Give up the handle because the page is now referenced by a table entry.
    #[inline]
    #[must_use]
    pub(crate) const fn into_linked(self) -> PhysicalAddress {
        self.0
    }

    /// Drop the allocation reference, freeing the page.
    #[inline]
    pub fn release<M: MmOps + ?Sized>(self, mm: &M) {
        mm.put_page(self.0);
    }
}

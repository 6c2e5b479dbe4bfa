//! # Splitting and Coalescing
//!
//! Turning one entry into a table of 512 finer entries and back.
//!
//! A **split** fills a fresh child table with copies of the parent entry at
//! the next level: a block becomes 512 smaller blocks (or pages) with the same
//! attributes and consecutive output addresses, an owner annotation becomes
//! 512 identical annotations. The child is complete before it is linked, so a
//! concurrent walker sees either the old entry, nothing, or the full child.
//!
//! **Coalescing** is the inverse: a table whose entries all agree with one
//! block is replaced by that block and its pages are released.

use crate::addresses::PhysicalAddress;
use crate::arch::MmuHooks;
use crate::level::{Level, PTES_PER_TABLE};
use crate::mm::MmOps;
use crate::pte::{Pte, encode_table, reencode_leaf};
use crate::walker::{Visit, slot};
use crate::{PageTableError, Result};
use core::sync::atomic::Ordering;
use log::trace;

/// Allocate a child table for the entry under `visit`, filled with copies of it.
fn alloc_child<M: MmOps>(
    visit: &Visit<'_, M>,
    cache: Option<&mut M::Cache>,
) -> Result<PhysicalAddress> {
    let old = visit.old();
    let child_level = visit.level().next().ok_or(PageTableError::InvalidInput)?;
    let mm = visit.mm();
    let page = mm.zalloc_page(cache).ok_or(PageTableError::NoMemory)?;
    let child = page.into_linked();

    if old.is_counted() {
        let base = mm.phys_to_virt(child);
        let granule = child_level.granule();
        let phys = old.output_address();
        for i in 0..PTES_PER_TABLE {
            let pte = if old.valid() {
                reencode_leaf(old, phys + i as u64 * granule, child_level)
            } else {
                old
            };
            // SAFETY: `i` < 512 entries of the page we just allocated.
            unsafe { slot(base, i) }.store(pte.into_bits(), Ordering::Relaxed);
            mm.get_page(child);
        }
    }
    Ok(child)
}

/// Replace the invalid entry under `visit` with a new child table.
///
/// An owner annotation is replicated into every child entry.
pub(crate) fn install_table<M: MmOps>(
    visit: &Visit<'_, M>,
    cache: Option<&mut M::Cache>,
) -> Result<()> {
    let old = visit.old();
    debug_assert!(!old.valid());
    let child = alloc_child(visit, cache)?;
    visit.store(encode_table(child));
    if !old.is_counted() {
        visit.mm().get_page(visit.table_page());
    }
    Ok(())
}

/// Replace the valid block under `visit` with an equivalent table, break-before-make.
pub(crate) fn split_block<M, H>(
    visit: &Visit<'_, M>,
    cache: Option<&mut M::Cache>,
    hooks: &H,
) -> Result<()>
where
    M: MmOps,
    H: MmuHooks + ?Sized,
{
    debug_assert!(visit.old().valid());
    let child = alloc_child(visit, cache)?;
    visit.store(Pte::INVALID);
    hooks.tlb_invalidate_ipa(visit.entry_base(), visit.level());
    visit.store(encode_table(child));
    trace!(
        "split {} block at {:#x} into table {child}",
        visit.level(),
        visit.entry_base()
    );
    Ok(())
}

/// Split whatever the entry under `visit` holds so that a sub-range of it can be changed.
pub(crate) fn split_entry<M, H>(
    visit: &Visit<'_, M>,
    cache: Option<&mut M::Cache>,
    hooks: &H,
) -> Result<()>
where
    M: MmOps,
    H: MmuHooks + ?Sized,
{
    if visit.old().valid() {
        split_block(visit, cache, hooks)
    } else {
        install_table(visit, cache)
    }
}

/// Whether the subtree at `table` (entries of `level`) is equivalent to the
/// leaf `block`, i.e. every entry is either empty or maps the matching part of
/// `block` with identical attributes.
pub(crate) fn subtree_matches<M: MmOps>(
    mm: &M,
    table: PhysicalAddress,
    level: Level,
    block: Pte,
) -> bool {
    let base = mm.phys_to_virt(table);
    let granule = level.granule();
    let phys = block.output_address();
    (0..PTES_PER_TABLE).all(|i| {
        // SAFETY: `table` is a live child table of 512 entries.
        let pte = Pte::from_bits(unsafe { slot(base, i) }.load(Ordering::Acquire));
        let expected = phys + i as u64 * granule;
        if pte == Pte::INVALID {
            true
        } else if pte.is_table(level) {
            let part = reencode_leaf(block, expected, level);
            level
                .next()
                .is_some_and(|next| subtree_matches(mm, pte.output_address(), next, part))
        } else {
            pte.is_leaf(level)
                && pte.output_address() == expected
                && pte.prot_attrs() == block.prot_attrs()
        }
    })
}

/// Drop every reference held by the unlinked subtree at `table`, freeing its pages.
///
/// The caller must already have cleared the parent entry and invalidated
/// the TLBs; nothing in the subtree is reachable any more.
pub(crate) fn release_table<M: MmOps>(mm: &M, table: PhysicalAddress, level: Level) {
    let base = mm.phys_to_virt(table);
    for i in 0..PTES_PER_TABLE {
        // SAFETY: `table` is a live table of 512 entries.
        let slot = unsafe { slot(base, i) };
        let pte = Pte::from_bits(slot.load(Ordering::Acquire));
        if !pte.is_counted() {
            continue;
        }
        if let (true, Some(next)) = (pte.is_table(level), level.next()) {
            release_table(mm, pte.output_address(), next);
        }
        slot.store(0, Ordering::Relaxed);
        mm.put_page(table);
    }
    trace!("released {level} table {table}");
    mm.put_page(table);
}

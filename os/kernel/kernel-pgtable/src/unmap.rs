//! Unmapping, shared by both stages.
//!
//! For every counted entry in range:
//!
//! 1. clear the entry,
//! 2. invalidate the TLB for it (valid entries only),
//! 3. drop the table page's reference,
//! 4. clean the data cache over the old target if the stage requires it.
//!
//! Entries only partly inside the range are split first so the remainder
//! keeps its translation. A table left without entries is unlinked and freed
//! on the way back up, but only if the range covered it entirely.

use crate::Result;
use crate::arch::MmuHooks;
use crate::mm::MmOps;
use crate::pte::Pte;
use crate::split::split_entry;
use crate::walker::{Visit, Visitor, WalkFlags};
use log::trace;

pub(crate) struct Unmapper<'h, H: MmuHooks + ?Sized> {
    hooks: &'h H,
    clean_dcache: bool,
    unmapped: u64,
}

impl<'h, H: MmuHooks + ?Sized> Unmapper<'h, H> {
    pub const fn new(hooks: &'h H, clean_dcache: bool) -> Self {
        Self {
            hooks,
            clean_dcache,
            unmapped: 0,
        }
    }

    /// Bytes of valid mappings removed so far.
    #[must_use]
    pub const fn unmapped(&self) -> u64 {
        self.unmapped
    }

    fn free_table<M: MmOps>(&self, visit: &Visit<'_, M>) {
        let old = visit.old();
        let child = old.output_address();
        if !visit.covers_entry() || visit.mm().page_count(child) != 1 {
            return;
        }
        visit.store(Pte::INVALID);
        self.hooks.tlb_invalidate_ipa(visit.entry_base(), visit.level());
        visit.mm().put_page(visit.table_page());
        visit.mm().put_page(child);
        trace!("freed empty table {child} below {:#x}", visit.entry_base());
    }
}

impl<M: MmOps, H: MmuHooks + ?Sized> Visitor<M> for Unmapper<'_, H> {
    fn visit(&mut self, visit: &Visit<'_, M>) -> Result<()> {
        let old = visit.old();
        if visit.kind() == WalkFlags::TABLE_POST {
            if old.is_table(visit.level()) {
                self.free_table(visit);
            }
            return Ok(());
        }
        if !old.is_counted() {
            return Ok(());
        }
        if !visit.covers_entry() {
            return split_entry(visit, None, self.hooks);
        }

        visit.store(Pte::INVALID);
        if old.valid() {
            self.hooks.tlb_invalidate_ipa(visit.entry_base(), visit.level());
        }
        visit.mm().put_page(visit.table_page());

        if old.valid() {
            let granule = visit.level().granule();
            self.unmapped += granule;
            if self.clean_dcache && old.is_cacheable(visit.stage()) {
                self.hooks.dcache_clean_inval_poc(old.output_address(), granule);
            }
        }
        Ok(())
    }
}

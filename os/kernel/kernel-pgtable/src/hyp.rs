//! # Stage-1 Operations
//!
//! The hypervisor's own address space. Table pages come straight from
//! [`MmOps::zalloc_page`] without a cache, and the caller supplies the TLB
//! maintenance for unmapping since a stage-1 table has no MMU of its own.

use crate::addresses::PhysicalAddress;
use crate::arch::MmuHooks;
use crate::mm::MmOps;
use crate::pte::{Prot, Stage};
use crate::stage2::Mapper;
use crate::table::{Mode, PageTable};
use crate::unmap::Unmapper;
use crate::walker::{WalkFlags, Walker};
use crate::{PageTableError, Result, output_range, page_range};

/// Whether `prot` can be expressed by a stage-1 leaf.
const fn hyp_prot_valid(prot: Prot) -> bool {
    if !prot.contains(Prot::R) {
        return false;
    }
    !(prot.contains(Prot::X) && prot.intersects(Prot::W.union(Prot::DEVICE)))
}

impl<M: MmOps> PageTable<'_, M> {
    const fn require_hyp(&self) -> Result<()> {
        match self.mode {
            Mode::Hyp => Ok(()),
            Mode::Stage2 { .. } => Err(PageTableError::Unsupported),
        }
    }

    /// Map `[addr, addr + size)` to `[phys, phys + size)` with `prot`.
    ///
    /// Uses the largest blocks alignment allows. Mapping a range again with
    /// the same target and permissions is a no-op.
    ///
    /// # Errors
    /// - [`PageTableError::InvalidInput`]: `prot` lacks [`Prot::R`],
    ///   combines [`Prot::X`] with [`Prot::W`] or [`Prot::DEVICE`], the
    ///   range lies past the input space, or the output range reaches past
    ///   the 48-bit physical address space.
    /// - [`PageTableError::AlreadyMapped`]: part of the range maps elsewhere
    ///   or with other permissions.
    /// - [`PageTableError::NoMemory`]: a table page could not be allocated.
    /// - [`PageTableError::Unsupported`]: not a stage-1 table.
    pub fn hyp_map(
        &mut self,
        addr: u64,
        size: u64,
        phys: PhysicalAddress,
        prot: Prot,
    ) -> Result<()> {
        self.require_hyp()?;
        if !hyp_prot_valid(prot) {
            return Err(PageTableError::InvalidInput);
        }
        let (addr, size) = page_range(addr, size)?;
        let phys = output_range(phys, size)?;
        let mapper = Mapper::<M, dyn MmuHooks>::new(addr, phys, prot, Stage::Hyp, None, None);
        let mut walker = Walker::new(WalkFlags::LEAF, mapper);
        self.walk(addr, size, &mut walker)
    }

    /// Remove every mapping in `[addr, addr + size)`, returning the number of
    /// bytes that were mapped.
    ///
    /// Blocks reaching outside the range are split first. Tables the range
    /// covers entirely are freed once empty.
    ///
    /// # Errors
    /// - [`PageTableError::NoMemory`]: a block could not be split.
    /// - [`PageTableError::InvalidInput`]: range past the input space.
    /// - [`PageTableError::Unsupported`]: not a stage-1 table.
    pub fn hyp_unmap(&mut self, addr: u64, size: u64, hooks: &dyn MmuHooks) -> Result<u64> {
        self.require_hyp()?;
        let (addr, size) = page_range(addr, size)?;
        let mut walker = Walker::new(
            WalkFlags::LEAF | WalkFlags::TABLE_POST,
            Unmapper::new(hooks, false),
        );
        self.walk(addr, size, &mut walker)?;
        Ok(walker.into_visitor().unmapped())
    }
}

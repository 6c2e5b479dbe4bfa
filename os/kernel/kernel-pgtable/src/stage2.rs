//! # Stage-2 Operations
//!
//! Guest-physical (IPA) to host-physical mappings of one VM.
//!
//! | Operation | Allocates | TLB invalidation | Cache maintenance |
//! |:----------|:----------|:-----------------|:------------------|
//! | [`stage2_map`](PageTable::stage2_map) | yes | only when coalescing | – |
//! | [`stage2_set_owner`](PageTable::stage2_set_owner) | yes | per removed leaf | without FWB |
//! | [`stage2_unmap`](PageTable::stage2_unmap) | only to split | per removed entry | without FWB |
//! | [`stage2_wrprotect`](PageTable::stage2_wrprotect) | – | caller | – |
//! | [`stage2_mkyoung`](PageTable::stage2_mkyoung) | – | caller | – |
//! | [`stage2_mkold`](PageTable::stage2_mkold) | – | caller | – |
//! | [`stage2_relax_perms`](PageTable::stage2_relax_perms) | – | synchronous | – |
//! | [`stage2_flush`](PageTable::stage2_flush) | – | – | without FWB |
//!
//! "Caller" means the operation leaves possibly stale TLB entries behind and
//! the caller decides when to invalidate, typically once for a whole batch.

use crate::addresses::PhysicalAddress;
use crate::arch::{MmuHooks, Stage2Mmu};
use crate::level::Level;
use crate::mm::MmOps;
use crate::pte::{
    AF_BIT, OA_LIMIT, OwnerId, Prot, Pte, S2_WRITE_BIT, Stage, encode_invalid, encode_leaf,
    stage2_relax_bits,
};
use crate::split::{install_table, release_table, split_entry, subtree_matches};
use crate::table::PageTable;
use crate::unmap::Unmapper;
use crate::walker::{Visit, Visitor, WalkFlags, Walker};
use crate::{PAGE_SIZE, PageTableError, Result, align_down, output_range, page_range};
use core::fmt;
use log::{trace, warn};

/// A half-open range of input addresses, `[start, end)`.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct MemRange {
    pub start: u64,
    pub end: u64,
}

impl MemRange {
    #[inline]
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

impl fmt::Debug for MemRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// Where the mapping of a walk address points.
#[derive(Copy, Clone)]
struct Target {
    start: u64,
    phys: PhysicalAddress,
}

impl Target {
    /// Output address for input address `addr`, if a descriptor can encode it.
    fn phys_at(self, addr: u64) -> Option<PhysicalAddress> {
        self.phys
            .as_u64()
            .checked_add(addr - self.start)
            .filter(|&pa| pa < OA_LIMIT)
            .map(PhysicalAddress::new)
    }

    /// Output address the block containing `addr` at `level` would need to
    /// start at to translate `addr` like this target does.
    fn block_base(self, addr: u64, level: Level) -> Option<PhysicalAddress> {
        let base = align_down(addr, level.granule());
        self.phys
            .as_u64()
            .checked_add(addr - self.start)?
            .checked_sub(addr - base)
            .map(PhysicalAddress::new)
    }
}

/// Installs leaves, coalescing and allocating tables as needed.
pub(crate) struct Mapper<'c, 'h, M: MmOps, H: MmuHooks + ?Sized> {
    target: Target,
    prot: Prot,
    stage: Stage,
    cache: Option<&'c mut M::Cache>,
    hooks: Option<&'h H>,
}

impl<'c, 'h, M: MmOps, H: MmuHooks + ?Sized> Mapper<'c, 'h, M, H> {
    pub fn new(
        start: u64,
        phys: PhysicalAddress,
        prot: Prot,
        stage: Stage,
        cache: Option<&'c mut M::Cache>,
        hooks: Option<&'h H>,
    ) -> Self {
        Self {
            target: Target { start, phys },
            prot,
            stage,
            cache,
            hooks,
        }
    }

    fn overlap(&self, visit: &Visit<'_, M>) -> PageTableError {
        warn!(
            "{:?} map of {:#x} overlaps {} at {} ({})",
            self.stage,
            visit.addr(),
            visit.old(),
            visit.level(),
            visit.entry_base()
        );
        PageTableError::AlreadyMapped
    }

    /// Replace a table that already translates exactly like the new block.
    fn try_coalesce(&mut self, visit: &Visit<'_, M>) {
        let (Some(hooks), Some(child_level)) = (self.hooks, visit.level().next()) else {
            return;
        };
        let level = visit.level();
        let Some(phys) = self.target.phys_at(visit.addr()) else {
            return;
        };
        if !level.block_fits(visit.addr(), visit.end(), Some(phys.as_u64())) {
            return;
        }
        let block = encode_leaf(phys, level, self.prot, self.stage);
        let child = visit.old().output_address();
        if !subtree_matches(visit.mm(), child, child_level, block) {
            return;
        }
        visit.store(Pte::INVALID);
        hooks.tlb_invalidate_all();
        release_table(visit.mm(), child, child_level);
        visit.store(block);
        trace!("coalesced {level} table at {:#x} into block {block}", visit.addr());
    }

    fn map_leaf(&mut self, visit: &Visit<'_, M>) -> Result<()> {
        let old = visit.old();
        let level = visit.level();
        let addr = visit.addr();
        let phys = self.target.phys_at(addr).ok_or(PageTableError::InvalidInput)?;

        if level.block_fits(addr, visit.end(), Some(phys.as_u64())) {
            let new = encode_leaf(phys, level, self.prot, self.stage);
            if old.valid() {
                return if old.output_address() == new.output_address()
                    && old.prot_attrs() == new.prot_attrs()
                {
                    Ok(())
                } else {
                    Err(self.overlap(visit))
                };
            }
            visit.store(new);
            if !old.is_counted() {
                visit.mm().get_page(visit.table_page());
            }
            return Ok(());
        }

        if old.valid() {
            // A coarser block already covers part of the request.
            let same_target = self.target.block_base(addr, level) == Some(old.output_address());
            let same_prot =
                old.prot_attrs() == encode_leaf(phys, level, self.prot, self.stage).prot_attrs();
            return if same_target && same_prot {
                Ok(())
            } else {
                Err(self.overlap(visit))
            };
        }

        install_table(visit, self.cache.as_deref_mut())
    }
}

impl<M: MmOps, H: MmuHooks + ?Sized> Visitor<M> for Mapper<'_, '_, M, H> {
    fn visit(&mut self, visit: &Visit<'_, M>) -> Result<()> {
        if visit.kind() == WalkFlags::TABLE_PRE {
            self.try_coalesce(visit);
            return Ok(());
        }
        self.map_leaf(visit)
    }
}

/// Replaces entries with owner annotations.
struct Annotator<'c, 'h, M: MmOps> {
    annotation: Pte,
    clean_dcache: bool,
    cache: Option<&'c mut M::Cache>,
    mmu: &'h dyn Stage2Mmu,
}

impl<M: MmOps> Visitor<M> for Annotator<'_, '_, M> {
    fn visit(&mut self, visit: &Visit<'_, M>) -> Result<()> {
        let old = visit.old();
        let level = visit.level();
        if !level.block_fits(visit.addr(), visit.end(), None) {
            return split_entry(visit, self.cache.as_deref_mut(), self.mmu);
        }
        if old == self.annotation {
            return Ok(());
        }
        if old.valid() {
            visit.store(Pte::INVALID);
            self.mmu.tlb_invalidate_ipa(visit.entry_base(), level);
            if self.clean_dcache && old.is_cacheable(Stage::Stage2) {
                self.mmu.dcache_clean_inval_poc(old.output_address(), level.granule());
            }
        } else if !old.is_counted() {
            visit.mm().get_page(visit.table_page());
        }
        visit.store(self.annotation);
        Ok(())
    }
}

/// Sets and clears attribute bits on valid leaves, remembering the last one seen.
struct AttrUpdater {
    set: u64,
    clear: u64,
    prior: Pte,
    level: Option<Level>,
}

impl AttrUpdater {
    const fn new(set: u64, clear: u64) -> Self {
        Self {
            set,
            clear,
            prior: Pte::INVALID,
            level: None,
        }
    }
}

impl<M: MmOps> Visitor<M> for AttrUpdater {
    fn visit(&mut self, visit: &Visit<'_, M>) -> Result<()> {
        let old = visit.old();
        if !old.is_leaf(visit.level()) {
            return Ok(());
        }
        self.prior = old;
        self.level = Some(visit.level());
        let new = Pte::from_bits((old.into_bits() & !self.clear) | self.set);
        if new != old {
            visit.store(new);
        }
        Ok(())
    }
}

impl<M: MmOps> PageTable<'_, M> {
    /// Map `[addr, addr + size)` to `[phys, phys + size)` with `prot`.
    ///
    /// Every part of the range is mapped with the coarsest block its
    /// alignment allows. Tables whose contents already agree with such a
    /// block are collapsed into it. Pages for new tables are drawn through
    /// `cache`.
    ///
    /// Mapping a range again with the same target and permissions is a
    /// no-op. Permission upgrades go through
    /// [`stage2_relax_perms`](Self::stage2_relax_perms).
    ///
    /// # Errors
    /// - [`PageTableError::InvalidInput`]: executable device memory, a
    ///   non-identity mapping in an [`IDMAP`](crate::Stage2Flags::IDMAP)
    ///   table, a range past the IPA space, or an output range reaching
    ///   past the 48-bit physical address space.
    /// - [`PageTableError::AlreadyMapped`]: part of the range maps elsewhere
    ///   or with other permissions.
    /// - [`PageTableError::NoMemory`]: a table page could not be allocated.
    /// - [`PageTableError::Unsupported`]: not a stage-2 table.
    pub fn stage2_map(
        &mut self,
        addr: u64,
        size: u64,
        phys: PhysicalAddress,
        prot: Prot,
        cache: Option<&mut M::Cache>,
    ) -> Result<()> {
        let (mmu, flags) = self.stage2_mode()?;
        if prot.contains(Prot::DEVICE | Prot::X) {
            return Err(PageTableError::InvalidInput);
        }
        let (addr, size) = page_range(addr, size)?;
        let phys = output_range(phys, size)?;
        if flags.contains(crate::Stage2Flags::IDMAP) && phys.as_u64() != addr {
            return Err(PageTableError::InvalidInput);
        }
        let mapper = Mapper::<M, _>::new(addr, phys, prot, Stage::Stage2, cache, Some(mmu));
        let mut walker = Walker::new(WalkFlags::LEAF | WalkFlags::TABLE_PRE, mapper);
        self.walk(addr, size, &mut walker)
    }

    /// Mark `[addr, addr + size)` as owned by `owner`, removing any mapping.
    ///
    /// Owner [`OwnerId::DEFAULT`] is the same as [`stage2_unmap`](Self::stage2_unmap).
    ///
    /// # Errors
    /// - [`PageTableError::NoMemory`]: a partially covered entry could not be split.
    /// - [`PageTableError::InvalidInput`]: range past the IPA space.
    /// - [`PageTableError::Unsupported`]: not a stage-2 table.
    pub fn stage2_set_owner(
        &mut self,
        addr: u64,
        size: u64,
        cache: Option<&mut M::Cache>,
        owner: OwnerId,
    ) -> Result<()> {
        let (mmu, _) = self.stage2_mode()?;
        if owner.is_default() {
            return self.stage2_unmap(addr, size);
        }
        let (addr, size) = page_range(addr, size)?;
        let annotator = Annotator::<M> {
            annotation: encode_invalid(owner),
            clean_dcache: !self.has_fwb(),
            cache,
            mmu,
        };
        let mut walker = Walker::new(WalkFlags::LEAF, annotator);
        self.walk(addr, size, &mut walker)
    }

    /// Remove every mapping and owner annotation in `[addr, addr + size)`.
    ///
    /// Unmapping an already empty range does nothing.
    ///
    /// # Errors
    /// - [`PageTableError::NoMemory`]: a partially covered block could not be split.
    /// - [`PageTableError::InvalidInput`]: range past the IPA space.
    /// - [`PageTableError::Unsupported`]: not a stage-2 table.
    pub fn stage2_unmap(&mut self, addr: u64, size: u64) -> Result<()> {
        let (mmu, _) = self.stage2_mode()?;
        let (addr, size) = page_range(addr, size)?;
        let unmapper = Unmapper::new(mmu, !self.has_fwb());
        let mut walker = Walker::new(WalkFlags::LEAF | WalkFlags::TABLE_POST, unmapper);
        self.walk(addr, size, &mut walker)
    }

    /// Remove write permission from every leaf touched by `[addr, addr + size)`.
    ///
    /// Blocks reaching outside the range are write-protected as a whole.
    /// The TLBs are not invalidated.
    ///
    /// # Errors
    /// [`PageTableError::InvalidInput`] or [`PageTableError::Unsupported`].
    pub fn stage2_wrprotect(&mut self, addr: u64, size: u64) -> Result<()> {
        self.stage2_mode()?;
        let (addr, size) = page_range(addr, size)?;
        let mut walker = Walker::new(WalkFlags::LEAF, AttrUpdater::new(0, S2_WRITE_BIT));
        self.walk(addr, size, &mut walker)
    }

    /// Set the access flag on the leaf translating `addr`.
    ///
    /// Returns the entry as it was before, or [`Pte::INVALID`] if `addr` is
    /// not mapped. The TLBs are not invalidated.
    ///
    /// # Errors
    /// [`PageTableError::InvalidInput`] or [`PageTableError::Unsupported`].
    pub fn stage2_mkyoung(&mut self, addr: u64) -> Result<Pte> {
        self.update_leaf(addr, AttrUpdater::new(AF_BIT, 0)).map(|u| u.prior)
    }

    /// Clear the access flag on the leaf translating `addr`.
    ///
    /// Returns the entry as it was before, or [`Pte::INVALID`] if `addr` is
    /// not mapped. The TLBs are not invalidated; the caller batches that.
    ///
    /// # Errors
    /// [`PageTableError::InvalidInput`] or [`PageTableError::Unsupported`].
    pub fn stage2_mkold(&mut self, addr: u64) -> Result<Pte> {
        self.update_leaf(addr, AttrUpdater::new(0, AF_BIT)).map(|u| u.prior)
    }

    /// Add the permissions in `prot` to the leaf translating `addr`.
    ///
    /// Permissions already granted are never removed. The stale translation
    /// is invalidated before returning.
    ///
    /// # Errors
    /// - [`PageTableError::NotMapped`]: no valid leaf translates `addr`.
    /// - [`PageTableError::InvalidInput`] or [`PageTableError::Unsupported`].
    pub fn stage2_relax_perms(&mut self, addr: u64, prot: Prot) -> Result<()> {
        let (mmu, _) = self.stage2_mode()?;
        let (set, clear) = stage2_relax_bits(prot);
        let updater = self.update_leaf(addr, AttrUpdater::new(set, clear))?;
        let level = updater.level.ok_or(PageTableError::NotMapped)?;
        mmu.tlb_invalidate_ipa(align_down(addr, level.granule()), level);
        Ok(())
    }

    /// Whether the leaf translating `addr` has its access flag set.
    ///
    /// # Errors
    /// [`PageTableError::InvalidInput`] or [`PageTableError::Unsupported`].
    pub fn stage2_is_young(&self, addr: u64) -> Result<bool> {
        self.stage2_mode()?;
        let (pte, level) = self.get_leaf(addr)?;
        Ok(pte.is_leaf(level) && pte.young())
    }

    /// Clean and invalidate the data cache for every cacheable mapping
    /// touched by `[addr, addr + size)`.
    ///
    /// A no-op when the table uses forced write-back.
    ///
    /// # Errors
    /// [`PageTableError::InvalidInput`] or [`PageTableError::Unsupported`].
    pub fn stage2_flush(&self, addr: u64, size: u64) -> Result<()> {
        let (mmu, _) = self.stage2_mode()?;
        if self.has_fwb() {
            return Ok(());
        }
        let (addr, size) = page_range(addr, size)?;
        let mut walker = Walker::new(WalkFlags::LEAF, |v: &Visit<'_, M>| -> Result<()> {
            let old = v.old();
            if old.is_leaf(v.level()) && old.is_cacheable(Stage::Stage2) {
                mmu.dcache_clean_inval_poc(old.output_address(), v.level().granule());
            }
            Ok(())
        });
        self.walk_shared(addr, size, &mut walker)
    }

    /// Narrow `range` to the largest span around `addr` that could be mapped
    /// with `prot` without conflicting with anything already in the table.
    ///
    /// An address is compatible if it is unmapped and owned by the default
    /// owner, or mapped by a leaf whose permissions and attributes are exactly
    /// those `prot` would produce. The result is the contiguous run of
    /// compatible addresses containing `addr`, clipped to `range`.
    ///
    /// # Errors
    /// - [`PageTableError::InvalidInput`]: `addr` outside `range` or the IPA
    ///   space, or executable device memory requested.
    /// - [`PageTableError::AlreadyMapped`]: `addr` itself is incompatible.
    /// - [`PageTableError::Unsupported`]: not a stage-2 table.
    pub fn stage2_find_range(&self, addr: u64, prot: Prot, range: &mut MemRange) -> Result<()> {
        self.stage2_mode()?;
        if prot.contains(Prot::DEVICE | Prot::X) || !range.contains(addr) {
            return Err(PageTableError::InvalidInput);
        }
        let attrs =
            encode_leaf(PhysicalAddress::zero(), Level::LAST, prot, Stage::Stage2).prot_attrs();
        let compatible = |a: u64| -> Result<(bool, Level)> {
            let (pte, level) = self.get_leaf(a)?;
            let ok = if pte.valid() {
                pte.is_leaf(level) && pte.prot_attrs() == attrs
            } else {
                pte.owner().is_default()
            };
            Ok((ok, level))
        };

        let (ok, level) = compatible(addr)?;
        if !ok {
            return Err(PageTableError::AlreadyMapped);
        }
        let limit = range.end.min(1 << self.ia_bits());

        let mut lo = align_down(addr, level.granule());
        while lo > range.start {
            let (ok, level) = compatible(lo - 1)?;
            if !ok {
                break;
            }
            lo = align_down(lo - 1, level.granule());
        }

        let mut hi = align_down(addr, level.granule()) + level.granule();
        while hi < limit {
            let (ok, level) = compatible(hi)?;
            if !ok {
                break;
            }
            hi = align_down(hi, level.granule()) + level.granule();
        }

        *range = MemRange::new(lo.max(range.start), hi.min(limit));
        Ok(())
    }

    fn update_leaf(&mut self, addr: u64, updater: AttrUpdater) -> Result<AttrUpdater> {
        self.stage2_mode()?;
        let mut walker = Walker::new(WalkFlags::LEAF, updater);
        self.walk(addr, PAGE_SIZE, &mut walker)?;
        Ok(walker.into_visitor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchCapabilities, Stage2Flags};
    use crate::arena::{ArenaCache, ArenaMmOps};
    use core::cell::{Cell, RefCell};

    #[derive(Default)]
    struct Mmu {
        fwb: bool,
        invalidations: RefCell<Vec<(u64, u8)>>,
        full_flushes: Cell<usize>,
        cleans: RefCell<Vec<(u64, u64)>>,
    }

    impl ArchCapabilities for Mmu {
        fn ipa_bits(&self) -> u32 {
            40
        }

        fn has_stage2_fwb(&self) -> bool {
            self.fwb
        }
    }

    impl MmuHooks for Mmu {
        fn tlb_invalidate_ipa(&self, addr: u64, level: Level) {
            self.invalidations.borrow_mut().push((addr, level.as_u8()));
        }

        fn tlb_invalidate_all(&self) {
            self.full_flushes.set(self.full_flushes.get() + 1);
        }

        fn dcache_clean_inval_poc(&self, pa: PhysicalAddress, size: u64) {
            self.cleans.borrow_mut().push((pa.as_u64(), size));
        }
    }

    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn map_prefers_blocks() {
        let mm = ArenaMmOps::new(32);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        // 4 KiB head, one 2 MiB block, 4 KiB tail.
        let phys = pa(0x8000_0000 + 2 * MIB - 0x1000);
        pgt.stage2_map(2 * MIB - 0x1000, 2 * MIB + 0x2000, phys, Prot::RW, None)
            .unwrap();
        assert_eq!(pgt.get_leaf(2 * MIB - 0x1000).unwrap().1, Level::LAST);
        assert_eq!(pgt.get_leaf(2 * MIB).unwrap().1.as_u8(), 2);
        assert_eq!(pgt.get_leaf(3 * MIB).unwrap().0.output_address(), pa(0x8000_0000 + 2 * MIB));
        assert_eq!(pgt.get_leaf(4 * MIB).unwrap().1, Level::LAST);
        assert_eq!(pgt.get_leaf(4 * MIB + 0x1000).unwrap().0, Pte::INVALID);
        assert!(mmu.invalidations.borrow().is_empty());
    }

    #[test]
    fn map_rejects_executable_device_memory() {
        let mm = ArenaMmOps::new(8);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        assert_eq!(
            pgt.stage2_map(0, 0x1000, pa(0x1000), Prot::RX | Prot::DEVICE, None),
            Err(PageTableError::InvalidInput)
        );
        pgt.stage2_map(0, 0x1000, pa(0x1000), Prot::RW | Prot::DEVICE, None).unwrap();
    }

    #[test]
    fn map_rejects_unencodable_output_addresses() {
        let mm = ArenaMmOps::new(8);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        for phys in [1 << 48, (1 << 50) | 0x5000] {
            assert_eq!(
                pgt.stage2_map(0x1000, 0x1000, pa(phys), Prot::RW, None),
                Err(PageTableError::InvalidInput)
            );
        }
        // The last page below the limit is fine, the one after it is not.
        assert_eq!(
            pgt.stage2_map(0x1000, 0x2000, pa((1 << 48) - 0x1000), Prot::RW, None),
            Err(PageTableError::InvalidInput)
        );
        assert_eq!(mm.pages_in_use(), 2);
        assert_eq!(pgt.get_leaf(0x1000).unwrap().0, Pte::INVALID);

        pgt.stage2_map(0x1000, 0x1000, pa((1 << 48) - 0x1000), Prot::RW, None)
            .unwrap();
        assert_eq!(pgt.get_leaf(0x1000).unwrap().0.output_address(), pa((1 << 48) - 0x1000));
    }

    #[test]
    fn identity_tables_reject_other_targets() {
        let mm = ArenaMmOps::new(8);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::IDMAP).unwrap();
        assert_eq!(
            pgt.stage2_map(0x1000, 0x1000, pa(0x2000), Prot::R, None),
            Err(PageTableError::InvalidInput)
        );
        pgt.stage2_map(0x1000, 0x1000, pa(0x1000), Prot::R, None).unwrap();
    }

    #[test]
    fn remap_identical_is_noop_and_different_is_rejected() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        pgt.stage2_map(0x1000, 0x1000, pa(0x9000), Prot::RW, None).unwrap();
        let pages = mm.pages_in_use();
        pgt.stage2_map(0x1000, 0x1000, pa(0x9000), Prot::RW, None).unwrap();
        assert_eq!(mm.pages_in_use(), pages);
        assert_eq!(
            pgt.stage2_map(0x1000, 0x1000, pa(0xA000), Prot::RW, None),
            Err(PageTableError::AlreadyMapped)
        );
        assert_eq!(
            pgt.stage2_map(0x1000, 0x1000, pa(0x9000), Prot::R, None),
            Err(PageTableError::AlreadyMapped)
        );
    }

    #[test]
    fn map_inside_identical_block_is_noop() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        pgt.stage2_map(2 * MIB, 2 * MIB, pa(0x4020_0000), Prot::RW, None).unwrap();
        let pages = mm.pages_in_use();
        pgt.stage2_map(2 * MIB + 0x3000, 0x1000, pa(0x4020_3000), Prot::RW, None).unwrap();
        assert_eq!(mm.pages_in_use(), pages);
        assert_eq!(pgt.get_leaf(2 * MIB + 0x3000).unwrap().1.as_u8(), 2);
        assert_eq!(
            pgt.stage2_map(2 * MIB + 0x3000, 0x1000, pa(0x5000_0000), Prot::RW, None),
            Err(PageTableError::AlreadyMapped)
        );
    }

    #[test]
    fn compatible_table_is_coalesced() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        pgt.stage2_map(2 * MIB + 0x5000, 0x2000, pa(0x4020_5000), Prot::RW, None).unwrap();
        let with_table = mm.pages_in_use();
        pgt.stage2_map(2 * MIB, 2 * MIB, pa(0x4020_0000), Prot::RW, None).unwrap();
        assert_eq!(mm.pages_in_use(), with_table - 1);
        assert_eq!(mmu.full_flushes.get(), 1);
        let (pte, level) = pgt.get_leaf(2 * MIB + 0x6000).unwrap();
        assert_eq!(level.as_u8(), 2);
        assert_eq!(pte.output_address(), pa(0x4020_0000));
    }

    #[test]
    fn incompatible_table_is_not_coalesced() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        pgt.stage2_map(2 * MIB + 0x5000, 0x1000, pa(0x7777_7000), Prot::RW, None).unwrap();
        assert_eq!(
            pgt.stage2_map(2 * MIB, 2 * MIB, pa(0x4020_0000), Prot::RW, None),
            Err(PageTableError::AlreadyMapped)
        );
        assert_eq!(mmu.full_flushes.get(), 0);
        // Pages before the conflict were filled in at page granularity.
        assert_eq!(pgt.get_leaf(2 * MIB).unwrap().0.output_address(), pa(0x4020_0000));
        assert_eq!(pgt.get_leaf(2 * MIB + 0x5000).unwrap().0.output_address(), pa(0x7777_7000));
    }

    #[test]
    fn map_runs_out_of_cache() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        let mut cache = ArenaCache::with_pages(1);
        assert_eq!(
            pgt.stage2_map(0x1000, 0x1000, pa(0x1000), Prot::R, Some(&mut cache)),
            Err(PageTableError::NoMemory)
        );
        let mut cache = ArenaCache::with_pages(2);
        // The level-2 table from the failed attempt stays; one more page is needed.
        pgt.stage2_map(0x1000, 0x1000, pa(0x1000), Prot::R, Some(&mut cache)).unwrap();
        assert_eq!(cache.remaining(), 1);
    }

    #[test]
    fn unmap_splits_partially_covered_block() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        pgt.stage2_map(2 * MIB, 2 * MIB, pa(0x4020_0000), Prot::RW, None).unwrap();
        pgt.stage2_unmap(2 * MIB + 0x1000, 0x1000).unwrap();

        assert_eq!(pgt.get_leaf(2 * MIB + 0x1000).unwrap().0, Pte::INVALID);
        let (pte, level) = pgt.get_leaf(2 * MIB + 0x2000).unwrap();
        assert_eq!(level, Level::LAST);
        assert_eq!(pte.output_address(), pa(0x4020_2000));
        assert_eq!(pte.prot(Stage::Stage2), Prot::RW);
        // Block split, then the page itself.
        assert_eq!(*mmu.invalidations.borrow(), [(2 * MIB, 2), (2 * MIB + 0x1000, 3)]);
        assert_eq!(*mmu.cleans.borrow(), [(0x4020_1000, 0x1000)]);
    }

    #[test]
    fn unmap_frees_fully_covered_tables() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        let root_pages = mm.pages_in_use();
        pgt.stage2_map(GIB + 0x1000, 0x1000, pa(0x1000), Prot::R, None).unwrap();
        assert_eq!(mm.pages_in_use(), root_pages + 2);
        pgt.stage2_unmap(GIB, GIB).unwrap();
        assert_eq!(mm.pages_in_use(), root_pages);
    }

    #[test]
    fn unmap_without_fwb_cleans_only_cacheable_memory() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        pgt.stage2_map(0x1000, 0x1000, pa(0x1000), Prot::RW, None).unwrap();
        pgt.stage2_map(0x2000, 0x1000, pa(0x900_0000), Prot::RW | Prot::DEVICE, None).unwrap();
        pgt.stage2_unmap(0, 0x4000).unwrap();
        assert_eq!(*mmu.cleans.borrow(), [(0x1000, 0x1000)]);
    }

    #[test]
    fn fwb_skips_cache_maintenance_unless_disabled() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu { fwb: true, ..Mmu::default() };

        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        pgt.stage2_map(0x1000, 0x1000, pa(0x1000), Prot::RW, None).unwrap();
        pgt.stage2_flush(0, 0x4000).unwrap();
        pgt.stage2_unmap(0x1000, 0x1000).unwrap();
        assert!(mmu.cleans.borrow().is_empty());
        drop(pgt);

        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::NO_FWB).unwrap();
        pgt.stage2_map(0x1000, 0x1000, pa(0x1000), Prot::RW, None).unwrap();
        pgt.stage2_flush(0, 0x4000).unwrap();
        assert_eq!(*mmu.cleans.borrow(), [(0x1000, 0x1000)]);
    }

    #[test]
    fn set_owner_annotates_and_unmaps() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        let owner = OwnerId::new(3).unwrap();
        pgt.stage2_map(0x1000, 0x1000, pa(0x1000), Prot::RW, None).unwrap();
        pgt.stage2_set_owner(0, 4 * 0x1000, None, owner).unwrap();

        for addr in [0, 0x1000, 0x3000] {
            let (pte, _) = pgt.get_leaf(addr).unwrap();
            assert!(!pte.valid());
            assert_eq!(pte.owner(), owner);
        }
        assert_eq!(*mmu.invalidations.borrow(), [(0x1000, 3)]);
        assert_eq!(pgt.get_leaf(0x4000).unwrap().0.owner(), OwnerId::DEFAULT);

        pgt.stage2_set_owner(0, 4 * 0x1000, None, OwnerId::DEFAULT).unwrap();
        assert_eq!(pgt.get_leaf(0x1000).unwrap().0, Pte::INVALID);
    }

    #[test]
    fn set_owner_uses_blocks_and_splits_them() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        let owner = OwnerId::new(7).unwrap();
        pgt.stage2_set_owner(2 * MIB, 2 * MIB, None, owner).unwrap();
        assert_eq!(pgt.get_leaf(2 * MIB).unwrap().1.as_u8(), 2);

        pgt.stage2_unmap(2 * MIB, 0x1000).unwrap();
        assert_eq!(pgt.get_leaf(2 * MIB).unwrap().0, Pte::INVALID);
        let (pte, level) = pgt.get_leaf(2 * MIB + 0x1000).unwrap();
        assert_eq!((pte.owner(), level), (owner, Level::LAST));
    }

    #[test]
    fn owner_annotation_is_kept_under_new_tables() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        let owner = OwnerId::new(1).unwrap();
        pgt.stage2_set_owner(2 * MIB, 2 * MIB, None, owner).unwrap();
        pgt.stage2_map(2 * MIB, 0x1000, pa(0x1000), Prot::R, None).unwrap();
        assert!(pgt.get_leaf(2 * MIB).unwrap().0.valid());
        assert_eq!(pgt.get_leaf(2 * MIB + 0x1000).unwrap().0.owner(), owner);
    }

    #[test]
    fn wrprotect_and_relax() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        pgt.stage2_map(0x1000, 0x2000, pa(0x1000), Prot::RW, None).unwrap();
        pgt.stage2_wrprotect(0x1000, 0x2000).unwrap();
        assert!(mmu.invalidations.borrow().is_empty());
        assert_eq!(pgt.get_leaf(0x2000).unwrap().0.prot(Stage::Stage2), Prot::R);

        pgt.stage2_relax_perms(0x2000, Prot::W | Prot::X).unwrap();
        assert_eq!(pgt.get_leaf(0x2000).unwrap().0.prot(Stage::Stage2), Prot::RWX);
        assert_eq!(pgt.get_leaf(0x1000).unwrap().0.prot(Stage::Stage2), Prot::R);
        assert_eq!(*mmu.invalidations.borrow(), [(0x2000, 3)]);

        // Relaxing never takes permissions away.
        pgt.stage2_relax_perms(0x2000, Prot::R).unwrap();
        assert_eq!(pgt.get_leaf(0x2000).unwrap().0.prot(Stage::Stage2), Prot::RWX);
        assert_eq!(pgt.stage2_relax_perms(0x10_0000, Prot::R), Err(PageTableError::NotMapped));
    }

    #[test]
    fn access_flag_aging() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        pgt.stage2_map(0x1000, 0x1000, pa(0x1000), Prot::RW, None).unwrap();
        assert!(pgt.stage2_is_young(0x1000).unwrap());

        let prior = pgt.stage2_mkold(0x1000).unwrap();
        assert!(prior.young());
        assert!(!pgt.stage2_is_young(0x1000).unwrap());
        let prior = pgt.stage2_mkold(0x1000).unwrap();
        assert!(prior.valid() && !prior.young());

        let prior = pgt.stage2_mkyoung(0x1000).unwrap();
        assert!(!prior.young());
        assert!(pgt.stage2_is_young(0x1000).unwrap());

        assert_eq!(pgt.stage2_mkyoung(0x5000).unwrap(), Pte::INVALID);
        assert!(!pgt.stage2_is_young(0x5000).unwrap());
        assert!(mmu.invalidations.borrow().is_empty());
    }

    #[test]
    fn stage2_operations_reject_stage1_tables() {
        let mm = ArenaMmOps::new(4);
        let mut pgt = PageTable::hyp_init(40, &mm).unwrap();
        assert_eq!(
            pgt.stage2_map(0, 0x1000, pa(0), Prot::R, None),
            Err(PageTableError::Unsupported)
        );
        assert_eq!(pgt.stage2_unmap(0, 0x1000), Err(PageTableError::Unsupported));
        assert_eq!(pgt.stage2_mkyoung(0), Err(PageTableError::Unsupported));
        assert_eq!(pgt.stage2_is_young(0), Err(PageTableError::Unsupported));
        let mut range = MemRange::new(0, 0x1000);
        assert_eq!(pgt.stage2_find_range(0, Prot::R, &mut range), Err(PageTableError::Unsupported));
    }

    #[test]
    fn find_range_on_empty_table_keeps_bounds() {
        let mm = ArenaMmOps::new(4);
        let mmu = Mmu::default();
        let pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        let mut range = MemRange::new(0x1000, 3 * GIB + 0x5000);
        pgt.stage2_find_range(GIB, Prot::RW, &mut range).unwrap();
        assert_eq!(range, MemRange::new(0x1000, 3 * GIB + 0x5000));

        let mut range = MemRange::new(0, 0x1000);
        assert_eq!(
            pgt.stage2_find_range(0x1000, Prot::RW, &mut range),
            Err(PageTableError::InvalidInput)
        );
    }

    #[test]
    fn find_range_stops_at_conflicts() {
        let mm = ArenaMmOps::new(16);
        let mmu = Mmu::default();
        let mut pgt = PageTable::stage2_init(&mmu, &mm, Stage2Flags::empty()).unwrap();
        pgt.stage2_map(0x3000, 0x1000, pa(0x3000), Prot::R, None).unwrap();
        pgt.stage2_map(0x5000, 0x1000, pa(0x5000), Prot::RW, None).unwrap();
        pgt.stage2_set_owner(0x9000, 0x1000, None, OwnerId::new(2).unwrap()).unwrap();

        let mut range = MemRange::new(0, 2 * MIB);
        pgt.stage2_find_range(0x6000, Prot::RW, &mut range).unwrap();
        assert_eq!(range, MemRange::new(0x4000, 0x9000));

        let mut range = MemRange::new(0, 2 * MIB);
        assert_eq!(
            pgt.stage2_find_range(0x3000, Prot::RW, &mut range),
            Err(PageTableError::AlreadyMapped)
        );
    }
}

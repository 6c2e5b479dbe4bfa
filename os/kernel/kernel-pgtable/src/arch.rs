//! # Architecture Hooks
//!
//! CPU feature queries and the maintenance operations the page-table code
//! must trigger but cannot perform itself. A stage-2 table keeps a reference
//! to one [`Stage2Mmu`] for its whole life; nothing here is global.

use crate::addresses::PhysicalAddress;
use crate::level::Level;

/// Capabilities of the CPU and of the VM's stage-2 configuration.
pub trait ArchCapabilities {
    /// Size of the IPA space translated by this MMU, in bits.
    fn ipa_bits(&self) -> u32;

    /// Whether stage-2 forced write-back is implemented, in which case guest
    /// accesses are always coherent and no cache maintenance is needed.
    fn has_stage2_fwb(&self) -> bool;
}

/// TLB and data-cache maintenance.
pub trait MmuHooks {
    /// Invalidate every TLB entry translating `addr`, which was cached from an
    /// entry at `level`. Must be complete when the call returns.
    fn tlb_invalidate_ipa(&self, addr: u64, level: Level);

    /// Invalidate every TLB and walk-cache entry of this translation regime.
    ///
    /// Used when a whole subtree is unlinked at once.
    fn tlb_invalidate_all(&self);

    /// Clean and invalidate `[pa, pa + size)` to the point of coherency.
    fn dcache_clean_inval_poc(&self, pa: PhysicalAddress, size: u64);
}

/// Everything a stage-2 table needs from its VM's MMU.
pub trait Stage2Mmu: ArchCapabilities + MmuHooks {}

impl<T: ArchCapabilities + MmuHooks + ?Sized> Stage2Mmu for T {}

bitflags::bitflags! {
    /// Stage-2 table configuration.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
    pub struct Stage2Flags: u32 {
        /// Do not use forced write-back even if the CPU supports it.
        const NO_FWB = 1 << 0;
        /// Identity map: every mapping must have `phys == addr`.
        const IDMAP  = 1 << 1;
    }
}

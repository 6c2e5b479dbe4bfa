//! # Page-Table Lifecycle
//!
//! A [`PageTable`] owns its root and every table page hanging off it. Leaf
//! targets are not owned; they belong to whoever asked for the mapping.
//!
//! Mutating operations take `&mut self`, so the borrow checker serializes
//! them. Hardware (or any other observer reading the raw table memory) may
//! walk the tree at any time; it only ever sees whole entries.

use crate::addresses::PhysicalAddress;
use crate::arch::{Stage2Flags, Stage2Mmu};
use crate::level::{Level, PTES_PER_TABLE, hyp_start_level, root_entries, stage2_start_level};
use crate::mm::MmOps;
use crate::pte::{Pte, Stage};
use crate::walker::{Geometry, Visit, Visitor, WalkFlags, Walker, walk};
use crate::{PAGE_SIZE, PageTableError, Result};
use core::fmt;
use log::debug;

/// Smallest supported stage-1 input space.
const HYP_MIN_IA_BITS: u32 = 13;

/// Smallest supported stage-2 IPA space.
const STAGE2_MIN_IA_BITS: u32 = 32;

/// Largest input space of either stage.
const MAX_IA_BITS: u32 = 48;

/// Translation regime of a table, with what that regime needs.
#[derive(Copy, Clone)]
pub(crate) enum Mode<'a> {
    Hyp,
    Stage2 {
        mmu: &'a dyn Stage2Mmu,
        flags: Stage2Flags,
    },
}

/// A stage-1 or stage-2 translation tree.
pub struct PageTable<'a, M: MmOps> {
    pub(crate) geo: Geometry,
    pub(crate) mm: &'a M,
    pub(crate) mode: Mode<'a>,
}

impl<'a, M: MmOps> PageTable<'a, M> {
    /// Create an empty stage-1 table covering `ia_bits` of hypervisor VA space.
    ///
    /// # Errors
    /// - [`PageTableError::Unsupported`] if `ia_bits` is outside `13..=48`.
    /// - [`PageTableError::NoMemory`] if the root page cannot be allocated.
    pub fn hyp_init(ia_bits: u32, mm: &'a M) -> Result<Self> {
        if !(HYP_MIN_IA_BITS..=MAX_IA_BITS).contains(&ia_bits) {
            return Err(PageTableError::Unsupported);
        }
        let start_level = hyp_start_level(ia_bits);
        let pgd = mm.zalloc_page(None).ok_or(PageTableError::NoMemory)?.into_linked();
        debug!("stage-1 table at {pgd}: {ia_bits} VA bits, start level {start_level}");
        Ok(Self {
            geo: Geometry {
                ia_bits,
                start_level,
                pgd,
                stage: Stage::Hyp,
            },
            mm,
            mode: Mode::Hyp,
        })
    }

    /// Create an empty stage-2 table for the VM behind `mmu`.
    ///
    /// The IPA size is taken from
    /// [`ArchCapabilities::ipa_bits`](crate::ArchCapabilities::ipa_bits);
    /// the root may span several concatenated pages.
    ///
    /// # Errors
    /// - [`PageTableError::Unsupported`] if the IPA size is outside `32..=48`.
    /// - [`PageTableError::NoMemory`] if the root cannot be allocated.
    pub fn stage2_init(mmu: &'a dyn Stage2Mmu, mm: &'a M, flags: Stage2Flags) -> Result<Self> {
        let ia_bits = mmu.ipa_bits();
        let size = Self::stage2_pgd_size(ia_bits)?;
        let start_level = stage2_start_level(ia_bits);
        let pgd = mm.zalloc_pages_exact(size).ok_or(PageTableError::NoMemory)?;
        debug!(
            "stage-2 table at {pgd}: {ia_bits}-bit IPA, start {start_level}, {size}B, {flags:?}"
        );
        Ok(Self {
            geo: Geometry {
                ia_bits,
                start_level,
                pgd,
                stage: Stage::Stage2,
            },
            mm,
            mode: Mode::Stage2 { mmu, flags },
        })
    }

    /// Size in bytes of the (possibly concatenated) stage-2 root for `ia_bits`.
    ///
    /// # Errors
    /// [`PageTableError::Unsupported`] if `ia_bits` is outside `32..=48`.
    pub const fn stage2_pgd_size(ia_bits: u32) -> Result<usize> {
        if ia_bits < STAGE2_MIN_IA_BITS || ia_bits > MAX_IA_BITS {
            return Err(PageTableError::Unsupported);
        }
        let entries = root_entries(ia_bits, stage2_start_level(ia_bits));
        Ok(entries.div_ceil(PTES_PER_TABLE) * PAGE_SIZE as usize)
    }

    /// Tear the table down, returning every table page to [`MmOps`].
    ///
    /// No TLB maintenance is performed: the table must no longer be in use
    /// by any CPU. Dropping the table has the same effect.
    pub fn destroy(self) {
        drop(self);
    }

    #[inline]
    #[must_use]
    pub const fn ia_bits(&self) -> u32 {
        self.geo.ia_bits
    }

    #[inline]
    #[must_use]
    pub const fn start_level(&self) -> Level {
        self.geo.start_level
    }

    /// Physical address of the root table.
    #[inline]
    #[must_use]
    pub const fn pgd(&self) -> PhysicalAddress {
        self.geo.pgd
    }

    #[inline]
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.geo.stage
    }

    /// Run `walker` over `[addr, addr + size)`.
    ///
    /// The visitor may modify entries. It is responsible for keeping
    /// reference counts and TLBs consistent with what it does.
    ///
    /// # Errors
    /// [`PageTableError::InvalidInput`] for a range past the input space, or
    /// whatever the visitor returns.
    pub fn walk<V: Visitor<M>>(
        &mut self,
        addr: u64,
        size: u64,
        walker: &mut Walker<V>,
    ) -> Result<()> {
        walk(&self.geo, self.mm, addr, size, walker)
    }

    /// Walk without exclusive access; the visitor must not modify entries.
    pub(crate) fn walk_shared<V: Visitor<M>>(
        &self,
        addr: u64,
        size: u64,
        walker: &mut Walker<V>,
    ) -> Result<()> {
        walk(&self.geo, self.mm, addr, size, walker)
    }

    /// The entry a hardware walk of `addr` ends at, and its level.
    ///
    /// The entry is a leaf, an invalid entry, or (for a malformed tree) a
    /// reserved pattern; never a table.
    ///
    /// # Errors
    /// [`PageTableError::InvalidInput`] if `addr` lies outside the input space.
    pub fn get_leaf(&self, addr: u64) -> Result<(Pte, Level)> {
        let mut found = (Pte::INVALID, self.geo.start_level);
        let mut walker = Walker::new(WalkFlags::LEAF, |v: &Visit<'_, M>| -> Result<()> {
            found = (v.old(), v.level());
            Ok(())
        });
        self.walk_shared(addr, PAGE_SIZE, &mut walker)?;
        drop(walker);
        Ok(found)
    }

    /// The stage-2 MMU and flags, or [`PageTableError::Unsupported`] for a stage-1 table.
    pub(crate) fn stage2_mode(&self) -> Result<(&'a dyn Stage2Mmu, Stage2Flags)> {
        match self.mode {
            Mode::Stage2 { mmu, flags } => Ok((mmu, flags)),
            Mode::Hyp => Err(PageTableError::Unsupported),
        }
    }

    /// Whether guest accesses are coherent without cache maintenance.
    pub(crate) fn has_fwb(&self) -> bool {
        match self.mode {
            Mode::Stage2 { mmu, flags } => {
                mmu.has_stage2_fwb() && !flags.contains(Stage2Flags::NO_FWB)
            }
            Mode::Hyp => false,
        }
    }
}

impl<M: MmOps> Drop for PageTable<'_, M> {
    fn drop(&mut self) {
        let mm = self.mm;
        let release = |v: &Visit<'_, M>| -> Result<()> {
            let old = v.old();
            if !old.is_counted() {
                return Ok(());
            }
            mm.put_page(v.table_page());
            if v.kind() == WalkFlags::TABLE_POST {
                mm.put_page(old.output_address());
            }
            Ok(())
        };
        let mut walker = Walker::new(WalkFlags::LEAF | WalkFlags::TABLE_POST, release);
        if let Err(e) = walk(&self.geo, mm, 0, self.geo.limit(), &mut walker) {
            log::error!("teardown of table at {} failed: {e}", self.geo.pgd);
        }

        match self.mode {
            Mode::Hyp => mm.put_page(self.geo.pgd),
            Mode::Stage2 { .. } => match Self::stage2_pgd_size(self.geo.ia_bits) {
                Ok(size) => mm.free_pages_exact(self.geo.pgd, size),
                Err(e) => log::error!("cannot size stage-2 root at {}: {e}", self.geo.pgd),
            },
        }
        debug!("destroyed {:?} table at {}", self.geo.stage, self.geo.pgd);
    }
}

impl<M: MmOps> fmt::Debug for PageTable<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("stage", &self.geo.stage)
            .field("ia_bits", &self.geo.ia_bits)
            .field("start_level", &self.geo.start_level)
            .field("pgd", &self.geo.pgd)
            .finish_non_exhaustive()
    }
}

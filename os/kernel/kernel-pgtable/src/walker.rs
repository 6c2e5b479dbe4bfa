//! # Table Walker
//!
//! [`walk`] visits every entry intersecting an input-address range, depth
//! first, and hands each one to a [`Visitor`]. Which entries are handed over
//! is selected with [`WalkFlags`]:
//!
//! | Flag | Invoked for | When |
//! |:-----|:------------|:-----|
//! | [`LEAF`](WalkFlags::LEAF) | invalid and leaf entries | before advancing past them |
//! | [`TABLE_PRE`](WalkFlags::TABLE_PRE) | table entries | before descending |
//! | [`TABLE_POST`](WalkFlags::TABLE_POST) | table entries | after the child range is exhausted |
//!
//! After every `LEAF` and `TABLE_PRE` callback the entry is loaded again and
//! the walk continues with whatever is there *now*: a leaf visitor that
//! installs a table gets that table descended into, and a pre-order visitor
//! that replaces a table with a block makes the walk skip it.
//!
//! The walk keeps an explicit stack of one frame per level and never
//! allocates. A visitor error stops it immediately and is returned as-is.

use crate::addresses::PhysicalAddress;
use crate::level::{Level, PTES_PER_TABLE, root_entries};
use crate::mm::MmOps;
use crate::pte::{Entry, Pte, Stage, decode};
use crate::{PAGE_SIZE, PageTableError, Result, align_down};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

bitflags::bitflags! {
    /// Selects which entries a [`Walker`] is invoked for.
    ///
    /// A [`Visit`] carries exactly one of these as its [`kind`](Visit::kind).
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
    pub struct WalkFlags: u8 {
        const LEAF       = 1 << 0;
        const TABLE_PRE  = 1 << 1;
        const TABLE_POST = 1 << 2;
    }
}

/// Callback invoked by the walker.
pub trait Visitor<M: MmOps> {
    /// Inspect or modify the entry described by `visit`.
    ///
    /// # Errors
    /// Any error aborts the walk and is returned to the caller of [`walk`].
    fn visit(&mut self, visit: &Visit<'_, M>) -> Result<()>;
}

impl<M, F> Visitor<M> for F
where
    M: MmOps,
    F: FnMut(&Visit<'_, M>) -> Result<()>,
{
    fn visit(&mut self, visit: &Visit<'_, M>) -> Result<()> {
        self(visit)
    }
}

/// A visitor together with the set of entries it wants to see.
pub struct Walker<V> {
    visitor: V,
    flags: WalkFlags,
}

impl<V> Walker<V> {
    #[must_use]
    pub const fn new(flags: WalkFlags, visitor: V) -> Self {
        Self { visitor, flags }
    }

    #[must_use]
    pub const fn flags(&self) -> WalkFlags {
        self.flags
    }

    pub const fn visitor_mut(&mut self) -> &mut V {
        &mut self.visitor
    }

    #[must_use]
    pub fn into_visitor(self) -> V {
        self.visitor
    }
}

/// One entry as seen by a [`Visitor`].
pub struct Visit<'w, M: MmOps> {
    addr: u64,
    end: u64,
    level: Level,
    kind: WalkFlags,
    stage: Stage,
    old: Pte,
    slot: &'w AtomicU64,
    table_page: PhysicalAddress,
    mm: &'w M,
}

impl<'w, M: MmOps> Visit<'w, M> {
    /// Input address at which this visit started.
    ///
    /// Equal to the entry's base unless the walk began inside the entry.
    #[inline]
    #[must_use]
    pub const fn addr(&self) -> u64 {
        self.addr
    }

    /// End of the whole walk (exclusive).
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn level(&self) -> Level {
        self.level
    }

    /// Which of the [`WalkFlags`] this visit is for.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> WalkFlags {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    #[inline]
    #[must_use]
    pub const fn mm(&self) -> &'w M {
        self.mm
    }

    /// The entry as loaded just before the callback.
    #[inline]
    #[must_use]
    pub const fn old(&self) -> Pte {
        self.old
    }

    /// Decoded form of [`old`](Self::old).
    #[inline]
    #[must_use]
    pub const fn entry(&self) -> Entry {
        decode(self.old, self.level, self.stage)
    }

    /// First input address translated by this entry.
    #[inline]
    #[must_use]
    pub const fn entry_base(&self) -> u64 {
        align_down(self.addr, self.level.granule())
    }

    /// Whether the walk range covers this entry completely.
    #[inline]
    #[must_use]
    pub const fn covers_entry(&self) -> bool {
        self.addr == self.entry_base() && self.end - self.addr >= self.level.granule()
    }

    /// Physical address of the table page holding this entry.
    ///
    /// This is the page whose reference count tracks the entry.
    #[inline]
    #[must_use]
    pub const fn table_page(&self) -> PhysicalAddress {
        self.table_page
    }

    /// Re-read the entry.
    #[inline]
    #[must_use]
    pub fn load(&self) -> Pte {
        Pte::from_bits(self.slot.load(Ordering::Acquire))
    }

    /// Replace the entry with a single store.
    #[inline]
    pub fn store(&self, pte: Pte) {
        self.slot.store(pte.into_bits(), Ordering::Release);
    }
}

/// The fixed shape of a tree, as needed to walk it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Geometry {
    pub ia_bits: u32,
    pub start_level: Level,
    pub pgd: PhysicalAddress,
    pub stage: Stage,
}

impl Geometry {
    /// First input address past the tree.
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> u64 {
        1 << self.ia_bits
    }
}

/// Borrow the `idx`-th word of the table mapped at `base`.
///
/// # Safety
/// `base` must point to a live table of more than `idx` entries, obtained from
/// [`MmOps::phys_to_virt`], that stays mapped for `'a`.
#[inline]
pub(crate) unsafe fn slot<'a>(base: NonNull<u64>, idx: usize) -> &'a AtomicU64 {
    // SAFETY: in bounds per the caller; table memory is only accessed atomically.
    unsafe { AtomicU64::from_ptr(base.add(idx).as_ptr()) }
}

#[derive(Copy, Clone)]
struct Frame {
    base: NonNull<u64>,
    level: Level,
    idx: usize,
    entries: usize,
    /// Walk address at which the visit of the entry at `idx` started.
    visit_addr: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    /// Load the entry at the current index and run the pre-visit.
    Visit,
    /// Re-decode the entry after the visitor had its chance to modify it.
    Reload,
    /// The current frame is exhausted; run the post-visit on the parent.
    Ascend,
}

/// Walk `[addr, addr + size)` of the tree described by `geo`.
///
/// `addr` is rounded down and `addr + size` up to page boundaries.
/// An empty range succeeds without visiting anything.
///
/// # Errors
/// - [`PageTableError::InvalidInput`] if the range overflows or extends past `2^ia_bits`.
/// - Whatever the visitor returns.
pub(crate) fn walk<M, V>(
    geo: &Geometry,
    mm: &M,
    addr: u64,
    size: u64,
    walker: &mut Walker<V>,
) -> Result<()>
where
    M: MmOps,
    V: Visitor<M>,
{
    if size == 0 {
        return Ok(());
    }
    let end = addr
        .checked_add(size)
        .and_then(|e| e.checked_add(PAGE_SIZE - 1))
        .map(|e| align_down(e, PAGE_SIZE))
        .ok_or(PageTableError::InvalidInput)?;
    let mut cursor = align_down(addr, PAGE_SIZE);
    if end > geo.limit() {
        return Err(PageTableError::InvalidInput);
    }

    let root = Frame {
        base: mm.phys_to_virt(geo.pgd),
        level: geo.start_level,
        idx: (cursor >> geo.start_level.shift()) as usize,
        entries: root_entries(geo.ia_bits, geo.start_level),
        visit_addr: cursor,
    };
    let mut stack = [root; Level::MAX_LEVELS as usize];
    let mut depth = 0;
    let mut state = State::Visit;

    loop {
        let frame = stack[depth];
        match state {
            State::Visit => {
                if frame.idx >= frame.entries || cursor >= end {
                    state = State::Ascend;
                    continue;
                }
                // SAFETY: idx < entries of a table handed out by `mm`.
                let slot = unsafe { slot(frame.base, frame.idx) };
                let old = Pte::from_bits(slot.load(Ordering::Acquire));
                let kind = if old.is_table(frame.level) {
                    WalkFlags::TABLE_PRE
                } else {
                    WalkFlags::LEAF
                };
                if walker.flags.contains(kind) {
                    let visit = Visit {
                        addr: cursor,
                        end,
                        level: frame.level,
                        kind,
                        stage: geo.stage,
                        old,
                        slot,
                        table_page: mm.virt_to_phys(NonNull::from(slot).cast()).page_base(),
                        mm,
                    };
                    walker.visitor.visit(&visit)?;
                }
                state = State::Reload;
            }
            State::Reload => {
                // SAFETY: as above.
                let slot = unsafe { slot(frame.base, frame.idx) };
                let pte = Pte::from_bits(slot.load(Ordering::Acquire));
                match (pte.is_table(frame.level), frame.level.next()) {
                    (true, Some(child_level)) => {
                        stack[depth].visit_addr = cursor;
                        depth += 1;
                        stack[depth] = Frame {
                            base: mm.phys_to_virt(pte.output_address()),
                            level: child_level,
                            idx: child_level.index(cursor),
                            entries: PTES_PER_TABLE,
                            visit_addr: cursor,
                        };
                    }
                    _ => {
                        let granule = frame.level.granule();
                        cursor = align_down(cursor, granule) + granule;
                        stack[depth].idx += 1;
                    }
                }
                state = State::Visit;
            }
            State::Ascend => {
                if depth == 0 {
                    return Ok(());
                }
                depth -= 1;
                let parent = stack[depth];
                if walker.flags.contains(WalkFlags::TABLE_POST) {
                    // SAFETY: the parent frame's index was in bounds when we descended.
                    let slot = unsafe { slot(parent.base, parent.idx) };
                    let visit = Visit {
                        addr: parent.visit_addr,
                        end,
                        level: parent.level,
                        kind: WalkFlags::TABLE_POST,
                        stage: geo.stage,
                        old: Pte::from_bits(slot.load(Ordering::Acquire)),
                        slot,
                        table_page: mm.virt_to_phys(NonNull::from(slot).cast()).page_base(),
                        mm,
                    };
                    walker.visitor.visit(&visit)?;
                }
                stack[depth].idx += 1;
                state = State::Visit;
            }
        }
    }
}

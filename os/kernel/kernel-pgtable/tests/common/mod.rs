#![allow(dead_code)]

use kernel_pgtable::{
    ArchCapabilities, ArenaCache, ArenaMmOps, Level, MmOps, MmuHooks, PageTable, PhysicalAddress,
    TablePage,
};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

pub const KIB: u64 = 1 << 10;
pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;
pub const PAGE: u64 = 4 * KIB;

const OA_MASK: u64 = ((1 << 36) - 1) << 12;

/// Something the page-table code asked the outside world to do.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Event {
    /// `cleared` tells whether the entry for `addr` at `level` read as zero
    /// when the invalidation was issued.
    Invalidate { addr: u64, level: u8, cleared: bool },
    InvalidateAll,
    Clean { pa: u64, size: u64 },
    /// A table page went back to the allocator.
    Free(PhysicalAddress),
}

/// A table page and the entry pointing at it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Linked {
    pub table: PhysicalAddress,
    pub base: u64,
    pub parent_level: Level,
}

/// Memory and MMU for one VM, recording every maintenance operation.
pub struct TestBed {
    pub arena: ArenaMmOps,
    ia_bits: u32,
    fwb: bool,
    root: Cell<Option<(PhysicalAddress, Level)>>,
    events: RefCell<Vec<Event>>,
}

impl TestBed {
    pub fn new(ia_bits: u32, pages: usize) -> Self {
        Self {
            arena: ArenaMmOps::new(pages),
            ia_bits,
            fwb: false,
            root: Cell::new(None),
            events: RefCell::new(Vec::new()),
        }
    }

    pub fn with_fwb(mut self) -> Self {
        self.fwb = true;
        self
    }

    /// Let invalidations check the entries of `pgt`.
    pub fn attach(&self, pgt: &PageTable<'_, Self>) {
        self.root.set(Some((pgt.pgd(), pgt.start_level())));
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn take_events(&self) -> Vec<Event> {
        self.events.take()
    }

    pub fn invalidations(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| matches!(e, Event::Invalidate { .. } | Event::InvalidateAll))
            .count()
    }

    fn root_entries(&self, start: Level) -> usize {
        1 << (self.ia_bits - start.shift())
    }

    /// Physical address of the entry translating `addr` at `level`, if the
    /// tables down to that level exist.
    pub fn entry_pa(&self, addr: u64, level: Level) -> Option<PhysicalAddress> {
        let (mut table, start) = self.root.get()?;
        let mut current = start;
        loop {
            let idx = if current == start {
                (addr >> current.shift()) as usize
            } else {
                current.index(addr)
            };
            let slot = table + idx as u64 * 8;
            if current == level {
                return Some(slot);
            }
            let word = self.arena.read_word(slot);
            if word & 0b11 != 0b11 || current.is_last() {
                return None;
            }
            table = PhysicalAddress::new(word & OA_MASK);
            current = current.next()?;
        }
    }

    /// Every table page reachable from the root.
    pub fn linked_tables(&self) -> Vec<Linked> {
        let mut out = Vec::new();
        if let Some((root, start)) = self.root.get() {
            self.collect(root, start, 0, self.root_entries(start), &mut out);
        }
        out
    }

    fn collect(
        &self,
        table: PhysicalAddress,
        level: Level,
        base: u64,
        entries: usize,
        out: &mut Vec<Linked>,
    ) {
        let Some(next) = level.next() else {
            return;
        };
        for idx in 0..entries {
            let word = self.arena.read_word(table + idx as u64 * 8);
            if word & 0b11 != 0b11 {
                continue;
            }
            let child = PhysicalAddress::new(word & OA_MASK);
            let entry_base = base + idx as u64 * level.granule();
            out.push(Linked {
                table: child,
                base: entry_base,
                parent_level: level,
            });
            self.collect(child, next, entry_base, 512, out);
        }
    }
}

impl ArchCapabilities for TestBed {
    fn ipa_bits(&self) -> u32 {
        self.ia_bits
    }

    fn has_stage2_fwb(&self) -> bool {
        self.fwb
    }
}

impl MmuHooks for TestBed {
    fn tlb_invalidate_ipa(&self, addr: u64, level: Level) {
        let cleared = self.entry_pa(addr, level).is_none_or(|pa| self.arena.read_word(pa) == 0);
        self.events.borrow_mut().push(Event::Invalidate {
            addr,
            level: level.as_u8(),
            cleared,
        });
    }

    fn tlb_invalidate_all(&self) {
        self.events.borrow_mut().push(Event::InvalidateAll);
    }

    fn dcache_clean_inval_poc(&self, pa: PhysicalAddress, size: u64) {
        self.events.borrow_mut().push(Event::Clean { pa: pa.as_u64(), size });
    }
}

impl MmOps for TestBed {
    type Cache = ArenaCache;

    fn zalloc_page(&self, cache: Option<&mut ArenaCache>) -> Option<TablePage> {
        self.arena.zalloc_page(cache)
    }

    fn zalloc_pages_exact(&self, size: usize) -> Option<PhysicalAddress> {
        self.arena.zalloc_pages_exact(size)
    }

    fn free_pages_exact(&self, pa: PhysicalAddress, size: usize) {
        self.arena.free_pages_exact(pa, size);
        self.events.borrow_mut().push(Event::Free(pa));
    }

    fn get_page(&self, pa: PhysicalAddress) {
        self.arena.get_page(pa);
    }

    fn put_page(&self, pa: PhysicalAddress) {
        self.arena.put_page(pa);
        if self.arena.page_count(pa) == 0 {
            self.events.borrow_mut().push(Event::Free(pa.page_base()));
        }
    }

    fn page_count(&self, pa: PhysicalAddress) -> u32 {
        self.arena.page_count(pa)
    }

    fn phys_to_virt(&self, pa: PhysicalAddress) -> NonNull<u64> {
        self.arena.phys_to_virt(pa)
    }

    fn virt_to_phys(&self, va: NonNull<u64>) -> PhysicalAddress {
        self.arena.virt_to_phys(va)
    }
}

/// A deterministic xorshift generator; good enough to shuffle test layouts.
pub struct XorShift(u64);

impl XorShift {
    pub const fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }
}

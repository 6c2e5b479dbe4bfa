//! # Host-Memory Page Arena
//!
//! [`ArenaMmOps`] simulates a window of physical memory with a fixed number of
//! heap-allocated 4 KiB frames. Physical addresses are `base + index * 4096`;
//! [`phys_to_virt`](MmOps::phys_to_virt) resolves them to the frame's memory.
//! Reference counts are per frame and atomic, so the arena can be shared with
//! threads that inspect table memory while the owner mutates it.
//!
//! Intended for tests and host-side tools; a hypervisor plugs its own page
//! allocator into [`MmOps`] instead.

use crate::addresses::PhysicalAddress;
use crate::level::PTES_PER_TABLE;
use crate::mm::{MmOps, TablePage};
use crate::PAGE_SIZE;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use log::trace;

/// Physical address of the first arena frame unless configured otherwise.
pub const DEFAULT_ARENA_BASE: u64 = 0x4000_0000;

/// A 4 KiB-aligned frame of table memory.
#[repr(C, align(4096))]
struct Frame([AtomicU64; PTES_PER_TABLE]);

impl Frame {
    fn zeroed() -> Self {
        Self([const { AtomicU64::new(0) }; PTES_PER_TABLE])
    }

    fn clear(&self) {
        for word in &self.0 {
            word.store(0, Ordering::Relaxed);
        }
    }
}

/// Page reserve for one allocating operation.
///
/// Mirrors a hypervisor's per-vCPU memcache: the caller decides up front how
/// many pages an operation may consume. Once the budget is spent,
/// [`MmOps::zalloc_page`] fails even if the arena has room.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct ArenaCache {
    budget: usize,
}

impl ArenaCache {
    #[must_use]
    pub const fn with_pages(pages: usize) -> Self {
        Self { budget: pages }
    }

    /// Pages still available to draw from.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.budget
    }
}

/// [`MmOps`] backed by host memory.
pub struct ArenaMmOps {
    frames: Box<[Frame]>,
    counts: Box<[AtomicU32]>,
    base: PhysicalAddress,
}

impl ArenaMmOps {
    /// An arena of `pages` frames starting at [`DEFAULT_ARENA_BASE`].
    #[must_use]
    pub fn new(pages: usize) -> Self {
        Self::with_base(PhysicalAddress::new(DEFAULT_ARENA_BASE), pages)
    }

    /// An arena of `pages` frames starting at the page-aligned `base`.
    #[must_use]
    pub fn with_base(base: PhysicalAddress, pages: usize) -> Self {
        let frames: Vec<Frame> = (0..pages).map(|_| Frame::zeroed()).collect();
        let counts: Vec<AtomicU32> = (0..pages).map(|_| AtomicU32::new(0)).collect();
        Self {
            frames: frames.into_boxed_slice(),
            counts: counts.into_boxed_slice(),
            base: base.page_base(),
        }
    }

    /// Total number of frames.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames currently handed out.
    #[must_use]
    pub fn pages_in_use(&self) -> usize {
        self.counts.iter().filter(|c| c.load(Ordering::Relaxed) != 0).count()
    }

    /// Whether `pa` falls inside the arena.
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.base && ((pa - self.base) / PAGE_SIZE) < self.frames.len() as u64
    }

    /// Read the 64-bit word at `pa` as a hardware walker would.
    ///
    /// # Panics
    /// If `pa` lies outside the arena.
    #[must_use]
    pub fn read_word(&self, pa: PhysicalAddress) -> u64 {
        let idx = self.index(pa);
        let word = ((pa - self.base) % PAGE_SIZE / 8) as usize;
        self.frames[idx].0[word].load(Ordering::Acquire)
    }

    fn index(&self, pa: PhysicalAddress) -> usize {
        assert!(self.contains(pa), "{pa} is outside the page arena");
        ((pa - self.base) / PAGE_SIZE) as usize
    }

    fn phys_of(&self, idx: usize) -> PhysicalAddress {
        self.base + idx as u64 * PAGE_SIZE
    }

    /// Claim `n` contiguous free frames.
    fn claim(&self, n: usize) -> Option<PhysicalAddress> {
        if n == 0 || n > self.frames.len() {
            return None;
        }
        let mut first = 0;
        'search: while first + n <= self.frames.len() {
            for i in first..first + n {
                if self.counts[i]
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    for taken in &self.counts[first..i] {
                        taken.store(0, Ordering::Release);
                    }
                    first = i + 1;
                    continue 'search;
                }
            }
            for frame in &self.frames[first..first + n] {
                frame.clear();
            }
            return Some(self.phys_of(first));
        }
        None
    }
}

impl MmOps for ArenaMmOps {
    type Cache = ArenaCache;

    fn zalloc_page(&self, cache: Option<&mut ArenaCache>) -> Option<TablePage> {
        if let Some(cache) = cache {
            if cache.budget == 0 {
                return None;
            }
            let pa = self.claim(1)?;
            cache.budget -= 1;
            return Some(TablePage::new(pa));
        }
        self.claim(1).map(TablePage::new)
    }

    fn zalloc_pages_exact(&self, size: usize) -> Option<PhysicalAddress> {
        self.claim(size.div_ceil(PAGE_SIZE as usize))
    }

    fn free_pages_exact(&self, pa: PhysicalAddress, size: usize) {
        let first = self.index(pa);
        for count in &self.counts[first..first + size.div_ceil(PAGE_SIZE as usize)] {
            count.store(0, Ordering::Release);
        }
    }

    fn get_page(&self, pa: PhysicalAddress) {
        let prev = self.counts[self.index(pa)].fetch_add(1, Ordering::AcqRel);
        debug_assert_ne!(prev, 0, "get_page on free frame {pa}");
    }

    fn put_page(&self, pa: PhysicalAddress) {
        let prev = self.counts[self.index(pa)].fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(prev, 0, "put_page on free frame {pa}");
        if prev == 1 {
            trace!("arena: freed {}", pa.page_base());
        }
    }

    fn page_count(&self, pa: PhysicalAddress) -> u32 {
        self.counts[self.index(pa)].load(Ordering::Acquire)
    }

    fn phys_to_virt(&self, pa: PhysicalAddress) -> NonNull<u64> {
        let idx = self.index(pa);
        // SAFETY: `idx` is in bounds; the pointer keeps the whole slice's provenance.
        unsafe { NonNull::from(&*self.frames).cast::<Frame>().add(idx).cast::<u64>() }
    }

    fn virt_to_phys(&self, va: NonNull<u64>) -> PhysicalAddress {
        let start = NonNull::from(&*self.frames).cast::<u64>();
        let offset = va.addr().get() - start.addr().get();
        self.base + offset as u64
    }
}

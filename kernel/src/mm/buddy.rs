//! Buddy physical frame allocator.
//!
//! One global zone covers all managed RAM. For each order in
//! `[0, MAX_ORDER)` the zone keeps a doubly linked free list threaded
//! through the frame descriptors by index, plus a population count. Two
//! blocks of order `k` are buddies when their frame numbers differ exactly
//! in bit `k`; freeing merges with the buddy as long as it is whole, free
//! and of the same order.
//!
//! The zone is an instantiable struct so tests can run private zones; the
//! kernel's single instance lives behind [`init`]/[`alloc_pages`] and one
//! spinlock, which serializes all allocation.

use core::mem::size_of;

use lazy_static::lazy_static;

use super::page::{Page, NIL};
use super::{phys_to_virt, PhysAddr, PGSIZE};
use crate::error::AllocError;
use crate::sync::SpinLock;

/// Largest block is `2^(MAX_ORDER-1)` frames (4 MiB).
pub const MAX_ORDER: usize = 11;

#[derive(Debug, Clone, Copy)]
struct FreeArea {
    /// Descriptor index of the first free block head, or NIL.
    head: u32,
    /// Number of free blocks of this order.
    n_free: u64,
}

impl FreeArea {
    const fn new() -> Self {
        Self {
            head: NIL,
            n_free: 0,
        }
    }
}

/// A contiguous range of managed frames and its buddy bookkeeping.
pub struct Zone {
    /// First managed frame number; descriptor `i` covers frame
    /// `base_pfn + i`.
    base_pfn: usize,
    pages: &'static mut [Page],
    managed_pages: u64,
    available_pages: u64,
    areas: [FreeArea; MAX_ORDER],
}

impl Zone {
    /// Wrap a descriptor array covering `pages.len()` frames starting at
    /// `base_pfn`. Every frame starts off limbo (neither free nor used);
    /// push ranges in with [`Zone::free_range`].
    pub fn new(base_pfn: usize, pages: &'static mut [Page]) -> Self {
        let managed = pages.len() as u64;
        Self {
            base_pfn,
            pages,
            managed_pages: managed,
            available_pages: 0,
            areas: [FreeArea::new(); MAX_ORDER],
        }
    }

    fn idx(&self, pfn: usize) -> usize {
        debug_assert!(pfn >= self.base_pfn);
        pfn - self.base_pfn
    }

    fn in_range(&self, pfn: usize, order: usize) -> bool {
        pfn >= self.base_pfn && pfn + (1 << order) <= self.base_pfn + self.pages.len()
    }

    /// Link a block at the front of its order's free list.
    fn add_to_free_list(&mut self, pfn: usize, order: usize) {
        let idx = self.idx(pfn) as u32;
        let head = self.areas[order].head;
        self.pages[idx as usize].next = head;
        self.pages[idx as usize].prev = NIL;
        if head != NIL {
            self.pages[head as usize].prev = idx;
        }
        self.areas[order].head = idx;
        self.pages[idx as usize].set_buddy(order);
        self.areas[order].n_free += 1;
        self.available_pages += 1 << order;
    }

    /// Unlink a block from its order's free list.
    fn del_from_free_list(&mut self, pfn: usize, order: usize) {
        let idx = self.idx(pfn);
        let (next, prev) = (self.pages[idx].next, self.pages[idx].prev);
        if prev != NIL {
            self.pages[prev as usize].next = next;
        } else {
            self.areas[order].head = next;
        }
        if next != NIL {
            self.pages[next as usize].prev = prev;
        }
        self.pages[idx].next = NIL;
        self.pages[idx].prev = NIL;
        self.pages[idx].set_order(order);
        self.pages[idx].clear_buddy();
        self.areas[order].n_free -= 1;
        self.available_pages -= 1 << order;
    }

    /// May the block at `buddy_pfn` merge with a block of `order`?
    fn is_free_buddy(&self, buddy_pfn: usize, order: usize) -> bool {
        if !self.in_range(buddy_pfn, order) {
            return false;
        }
        let page = &self.pages[self.idx(buddy_pfn)];
        page.is_buddy() && page.order() == order && page.refcount() == 0
    }

    /// Insert a block, merging upward while the buddy is free.
    fn free_one(&mut self, mut pfn: usize, mut order: usize) {
        while order < MAX_ORDER - 1 {
            let buddy_pfn = pfn ^ (1 << order);
            if !self.is_free_buddy(buddy_pfn, order) {
                break;
            }
            self.del_from_free_list(buddy_pfn, order);
            pfn &= buddy_pfn;
            order += 1;
        }
        self.add_to_free_list(pfn, order);
    }

    /// Reset descriptors for a block and put it on the free lists.
    fn free_block(&mut self, pfn: usize, order: usize) {
        for f in pfn..pfn + (1 << order) {
            let idx = self.idx(f);
            self.pages[idx].clear_kernel();
            self.pages[idx].set_unused();
            self.pages[idx].set_refcount(0);
        }
        self.free_one(pfn, order);
    }

    /// Donate `[begin, end)` to the zone, carving the largest
    /// naturally-aligned power-of-two blocks that fit.
    pub fn free_range(&mut self, begin: usize, end: usize) {
        let mut pfn = begin;
        while pfn < end {
            let align = if pfn == 0 {
                MAX_ORDER - 1
            } else {
                pfn.trailing_zeros() as usize
            };
            let mut order = align.min(MAX_ORDER - 1);
            while pfn + (1 << order) > end {
                order -= 1;
            }
            self.free_block(pfn, order);
            pfn += 1 << order;
        }
    }

    /// Take the smallest free block of at least `order`, splitting the
    /// excess halves back onto the lower lists.
    fn rm_smallest(&mut self, order: usize) -> Result<usize, AllocError> {
        for current in order..MAX_ORDER {
            let head = self.areas[current].head;
            if head == NIL {
                continue;
            }
            let pfn = self.base_pfn + head as usize;
            self.del_from_free_list(pfn, current);
            self.expand(pfn, order, current);
            return Ok(pfn);
        }
        Err(AllocError::OutOfMemory)
    }

    /// Return the unused halves of a split block to their lists.
    fn expand(&mut self, pfn: usize, required: usize, mut current: usize) {
        let mut size = 1usize << current;
        while current > required {
            current -= 1;
            size >>= 1;
            self.add_to_free_list(pfn + size, current);
        }
    }

    /// Allocate `2^order` contiguous frames.
    pub fn alloc_pages(&mut self, order: usize) -> Result<usize, AllocError> {
        if order >= MAX_ORDER {
            return Err(AllocError::InvalidOrder);
        }
        let pfn = self.rm_smallest(order)?;
        for f in pfn..pfn + (1 << order) {
            let idx = self.idx(f);
            self.pages[idx].set_used();
            self.pages[idx].clear_kernel();
            self.pages[idx].set_refcount(0);
            self.pages[idx].set_order(order);
        }
        Ok(pfn)
    }

    /// Release `2^order` frames starting at `pfn`.
    pub fn free_pages(&mut self, pfn: usize, order: usize) {
        if order >= MAX_ORDER || !self.in_range(pfn, order) {
            panic!("free_pages: pfn {:#x} order {} out of range", pfn, order);
        }
        if !self.pages[self.idx(pfn)].is_used() {
            panic!("free_pages: pfn {:#x} not in use, double free?", pfn);
        }
        self.free_block(pfn, order);
    }

    /// Release a block using the order recorded at allocation.
    pub fn free_page(&mut self, pfn: usize) {
        let order = self.pages[self.idx(pfn)].order();
        self.free_pages(pfn, order);
    }

    /// Permanently withhold one frame (boot image, metadata, MMIO).
    pub fn reserve_frame(&mut self, pfn: usize) {
        let idx = self.idx(pfn);
        self.pages[idx].set_used();
        self.pages[idx].set_kernel();
    }

    pub fn managed_pages(&self) -> u64 {
        self.managed_pages
    }

    pub fn available_pages(&self) -> u64 {
        self.available_pages
    }

    pub fn n_free(&self, order: usize) -> u64 {
        self.areas[order].n_free
    }

    /// Walk one free list; used by the invariant checks.
    pub fn free_list_len(&self, order: usize) -> u64 {
        let mut n = 0;
        let mut idx = self.areas[order].head;
        while idx != NIL {
            n += 1;
            idx = self.pages[idx as usize].next;
        }
        n
    }

    #[cfg(not(target_os = "none"))]
    fn check_invariants(&self) {
        let mut sum = 0;
        for order in 0..MAX_ORDER {
            assert_eq!(self.free_list_len(order), self.n_free(order));
            let mut idx = self.areas[order].head;
            while idx != NIL {
                let page = &self.pages[idx as usize];
                assert!(page.is_buddy());
                assert_eq!(page.order(), order);
                assert_eq!(page.refcount(), 0);
                idx = page.next;
            }
            sum += self.n_free(order) << order;
        }
        assert_eq!(sum, self.available_pages);
    }
}

lazy_static! {
    static ref ZONE: SpinLock<Option<Zone>> = SpinLock::new("buddy", None);
}

/// Bring up the global zone over frames `[begin_pfn, end_pfn)`. The
/// descriptor array is carved out of the front of the range itself; those
/// frames stay kernel-reserved.
pub fn init(begin_pfn: usize, end_pfn: usize) {
    let npages = end_pfn - begin_pfn;
    let meta_bytes = npages * size_of::<Page>();
    let meta_frames = super::page_round_up(meta_bytes) / PGSIZE;
    assert!(meta_frames < npages, "zone too small for its metadata");

    let meta = phys_to_virt(PhysAddr::from_pfn(begin_pfn)) as *mut Page;
    // SAFETY: the caller donates [begin_pfn, end_pfn) exclusively to the
    // zone; the front of it becomes the descriptor array and is initialized
    // element by element before the slice is formed.
    let pages = unsafe {
        for i in 0..npages {
            meta.add(i).write(Page::new());
        }
        core::slice::from_raw_parts_mut(meta, npages)
    };

    let mut zone = Zone::new(begin_pfn, pages);
    for pfn in begin_pfn..begin_pfn + meta_frames {
        zone.reserve_frame(pfn);
    }
    zone.free_range(begin_pfn + meta_frames, end_pfn);

    log::info!(
        "buddy: managed {} pages, available {} ({} KiB), metadata {} frames",
        zone.managed_pages(),
        zone.available_pages(),
        zone.available_pages() * (PGSIZE as u64 / 1024),
        meta_frames
    );

    *ZONE.lock() = Some(zone);
}

fn with_zone<R>(f: impl FnOnce(&mut Zone) -> R) -> R {
    let mut zone = ZONE.lock();
    f(zone.as_mut().expect("buddy: zone not initialized"))
}

/// Allocate `2^order` contiguous frames from the global zone.
pub fn alloc_pages(order: usize) -> Result<PhysAddr, AllocError> {
    with_zone(|zone| zone.alloc_pages(order)).map(PhysAddr::from_pfn)
}

/// Allocate one frame.
pub fn alloc_page() -> Result<PhysAddr, AllocError> {
    alloc_pages(0)
}

/// Free `2^order` frames.
pub fn free_pages(pa: PhysAddr, order: usize) {
    with_zone(|zone| zone.free_pages(pa.pfn(), order));
}

/// Free a block using its recorded order.
pub fn free_page(pa: PhysAddr) {
    with_zone(|zone| zone.free_page(pa.pfn()));
}

/// Frames currently free in the global zone.
pub fn available_pages() -> u64 {
    with_zone(|zone| zone.available_pages())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec;

    fn test_zone(base_pfn: usize, npages: usize) -> Zone {
        let pages: &'static mut [Page] = Vec::leak(vec![Page::new(); npages]);
        let mut zone = Zone::new(base_pfn, pages);
        zone.free_range(base_pfn, base_pfn + npages);
        zone
    }

    #[test]
    fn init_populates_whole_range() {
        let zone = test_zone(0, 1024);
        assert_eq!(zone.available_pages(), 1024);
        // 1024 naturally aligned frames fit a single order-10 block.
        assert_eq!(zone.n_free(10), 1);
        zone.check_invariants();
    }

    #[test]
    fn free_range_carves_aligned_blocks() {
        let pages: &'static mut [Page] = Vec::leak(vec![Page::new(); 32]);
        let mut zone = Zone::new(0, pages);
        // [3, 20): 3(order 0), 4(order 2), 8(order 3), 16(order 2).
        zone.free_range(3, 20);
        assert_eq!(zone.available_pages(), 17);
        assert_eq!(zone.n_free(0), 1);
        assert_eq!(zone.n_free(2), 2);
        assert_eq!(zone.n_free(3), 1);
        zone.check_invariants();
    }

    #[test]
    fn alloc_free_round_trip_restores_state() {
        let mut zone = test_zone(0, 512);
        let before: Vec<u64> = (0..MAX_ORDER).map(|o| zone.n_free(o)).collect();
        let avail = zone.available_pages();

        let pfn = zone.alloc_pages(3).expect("order-3 alloc from fresh zone");
        assert_eq!(zone.available_pages(), avail - 8);
        zone.free_pages(pfn, 3);

        let after: Vec<u64> = (0..MAX_ORDER).map(|o| zone.n_free(o)).collect();
        assert_eq!(before, after);
        assert_eq!(zone.available_pages(), avail);
        zone.check_invariants();
    }

    #[test]
    fn split_marks_halves_free() {
        let mut zone = test_zone(0, 256); // one order-8 block
        let pfn = zone.alloc_pages(0).expect("order-0 alloc");
        assert_eq!(pfn, 0);
        // Splitting 256 leaves one free block at each order 0..8.
        for order in 0..8 {
            assert_eq!(zone.n_free(order), 1, "order {}", order);
        }
        assert_eq!(zone.available_pages(), 255);
        zone.check_invariants();
    }

    #[test]
    fn buddies_merge_back_to_original_order() {
        let mut zone = test_zone(0, 256);
        let a = zone.alloc_pages(4).expect("first order-4");
        let b = zone.alloc_pages(4).expect("second order-4");
        assert_eq!(a ^ b, 16, "siblings of one split differ in bit 4");
        zone.free_pages(a, 4);
        zone.free_pages(b, 4);
        assert_eq!(zone.available_pages(), 256);
        assert_eq!(zone.n_free(8), 1, "block reassembled");
        zone.check_invariants();
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut zone = test_zone(0, 16);
        assert_eq!(zone.alloc_pages(4).expect("whole zone"), 0);
        assert_eq!(zone.alloc_pages(0), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn order_out_of_range_is_rejected() {
        let mut zone = test_zone(0, 16);
        assert_eq!(zone.alloc_pages(MAX_ORDER), Err(AllocError::InvalidOrder));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut zone = test_zone(0, 16);
        let pfn = zone.alloc_pages(0).expect("alloc");
        zone.free_pages(pfn, 0);
        zone.free_pages(pfn, 0);
    }

    #[test]
    fn nonzero_base_allocates_in_range() {
        let mut zone = test_zone(4096, 256);
        let pfn = zone.alloc_pages(2).expect("alloc");
        assert!(pfn >= 4096 && pfn + 4 <= 4096 + 256);
        zone.free_pages(pfn, 2);
        zone.check_invariants();
    }
}

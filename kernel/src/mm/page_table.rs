//! Four-level page-table mechanics.
//!
//! 48-bit virtual addresses, 9 bits of index per level, 4 KiB leaves. Level
//! 0 is the root. An entry is a *table* descriptor when both low type bits
//! are set, a *block* when only VALID is set at levels 1-2, and a *page*
//! leaf at level 3 (same encoding as a table descriptor). The walker stops
//! early at block entries, so the kernel's 2 MiB identity mappings resolve
//! like everything else.

use core::ptr::NonNull;

use bitflags::bitflags;

use super::{buddy, phys_to_virt, PhysAddr, VirtAddr, PGSIZE};
use crate::error::VmError;

/// Entries per table.
pub const ENTRY_COUNT: usize = 512;

bitflags! {
    /// Descriptor bits, lower and upper attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        /// With VALID: table descriptor (levels 0-2) or page leaf (level 3).
        const PAGE = 1 << 1;
        /// MAIR index 1: normal write-back memory. Index 0 (no bit) is
        /// device-nGnRnE.
        const ATTR_NORMAL = 1 << 2;
        /// EL0 accessible.
        const USER = 1 << 6;
        /// Read-only (clear means read-write).
        const RO = 1 << 7;
        /// Inner shareable, for the four coherent cores.
        const SH_INNER = 3 << 8;
        /// Access flag; leaves are installed pre-faulted.
        const AF = 1 << 10;
    }
}

const PTE_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// One translation-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Table descriptor pointing at the next level.
    pub fn table(pa: PhysAddr) -> Self {
        Self(pa.as_usize() as u64 & PTE_ADDR_MASK | (PteFlags::VALID | PteFlags::PAGE).bits())
    }

    /// Level-3 page leaf.
    pub fn leaf(pa: PhysAddr, perm: PteFlags) -> Self {
        Self(
            pa.as_usize() as u64 & PTE_ADDR_MASK
                | (perm
                    | PteFlags::VALID
                    | PteFlags::PAGE
                    | PteFlags::AF
                    | PteFlags::SH_INNER
                    | PteFlags::ATTR_NORMAL)
                    .bits(),
        )
    }

    pub fn is_valid(&self) -> bool {
        self.0 & PteFlags::VALID.bits() != 0
    }

    /// Table descriptor or page leaf (both type bits set)?
    pub fn is_table(&self) -> bool {
        self.is_valid() && self.0 & PteFlags::PAGE.bits() != 0
    }

    /// Block descriptor (valid, type bit clear)?
    pub fn is_block(&self) -> bool {
        self.is_valid() && self.0 & PteFlags::PAGE.bits() == 0
    }

    pub fn is_user(&self) -> bool {
        self.0 & PteFlags::USER.bits() != 0
    }

    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new((self.0 & PTE_ADDR_MASK) as usize)
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !PTE_ADDR_MASK)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// One 4 KiB translation table.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [Pte; ENTRY_COUNT],
}

/// Index of `va` at the given level (0 = root).
pub fn px(level: usize, va: usize) -> usize {
    (va >> (39 - 9 * level)) & 0x1FF
}

/// Allocate a zeroed table page.
pub fn alloc_table() -> Result<PhysAddr, VmError> {
    let pa = buddy::alloc_page().map_err(|_| VmError::OutOfMemory)?;
    // SAFETY: freshly allocated frame, exclusively ours.
    unsafe { core::ptr::write_bytes(pa.as_ptr(), 0, PGSIZE) };
    Ok(pa)
}

/// Find the leaf entry for `va`, allocating intermediate tables when
/// `alloc` is set. Stops early at a block descriptor. Non-canonical
/// addresses are an invariant violation.
///
/// # Safety
///
/// `root` must be a live translation-table page; the returned pointer
/// aliases the table and is only valid while the table is.
pub unsafe fn walk(root: PhysAddr, va: VirtAddr, alloc: bool) -> Result<NonNull<Pte>, VmError> {
    if !va.is_canonical() {
        panic!("walk: non-canonical va {:#x}", va.as_usize());
    }
    let mut table = phys_to_virt(root) as *mut PageTable;
    for level in 0..3 {
        // SAFETY: `table` points at a live table page by the loop invariant.
        let pte = unsafe { &mut (*table).entries[px(level, va.as_usize())] };
        if pte.is_valid() {
            if pte.is_block() {
                return Ok(NonNull::from(pte));
            }
            table = phys_to_virt(pte.addr()) as *mut PageTable;
        } else {
            if !alloc {
                return Err(VmError::BadUserAccess { va: va.as_usize() });
            }
            let child = alloc_table()?;
            *pte = Pte::table(child);
            table = phys_to_virt(child) as *mut PageTable;
        }
    }
    // SAFETY: level-3 table reached; the index is in bounds by construction.
    Ok(unsafe { NonNull::from(&mut (*table).entries[px(3, va.as_usize())]) })
}

/// Install 4 KiB leaf mappings over `[va, va+size)`. Refuses to remap.
///
/// # Safety
///
/// `root` must be a live translation-table tree and `pa` must reference
/// memory the caller owns for the life of the mapping.
pub unsafe fn map_pages(
    root: PhysAddr,
    va: VirtAddr,
    mut pa: PhysAddr,
    size: usize,
    perm: PteFlags,
) -> Result<(), VmError> {
    if size == 0 {
        panic!("map_pages: zero-length mapping at {:#x}", va.as_usize());
    }
    let mut cur = va.page_round_down();
    let last = VirtAddr::new(va.as_usize() + size - 1).page_round_down();
    loop {
        // SAFETY: root is live per the caller's contract.
        let mut pte = unsafe { walk(root, cur, true)? };
        // SAFETY: walk returns a pointer into a live table.
        let pte = unsafe { pte.as_mut() };
        if pte.is_valid() {
            panic!("map_pages: remap at {:#x}", cur.as_usize());
        }
        *pte = Pte::leaf(pa, perm);
        if cur == last {
            break;
        }
        cur = VirtAddr::new(cur.as_usize() + PGSIZE);
        pa = PhysAddr::new(pa.as_usize() + PGSIZE);
    }
    Ok(())
}

/// Remove `npages` leaf mappings starting at page-aligned `va`; optionally
/// free the frames. The range must be mapped: an absent table or invalid
/// or non-leaf entry is an invariant violation.
///
/// # Safety
///
/// `root` must be a live translation-table tree; with `free` set the
/// covered frames must have come from the buddy zone.
pub unsafe fn unmap_pages(root: PhysAddr, va: VirtAddr, npages: usize, free: bool) {
    if va.page_offset() != 0 {
        panic!("unmap_pages: unaligned va {:#x}", va.as_usize());
    }
    for i in 0..npages {
        let cur = VirtAddr::new(va.as_usize() + i * PGSIZE);
        // SAFETY: root is live per the caller's contract.
        let mut pte = match unsafe { walk(root, cur, false) } {
            Ok(pte) => pte,
            Err(_) => panic!("unmap_pages: no table for {:#x}", cur.as_usize()),
        };
        // SAFETY: walk returns a pointer into a live table.
        let pte = unsafe { pte.as_mut() };
        if !pte.is_valid() {
            panic!("unmap_pages: not mapped at {:#x}", cur.as_usize());
        }
        if !pte.is_table() {
            panic!("unmap_pages: not a leaf at {:#x}", cur.as_usize());
        }
        if free {
            buddy::free_page(pte.addr());
        }
        *pte = Pte::invalid();
    }
}

/// Recursively free a table tree: leaves first, then the table frames.
///
/// # Safety
///
/// `root` must be a live tree whose leaf frames (at `level == 3`) and table
/// frames all came from the buddy zone and are no longer referenced.
pub unsafe fn free_walk(root: PhysAddr, level: usize) {
    if level < 3 {
        let table = phys_to_virt(root) as *mut PageTable;
        for i in 0..ENTRY_COUNT {
            // SAFETY: table page is live until freed below.
            let pte = unsafe { (*table).entries[i] };
            if pte.is_valid() && pte.is_table() {
                // SAFETY: recursion over a live child.
                unsafe { free_walk(pte.addr(), level + 1) };
            }
        }
    }
    buddy::free_page(root);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::test_support::init_test_zone;

    #[test]
    fn leaf_encoding_round_trips() {
        let pa = PhysAddr::new(0x1234_5000);
        let pte = Pte::leaf(pa, PteFlags::USER);
        assert!(pte.is_valid() && pte.is_table() && pte.is_user());
        assert_eq!(pte.addr(), pa);
        assert!(pte.flags().contains(PteFlags::AF | PteFlags::SH_INNER));
    }

    #[test]
    fn px_indexes_match_levels() {
        let va = (5usize << 39) | (6 << 30) | (7 << 21) | (8 << 12) | 9;
        assert_eq!(px(0, va), 5);
        assert_eq!(px(1, va), 6);
        assert_eq!(px(2, va), 7);
        assert_eq!(px(3, va), 8);
    }

    #[test]
    fn walk_allocates_and_finds_leaves() {
        init_test_zone();
        let root = alloc_table().expect("root table");
        let va = VirtAddr::new(0x40_0000);

        // SAFETY: root is a live table from alloc_table.
        unsafe {
            assert!(walk(root, va, false).is_err(), "nothing mapped yet");
            let frame = buddy::alloc_page().expect("frame");
            map_pages(root, va, frame, PGSIZE, PteFlags::USER).expect("map");

            let pte = walk(root, va, false).expect("walk after map").as_ref().clone();
            assert_eq!(pte.addr(), frame);
            assert!(pte.is_user());

            unmap_pages(root, va, 1, true);
            if let Ok(pte) = walk(root, va, false) {
                assert!(!pte.as_ref().is_valid());
            }
            free_walk(root, 0);
        }
    }

    #[test]
    #[should_panic(expected = "non-canonical")]
    fn walk_rejects_mixed_high_bits() {
        init_test_zone();
        let root = alloc_table().expect("root table");
        // SAFETY: root is live; the address is the point of the test.
        let _ = unsafe { walk(root, VirtAddr::new(0x0123_4567_89AB_CDEF << 1), false) };
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn map_refuses_remap() {
        init_test_zone();
        let root = alloc_table().expect("root table");
        let frame = buddy::alloc_page().expect("frame");
        // SAFETY: root and frame are live.
        unsafe {
            map_pages(root, VirtAddr::new(0), frame, PGSIZE, PteFlags::USER).expect("first map");
            let _ = map_pages(root, VirtAddr::new(0), frame, PGSIZE, PteFlags::USER);
        }
    }
}

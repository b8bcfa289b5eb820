//! Per-process user address spaces.
//!
//! A `UserPageTable` owns one four-level table tree mapping `[0, sz)` of a
//! process image. Growth, shrink, fork-copy and teardown live here, as do
//! the only three functions allowed to touch user memory from kernel
//! context: `copy_in`, `copy_out` and `copy_in_str`, which walk the user
//! table one page at a time.

use core::ptr;

use super::page_table::{self, PteFlags};
use super::{buddy, page_round_up, PhysAddr, VirtAddr, PGSIZE};
use crate::arch;
use crate::error::VmError;

/// Root of one process's user address space.
#[derive(Debug)]
pub struct UserPageTable {
    root: PhysAddr,
}

impl UserPageTable {
    /// Create an empty user table.
    pub fn new() -> Result<Self, VmError> {
        Ok(Self {
            root: page_table::alloc_table()?,
        })
    }

    pub fn root_pa(&self) -> PhysAddr {
        self.root
    }

    /// Physical address of the page backing `va`, if `va` has a valid
    /// user-accessible leaf. `va` should be page-aligned; the offset is the
    /// caller's business.
    pub fn walk_addr(&self, va: VirtAddr) -> Option<PhysAddr> {
        if !va.is_canonical() {
            return None;
        }
        // SAFETY: self.root is a live tree owned by this table.
        let pte = unsafe { page_table::walk(self.root, va, false).ok()? };
        // SAFETY: walk returns a pointer into a live table.
        let pte = unsafe { pte.as_ref() };
        if !pte.is_valid() || !pte.is_user() {
            return None;
        }
        Some(pte.addr())
    }

    /// Load the first process's code at VA 0. Only for images smaller than
    /// one page.
    pub fn init_code(&mut self, code: &[u8]) -> Result<(), VmError> {
        if code.len() >= PGSIZE {
            panic!("init_code: image of {} bytes needs a loader", code.len());
        }
        let frame = buddy::alloc_page().map_err(|_| VmError::OutOfMemory)?;
        // SAFETY: fresh frame, exclusively ours until mapped.
        unsafe {
            ptr::write_bytes(frame.as_ptr(), 0, PGSIZE);
            ptr::copy_nonoverlapping(code.as_ptr(), frame.as_ptr(), code.len());
            page_table::map_pages(self.root, VirtAddr::new(0), frame, PGSIZE, PteFlags::USER)?;
        }
        Ok(())
    }

    /// Grow the image from `oldsz` to `newsz`, one zeroed user-RW frame at
    /// a time. Partial progress is rolled back on failure.
    pub fn alloc(&mut self, oldsz: usize, newsz: usize) -> Result<usize, VmError> {
        if newsz < oldsz {
            return Ok(oldsz);
        }
        let mut a = page_round_up(oldsz);
        while a < newsz {
            let frame = match buddy::alloc_page() {
                Ok(frame) => frame,
                Err(_) => {
                    self.dealloc(a, oldsz);
                    return Err(VmError::OutOfMemory);
                }
            };
            // SAFETY: fresh frame; the root tree is live and owned.
            unsafe {
                ptr::write_bytes(frame.as_ptr(), 0, PGSIZE);
                if let Err(e) =
                    page_table::map_pages(self.root, VirtAddr::new(a), frame, PGSIZE, PteFlags::USER)
                {
                    buddy::free_page(frame);
                    self.dealloc(a, oldsz);
                    return Err(e);
                }
            }
            a += PGSIZE;
        }
        Ok(newsz)
    }

    /// Shrink the image from `oldsz` to `newsz`, freeing whole pages no
    /// longer covered. Returns the new size.
    pub fn dealloc(&mut self, oldsz: usize, newsz: usize) -> usize {
        if newsz >= oldsz {
            return oldsz;
        }
        let old_top = page_round_up(oldsz);
        let new_top = page_round_up(newsz);
        if new_top < old_top {
            // SAFETY: the covered range was mapped by alloc/init_code and
            // its frames came from the buddy zone.
            unsafe {
                page_table::unmap_pages(
                    self.root,
                    VirtAddr::new(new_top),
                    (old_top - new_top) / PGSIZE,
                    true,
                );
            }
        }
        newsz
    }

    /// Deep-copy `[0, sz)` into `new` (content and leaf permissions); the
    /// mechanism behind fork. Partial progress in `new` is undone on
    /// failure.
    pub fn copy_to(&self, new: &mut UserPageTable, sz: usize) -> Result<(), VmError> {
        let mut va = 0;
        while va < sz {
            // SAFETY: both roots are live trees owned by their tables.
            let copied = unsafe {
                let pte = match page_table::walk(self.root, VirtAddr::new(va), false) {
                    Ok(pte) => *pte.as_ref(),
                    Err(_) => panic!("uvmcopy: pte should exist at {:#x}", va),
                };
                if !pte.is_valid() {
                    panic!("uvmcopy: page not present at {:#x}", va);
                }
                let perm = pte.flags() & (PteFlags::USER | PteFlags::RO);
                match buddy::alloc_page() {
                    Ok(frame) => {
                        ptr::copy_nonoverlapping(pte.addr().as_ptr(), frame.as_ptr(), PGSIZE);
                        match page_table::map_pages(
                            new.root,
                            VirtAddr::new(va),
                            frame,
                            PGSIZE,
                            perm,
                        ) {
                            Ok(()) => true,
                            Err(_) => {
                                buddy::free_page(frame);
                                false
                            }
                        }
                    }
                    Err(_) => false,
                }
            };
            if !copied {
                // SAFETY: exactly the pages copied so far are mapped in new.
                unsafe {
                    page_table::unmap_pages(new.root, VirtAddr::new(0), va / PGSIZE, true);
                }
                return Err(VmError::OutOfMemory);
            }
            va += PGSIZE;
        }
        Ok(())
    }

    /// Revoke EL0 access to the page holding `va`; used for the stack guard
    /// page under exec.
    pub fn clear_user(&mut self, va: VirtAddr) {
        // SAFETY: the root tree is live and owned.
        let mut pte = match unsafe { page_table::walk(self.root, va, false) } {
            Ok(pte) => pte,
            Err(_) => panic!("clear_user: no mapping at {:#x}", va.as_usize()),
        };
        // SAFETY: walk returns a pointer into a live table.
        unsafe {
            let raw = pte.as_mut();
            *raw = page_table::Pte::leaf(raw.addr(), raw.flags() & !PteFlags::USER);
        }
    }

    /// Copy `src` into user memory at `dstva`.
    pub fn copy_out(&self, dstva: usize, mut src: &[u8]) -> Result<(), VmError> {
        let mut dst = dstva;
        while !src.is_empty() {
            let page = VirtAddr::new(dst).page_round_down();
            let pa = self
                .walk_addr(page)
                .ok_or(VmError::BadUserAccess { va: dst })?;
            let off = dst - page.as_usize();
            let n = (PGSIZE - off).min(src.len());
            // SAFETY: pa is a live user frame; off + n <= PGSIZE.
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), pa.as_ptr().add(off), n) };
            src = &src[n..];
            dst = page.as_usize() + PGSIZE;
        }
        Ok(())
    }

    /// Copy user memory at `srcva` into `dst`.
    pub fn copy_in(&self, dst: &mut [u8], srcva: usize) -> Result<(), VmError> {
        let mut src = srcva;
        let mut copied = 0;
        while copied < dst.len() {
            let page = VirtAddr::new(src).page_round_down();
            let pa = self
                .walk_addr(page)
                .ok_or(VmError::BadUserAccess { va: src })?;
            let off = src - page.as_usize();
            let n = (PGSIZE - off).min(dst.len() - copied);
            // SAFETY: pa is a live user frame; off + n <= PGSIZE.
            unsafe {
                ptr::copy_nonoverlapping(pa.as_ptr().add(off), dst[copied..].as_mut_ptr(), n)
            };
            copied += n;
            src = page.as_usize() + PGSIZE;
        }
        Ok(())
    }

    /// Copy a NUL-terminated string from `srcva` into `dst`, NUL included.
    /// Returns the string length (excluding NUL). Fails if no NUL shows up
    /// within `dst.len()` bytes or the walk faults first.
    pub fn copy_in_str(&self, dst: &mut [u8], srcva: usize) -> Result<usize, VmError> {
        let mut src = srcva;
        let mut copied = 0;
        while copied < dst.len() {
            let page = VirtAddr::new(src).page_round_down();
            let pa = self
                .walk_addr(page)
                .ok_or(VmError::BadUserAccess { va: src })?;
            let off = src - page.as_usize();
            let n = (PGSIZE - off).min(dst.len() - copied);
            // SAFETY: pa is a live user frame; off + n <= PGSIZE.
            let bytes = unsafe { core::slice::from_raw_parts(pa.as_ptr().add(off), n) };
            for &b in bytes {
                dst[copied] = b;
                if b == 0 {
                    return Ok(copied);
                }
                copied += 1;
            }
            src = page.as_usize() + PGSIZE;
        }
        Err(VmError::StringTooLong)
    }

    /// Point this CPU's user translation base at this table.
    pub fn switch_to(&self) {
        // SAFETY: the table stays alive while installed; the scheduler only
        // installs tables of the process it is about to run.
        unsafe { arch::set_user_table(self.root.as_usize()) };
    }

    /// Tear the whole tree down: data leaves first, then table frames.
    pub fn destroy(self) {
        // SAFETY: by ownership no mapping of this tree is installed.
        unsafe { page_table::free_walk(self.root, 0) };
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::test_support::init_test_zone;

    fn space_with(pages: usize) -> UserPageTable {
        init_test_zone();
        let mut pt = UserPageTable::new().expect("user table");
        pt.alloc(0, pages * PGSIZE).expect("grow");
        pt
    }

    #[test]
    fn copy_out_in_round_trip_across_pages() {
        let pt = space_with(3);
        let msg: std::vec::Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        let base = PGSIZE - 100; // straddles two page boundaries
        pt.copy_out(base, &msg).expect("copy_out");

        let mut back = std::vec![0u8; msg.len()];
        pt.copy_in(&mut back, base).expect("copy_in");
        assert_eq!(back, msg);
        pt.destroy();
    }

    #[test]
    fn copy_rejects_unmapped_addresses() {
        let pt = space_with(1);
        let mut buf = [0u8; 16];
        assert!(pt.copy_in(&mut buf, 5 * PGSIZE).is_err());
        assert!(pt.copy_out(5 * PGSIZE, &buf).is_err());
        pt.destroy();
    }

    #[test]
    fn copy_in_str_stops_at_nul() {
        let pt = space_with(2);
        let base = PGSIZE - 3; // NUL lands on the second page
        pt.copy_out(base, b"hello\0trailing").expect("copy_out");

        let mut buf = [0xFFu8; 32];
        let len = pt.copy_in_str(&mut buf, base).expect("copy_in_str");
        assert_eq!(len, 5);
        assert_eq!(&buf[..6], b"hello\0");
        pt.destroy();
    }

    #[test]
    fn copy_in_str_without_nul_fails() {
        let pt = space_with(1);
        pt.copy_out(0, &[b'x'; 64]).expect("copy_out");
        let mut buf = [0u8; 32];
        assert_eq!(pt.copy_in_str(&mut buf, 0), Err(VmError::StringTooLong));
        pt.destroy();
    }

    #[test]
    fn alloc_and_dealloc_adjust_mappings() {
        init_test_zone();
        let mut pt = UserPageTable::new().expect("user table");
        let sz = pt.alloc(0, 3 * PGSIZE).expect("grow");
        assert_eq!(sz, 3 * PGSIZE);
        assert!(pt.walk_addr(VirtAddr::new(2 * PGSIZE)).is_some());

        let sz = pt.dealloc(sz, PGSIZE);
        assert_eq!(sz, PGSIZE);
        assert!(pt.walk_addr(VirtAddr::new(2 * PGSIZE)).is_none());
        assert!(pt.walk_addr(VirtAddr::new(0)).is_some());
        pt.destroy();
    }

    #[test]
    fn fork_copy_is_deep() {
        let parent = space_with(2);
        parent.copy_out(100, b"owned by parent").expect("seed");

        init_test_zone();
        let mut child = UserPageTable::new().expect("child table");
        parent.copy_to(&mut child, 2 * PGSIZE).expect("uvmcopy");

        parent.copy_out(100, b"parent mutated!").expect("mutate");
        let mut buf = [0u8; 15];
        child.copy_in(&mut buf, 100).expect("child read");
        assert_eq!(&buf, b"owned by parent");

        parent.destroy();
        child.destroy();
    }

    #[test]
    fn clear_user_hides_page_from_walk_addr() {
        let mut pt = space_with(2);
        assert!(pt.walk_addr(VirtAddr::new(PGSIZE)).is_some());
        pt.clear_user(VirtAddr::new(PGSIZE));
        assert!(pt.walk_addr(VirtAddr::new(PGSIZE)).is_none());
        pt.destroy();
    }
}

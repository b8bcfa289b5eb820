//! Memory management.
//!
//! Three layers: per-frame metadata plus the buddy allocator ([`buddy`]),
//! the page-table mechanics ([`page_table`]), and per-process user address
//! spaces with the user/kernel copy primitives ([`uvm`]). The kernel half of
//! every address space is an identity map built by the boot collaborator;
//! this module only needs the PA-to-VA rule it established.

pub mod buddy;
pub mod page;
pub mod page_table;
pub mod uvm;

pub use buddy::{alloc_page, alloc_pages, free_page, free_pages, MAX_ORDER};
pub use uvm::UserPageTable;

/// Size of a physical frame.
pub const PGSIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Base of the kernel's identity-mapped half.
pub const KERNEL_BASE: usize = 0xFFFF_0000_0000_0000;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn pfn(&self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    pub const fn from_pfn(pfn: usize) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    /// Kernel-visible pointer to this physical address.
    pub fn as_ptr(&self) -> *mut u8 {
        phys_to_virt(*self)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn page_round_down(&self) -> Self {
        Self(self.0 & !(PGSIZE - 1))
    }

    pub const fn page_round_up(&self) -> Self {
        Self((self.0 + PGSIZE - 1) & !(PGSIZE - 1))
    }

    pub const fn page_offset(&self) -> usize {
        self.0 & (PGSIZE - 1)
    }

    /// Are the high 16 bits a sign extension of bit 47?
    pub const fn is_canonical(&self) -> bool {
        let high = self.0 >> 48;
        high == 0 || high == 0xFFFF
    }
}

pub const fn page_round_up(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn page_round_down(sz: usize) -> usize {
    sz & !(PGSIZE - 1)
}

/// Translate a physical address to a kernel pointer.
///
/// On the board the kernel half is an identity map at `KERNEL_BASE`; on the
/// host, "physical" frames are plain process memory, so the translation is
/// the identity.
#[cfg(target_os = "none")]
pub fn phys_to_virt(pa: PhysAddr) -> *mut u8 {
    (pa.0 + KERNEL_BASE) as *mut u8
}

#[cfg(not(target_os = "none"))]
pub fn phys_to_virt(pa: PhysAddr) -> *mut u8 {
    pa.0 as *mut u8
}

/// Inverse of [`phys_to_virt`] for kernel pointers.
#[cfg(target_os = "none")]
pub fn virt_to_phys(ptr: *const u8) -> PhysAddr {
    PhysAddr(ptr as usize - KERNEL_BASE)
}

#[cfg(not(target_os = "none"))]
pub fn virt_to_phys(ptr: *const u8) -> PhysAddr {
    PhysAddr(ptr as usize)
}

/// Host-test backing store: carve a "physical" region out of the test
/// process and hand it to the global zone once.
#[cfg(not(target_os = "none"))]
pub mod test_support {
    use spin::Once;

    use super::buddy;

    /// Frames donated to the global zone for every host test run.
    const TEST_ZONE_PAGES: usize = 4096; // 16 MiB

    static INIT: Once<()> = Once::new();

    /// Make sure the global buddy zone exists. Idempotent; every test that
    /// allocates frames calls this first.
    pub fn init_test_zone() {
        INIT.call_once(|| {
            use std::alloc::{alloc_zeroed, Layout};

            let bytes = TEST_ZONE_PAGES * super::PGSIZE;
            let layout = Layout::from_size_align(bytes, super::PGSIZE).unwrap();
            // SAFETY: fresh allocation, held for the life of the test
            // process; the zone becomes its sole owner.
            let base = unsafe { alloc_zeroed(layout) };
            assert!(!base.is_null());
            let base_pfn = super::virt_to_phys(base).pfn();
            buddy::init(base_pfn, base_pfn + TEST_ZONE_PAGES);
        });
    }
}

//! Basalt kernel library
//!
//! Core of a small multi-core kernel for a 64-bit ARM board: buddy physical
//! allocator, four-level page tables, a fixed process table with per-CPU
//! round-robin schedulers, and a journaled on-disk filesystem behind an LRU
//! block cache. The library builds for the bare-metal target and for the
//! host, where the standard `#[test]` harness exercises every layer above
//! the architecture primitives.

// Bare metal is freestanding; on the host the crate builds against std so
// the standard #[test] harness drives it.
#![cfg_attr(target_os = "none", no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

// Bare metal: the kernel heap, seeded from the buddy zone during boot.
#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[macro_use]
pub mod print;

pub mod arch;
pub mod console;
pub mod drivers;
pub mod error;
pub mod exec;
pub mod fs;
pub mod klog;
pub mod mm;
pub mod param;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod trap;

pub use error::{KernelError, KernelResult};

/// Hand the bare-metal heap its backing storage. Called once from boot after
/// the buddy zone is up.
///
/// # Safety
///
/// `start..start + size` must be unused, writable kernel memory that stays
/// reserved for the heap forever.
#[cfg(target_os = "none")]
pub unsafe fn heap_init(start: *mut u8, size: usize) {
    unsafe { KERNEL_HEAP.lock().init(start, size) }
}

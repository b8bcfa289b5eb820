//! Kernel entry: bring each core up and hand it to its scheduler.
//!
//! The boot trampoline (an external collaborator) parks the secondaries,
//! sets up EL1, the boot page tables and a stack per core, then calls
//! [`kmain`] on every core. CPU 0 initializes each subsystem in dependency
//! order and releases the others.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
mod boot {
    use core::sync::atomic::{AtomicBool, Ordering};

    use basalt_kernel::fs::device::{self, SdCard};
    use basalt_kernel::mm::{buddy, PGSIZE};
    use basalt_kernel::{arch, console, fs, klog, param, process};

    /// RAM managed by the buddy zone: everything between the kernel image
    /// and the MMIO hole at 1 GiB. The boot collaborator exports the image
    /// end symbol.
    const RAM_TOP: usize = 0x3B00_0000;

    /// Heap carved for Box/Arc allocations (pipes, trees).
    const HEAP_PAGES: usize = 512; // 2 MiB

    static STARTED: AtomicBool = AtomicBool::new(false);

    extern "C" {
        /// End of the kernel image (boot linker script).
        static __kernel_end: u8;
        /// Board collaborators.
        fn board_irq_init();
        fn vectors_init();
        fn board_release_secondaries(entry: usize);
        fn sd_init();
    }

    #[no_mangle]
    pub extern "C" fn kmain() -> ! {
        if arch::cpu_id() == 0 {
            console::init();
            klog::init();
            log::info!("basalt booting");

            // SAFETY: the linker places __kernel_end after .bss; everything
            // from there to RAM_TOP belongs to the allocator.
            let first_free = unsafe { &__kernel_end as *const u8 as usize };
            let begin_pfn = (first_free + PGSIZE - 1) / PGSIZE;
            buddy::init(begin_pfn, RAM_TOP / PGSIZE);

            let heap = buddy::alloc_pages(HEAP_PAGES.trailing_zeros() as usize)
                .expect("boot: heap frames");
            // SAFETY: fresh buddy block, donated to the heap forever.
            unsafe {
                basalt_kernel::heap_init(heap.as_ptr(), HEAP_PAGES * PGSIZE);
                vectors_init();
                board_irq_init();
            }

            arch::timer_init();
            arch::intr_on();

            fs::buffer::binit();
            // SAFETY: collaborator bring-up, once, on CPU 0.
            unsafe { sd_init() };
            device::register(alloc::sync::Arc::new(SdCard::new()));
            fs::inode::iinit();
            fs::file::file_init();

            process::userinit();
            log::info!("basalt boot complete, releasing {} cores", param::NCPU - 1);
            STARTED.store(true, Ordering::Release);
            // SAFETY: secondaries enter at kmain with stacks prepared by
            // the boot collaborator.
            unsafe { board_release_secondaries(kmain as usize) };
        } else {
            while !STARTED.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
            // SAFETY: per-core vector base and timer.
            unsafe { vectors_init() };
            arch::timer_init();
            arch::intr_on();
        }

        log::info!("cpu {} scheduling", arch::cpu_id());
        process::scheduler()
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        // Synchronous path; the machine is going down anyway.
        basalt_kernel::println!("kernel panic: {}", info);
        arch::intr_off();
        loop {
            arch::wait_for_interrupt();
        }
    }
}

/// Host build of the kernel binary only proves the crate links; the kernel
/// library's test suite is the interesting artifact there.
#[cfg(not(target_os = "none"))]
fn main() {
    println!("basalt-kernel: bare-metal image; run the test suite instead");
}

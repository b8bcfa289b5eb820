//! AArch64 implementations of the architecture primitives.
//!
//! System-register access follows the original board port; barriers come
//! from `cortex-a`. Exception vector assembly and board interrupt-controller
//! bring-up are external collaborators (see `trap`), reached through the
//! `extern` declarations at the bottom.

use core::arch::{asm, global_asm};

use cortex_a::asm::barrier;

use super::Context;

/// Index of the calling core, from MPIDR_EL1.
///
/// Only the low 8 affinity bits are read; the board wires its four cores
/// there. Must be called with interrupts off, otherwise the thread may be
/// migrated between reading the register and using the result.
#[inline]
pub fn cpu_id() -> usize {
    let mpidr: u64;
    // SAFETY: reading MPIDR_EL1 has no side effects.
    unsafe { asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack)) };
    (mpidr & 0xff) as usize
}

/// Unmask all exception classes (DAIF cleared).
#[inline]
pub fn intr_on() {
    // SAFETY: flipping DAIF is always permitted at EL1.
    unsafe { asm!("msr daifclr, #0xf", options(nomem, nostack)) };
}

/// Mask all exception classes: debug, SError, IRQ, FIQ.
#[inline]
pub fn intr_off() {
    // SAFETY: flipping DAIF is always permitted at EL1.
    unsafe { asm!("msr daifset, #0xf", options(nomem, nostack)) };
}

/// Are IRQs currently deliverable?
#[inline]
pub fn intr_get() -> bool {
    let daif: u64;
    // SAFETY: reading DAIF has no side effects.
    unsafe { asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack)) };
    daif & (1 << 7) == 0
}

/// Full system barrier: completes all memory accesses before continuing.
#[inline]
pub fn memory_barrier() {
    barrier::dsb(barrier::SY);
}

/// Drop every cached translation on this core.
#[inline]
pub fn flush_tlb_all() {
    // SAFETY: TLB maintenance is idempotent; the barriers order it against
    // surrounding table updates.
    unsafe {
        barrier::dsb(barrier::ISHST);
        asm!("tlbi vmalle1is", options(nomem, nostack));
        barrier::dsb(barrier::ISH);
        barrier::isb(barrier::SY);
    }
}

/// Point TTBR0_EL1 at a new user translation table and invalidate stale
/// entries for the outgoing address space.
///
/// # Safety
///
/// `table_pa` must be the physical address of a valid level-0 table that
/// stays alive while it is installed.
pub unsafe fn set_user_table(table_pa: usize) {
    // SAFETY: contract is on the caller; the ISB makes the new table visible
    // before the first user access.
    unsafe {
        barrier::dsb(barrier::ISHST);
        asm!("msr ttbr0_el1, {}", in(reg) table_pa as u64, options(nomem, nostack));
        asm!("tlbi vmalle1is", options(nomem, nostack));
        barrier::dsb(barrier::ISH);
        barrier::isb(barrier::SY);
    }
}

/// Park the core until something happens.
#[inline]
pub fn wait_for_interrupt() {
    cortex_a::asm::wfe();
}

// ---------------------------------------------------------------------------
// Generic timer (CNTP, non-secure physical)
// ---------------------------------------------------------------------------

const CNTP_CTL_ENABLE: u64 = 1;

/// Ticks of the generic counter per millisecond, latched at init.
static mut TIMER_UNIT: u64 = 0;

/// Program the per-core timer for a 1 ms unit and enable it. The board
/// collaborator routes the CNTPNS IRQ to the core.
pub fn timer_init() {
    let frq: u64;
    // SAFETY: CNTFRQ_EL0 is read-only; CNTP_* writes only affect this core's
    // timer. Called once per core during bring-up, before interrupts are on.
    unsafe {
        asm!("mrs {}, cntfrq_el0", out(reg) frq, options(nomem, nostack));
        TIMER_UNIT = frq / 1000;
        board_route_timer_irq(cpu_id());
        asm!("msr cntp_ctl_el0, {}", in(reg) CNTP_CTL_ENABLE, options(nomem, nostack));
    }
    timer_set_next(crate::trap::TIME_SLICE_MS);
}

/// Arm the next timer interrupt `ms` milliseconds out.
pub fn timer_set_next(ms: u64) {
    // SAFETY: writing the timer compare value only affects this core.
    unsafe {
        let tval = ms * TIMER_UNIT;
        asm!("msr cntp_tval_el0, {}", in(reg) tval, options(nomem, nostack));
    }
}

// ---------------------------------------------------------------------------
// Context switch
// ---------------------------------------------------------------------------

global_asm!(
    r#"
.globl swtch
// swtch(old: *mut Context, new: *const Context)
// Save callee-saved state into *old, restore it from *new. Returning pops
// new's saved x30, so control continues wherever new last called swtch (or
// at the entry point a fresh context was aimed at).
swtch:
    dsb sy
    stp x19, x20, [x0, #0]
    stp x21, x22, [x0, #16]
    stp x23, x24, [x0, #32]
    stp x25, x26, [x0, #48]
    stp x27, x28, [x0, #64]
    stp x29, x30, [x0, #80]
    mrs x9, tpidr_el0
    mov x10, sp
    stp x9, x10, [x0, #96]

    ldp x19, x20, [x1, #0]
    ldp x21, x22, [x1, #16]
    ldp x23, x24, [x1, #32]
    ldp x25, x26, [x1, #48]
    ldp x27, x28, [x1, #64]
    ldp x29, x30, [x1, #80]
    ldp x9, x10, [x1, #96]
    msr tpidr_el0, x9
    mov sp, x10
    ret
"#
);

extern "C" {
    /// Switch kernel contexts. At most one CPU runs a given context at a
    /// time; callers guarantee that by holding the owning process's lock
    /// across the switch.
    pub fn swtch(old: *mut Context, new: *const Context);
}

extern "C" {
    /// Board collaborator: route the non-secure physical timer IRQ to `cpu`.
    fn board_route_timer_irq(cpu: usize);
}

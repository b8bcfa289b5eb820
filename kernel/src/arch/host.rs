//! Host stand-ins for the architecture primitives.
//!
//! Unit tests run on the development machine under the standard test
//! harness, where threads play the role of CPUs: each test thread gets its
//! own simulated interrupt-enable flag (and, via `process::cpu`, its own CPU
//! record), so the nesting and holder invariants checked by the lock layer
//! hold exactly as they would on hardware.

use core::cell::Cell;

use super::Context;

std::thread_local! {
    static INTR_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Index of the simulated CPU. The host has one per thread; identity for
/// lock-holder checks comes from the per-thread CPU record, not this index.
#[inline]
pub fn cpu_id() -> usize {
    0
}

#[inline]
pub fn intr_on() {
    INTR_ENABLED.with(|f| f.set(true));
}

#[inline]
pub fn intr_off() {
    INTR_ENABLED.with(|f| f.set(false));
}

#[inline]
pub fn intr_get() -> bool {
    INTR_ENABLED.with(|f| f.get())
}

#[inline]
pub fn memory_barrier() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

#[inline]
pub fn flush_tlb_all() {}

/// No hardware MMU on the host; mappings are exercised through the
/// page-table walkers directly.
///
/// # Safety
///
/// Trivially safe on the host; mirrors the bare-metal contract.
pub unsafe fn set_user_table(_table_pa: usize) {}

#[inline]
pub fn wait_for_interrupt() {
    std::thread::yield_now();
}

pub fn timer_init() {}

pub fn timer_set_next(_ms: u64) {}

/// Context switching needs a real stack swap; host tests exercise the
/// scheduler's bookkeeping but never switch.
///
/// # Safety
///
/// Never returns; calling it on the host is a test bug.
pub unsafe fn swtch(_old: *mut Context, _new: *const Context) {
    unreachable!("context switch attempted on the host");
}

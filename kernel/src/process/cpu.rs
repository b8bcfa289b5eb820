//! Per-CPU records.
//!
//! Each core owns exactly one `Cpu`: the scheduler coroutine's saved
//! context, the process it is currently running, and the interrupt-mask
//! nesting state used by `push_off`/`pop_off`. Only the owning core ever
//! touches its record, and only with interrupts off, which is what makes the
//! plain `Cell` fields sound.
//!
//! On the host each test thread is its own CPU, so the record lives in
//! thread-local storage; holder identity for spinlocks is the record's
//! address in both worlds.

use core::cell::{Cell, UnsafeCell};

use crate::arch::Context;

/// Per-CPU state.
pub struct Cpu {
    /// Index of the process running on this CPU, if any.
    pub proc: Cell<Option<usize>>,
    /// The scheduler coroutine's saved context; `sched()` switches here.
    pub context: UnsafeCell<Context>,
    /// Depth of `push_off` nesting.
    pub noff: Cell<i32>,
    /// Were interrupts enabled before the first `push_off`?
    pub intena: Cell<bool>,
}

// SAFETY: a Cpu is only accessed by its owning core (or, on the host, its
// owning thread), always with interrupts masked; there is no concurrent
// access to the Cell/UnsafeCell fields.
unsafe impl Sync for Cpu {}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            proc: Cell::new(None),
            context: UnsafeCell::new(Context::zeroed()),
            noff: Cell::new(0),
            intena: Cell::new(false),
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "none")]
static CPUS: [Cpu; crate::param::NCPU] = [const { Cpu::new() }; crate::param::NCPU];

/// This core's record. Interrupts must be off, to prevent a migration
/// between reading the core id and using the result.
#[cfg(target_os = "none")]
pub fn mycpu() -> &'static Cpu {
    &CPUS[crate::arch::cpu_id()]
}

/// Host flavor: one simulated CPU per test thread, allocated on first use
/// and leaked so it can hand out `'static` references like the real array.
#[cfg(not(target_os = "none"))]
pub fn mycpu() -> &'static Cpu {
    use std::boxed::Box;

    std::thread_local! {
        static CPU: Cell<Option<&'static Cpu>> = const { Cell::new(None) };
    }
    CPU.with(|slot| match slot.get() {
        Some(cpu) => cpu,
        None => {
            let cpu: &'static Cpu = &*Box::leak(Box::new(Cpu::new()));
            slot.set(Some(cpu));
            cpu
        }
    })
}

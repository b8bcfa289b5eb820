//! Architecture primitives.
//!
//! Everything the portable kernel needs from the CPU: interrupt masking,
//! core identification, barriers, TLB maintenance, the context-switch
//! primitive and the saved-state layouts. The AArch64 implementation talks
//! to the real system registers; the host implementation simulates one CPU
//! per test thread so the lock and scheduler invariants can be checked by
//! ordinary unit tests.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod aarch64;
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use aarch64 as imp;

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub mod host;
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
use host as imp;

pub use imp::{
    cpu_id, flush_tlb_all, intr_get, intr_off, intr_on, memory_barrier, set_user_table, swtch,
    timer_init, timer_set_next, wait_for_interrupt,
};

/// Saved user-mode CPU state, laid out at the top of the kernel stack by the
/// trap entry collaborator. Field order is fixed by that assembly.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /// x0-x30 general purpose registers.
    pub regs: [u64; 31],
    /// User stack pointer (SP_EL0).
    pub sp: u64,
    /// Faulting/return address (ELR_EL1).
    pub pc: u64,
    /// Saved program status (SPSR_EL1).
    pub pstate: u64,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
        }
    }
}

/// Callee-saved register set for kernel context switches. One per process
/// kernel thread and one per CPU scheduler coroutine; `swtch` saves into one
/// and restores from the other. Field order is fixed by the `swtch` assembly.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    /// Frame pointer.
    pub x29: u64,
    /// Link register: where the first `swtch` into this context returns.
    pub x30: u64,
    pub tpidr_el0: u64,
    /// Kernel stack pointer.
    pub sp: u64,
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            x29: 0,
            x30: 0,
            tpidr_el0: 0,
            sp: 0,
        }
    }
}

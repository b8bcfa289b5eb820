//! Trap dispatch and time.
//!
//! The vector-table assembly (an external collaborator) saves user state
//! into the trap frame at the top of the kernel stack and calls into the
//! `extern "C"` entry points here: synchronous EL0 traps dispatch syscalls,
//! the timer IRQ drives the tick counter and preemption, the UART IRQ
//! feeds the console. CPU 0 owns the global tick count; every core rearms
//! its own timer and yields.

use crate::arch::{self, TrapFrame};
use crate::drivers::uart;
use crate::process::{self, myproc, sleep, wakeup, Proc};
use crate::sync::SpinLock;
use crate::KernelResult;

/// Scheduling quantum.
pub const TIME_SLICE_MS: u64 = 100;

/// Exception class: SVC from AArch64.
const EC_SVC64: u64 = 0x15;

static TICKS: SpinLock<u64> = SpinLock::new("time", 0);

fn ticks_chan() -> usize {
    TICKS.data_ptr() as usize
}

/// Timer ticks since boot.
pub fn uptime() -> u64 {
    *TICKS.lock()
}

/// One tick: bump the counter and wake sleepers. CPU 0 only.
pub fn clock_intr() {
    let mut ticks = TICKS.lock();
    *ticks += 1;
    wakeup(ticks_chan());
}

/// Block the calling process for `n` ticks; a kill cuts the nap short.
pub fn sleep_ticks(n: u64) -> KernelResult<()> {
    let mut ticks = TICKS.lock();
    let t0 = *ticks;
    while *ticks < t0 + n {
        if myproc().map(|p| p.killed()).unwrap_or(false) {
            return Err(crate::KernelError::Killed);
        }
        ticks = sleep(ticks_chan(), ticks);
    }
    Ok(())
}

/// Synchronous trap from EL0. The only legitimate cause is an `svc`; the
/// kill flag is honored on the way in and on the way out.
#[no_mangle]
pub extern "C" fn el0_sync_trap(frame: &mut TrapFrame, esr: u64) {
    let ec = (esr >> 26) & 0x3F;
    let iss = esr & 0x01FF_FFFF;
    if ec != EC_SVC64 || iss != 0 {
        panic!("el0_sync_trap: ec {:#x} iss {:#x} pc {:#x}", ec, iss, frame.pc);
    }

    let p = myproc().expect("el0_sync_trap: no process");
    if p.killed() {
        process::exit(-1);
    }
    // The frame lives at the top of our kernel stack; remember it for the
    // argument helpers.
    // SAFETY: we are the running process.
    unsafe { p.data().trapframe = frame };

    frame.regs[0] = crate::syscall::dispatch(frame) as u64;

    if p.killed() {
        process::exit(-1);
    }
}

/// Synchronous trap taken while in the kernel: always fatal.
#[no_mangle]
pub extern "C" fn el1_sync_trap(esr: u64, elr: u64) {
    panic!(
        "el1_sync_trap: ec {:#x} at {:#x}",
        (esr >> 26) & 0x3F,
        elr
    );
}

/// Non-secure physical timer IRQ. Tick accounting on CPU 0, a fresh slice
/// and a reschedule everywhere.
#[no_mangle]
pub extern "C" fn timer_irq() {
    if arch::cpu_id() == 0 {
        clock_intr();
    }
    arch::timer_set_next(TIME_SLICE_MS);
    process::yield_now();
}

/// UART receive/transmit IRQ.
#[no_mangle]
pub extern "C" fn uart_irq() {
    uart::intr();
}

/// Restore user state from the trap frame and eret. The collaborator
/// assembly owns the register restore.
#[cfg(target_os = "none")]
pub fn user_trap_return(p: &Proc) -> ! {
    // SAFETY: the frame sits at the top of our own kernel stack and holds a
    // complete user context.
    unsafe { trap_return(p.data().trapframe) }
}

#[cfg(not(target_os = "none"))]
pub fn user_trap_return(_p: &Proc) -> ! {
    unreachable!("user return on the host");
}

#[cfg(target_os = "none")]
extern "C" {
    /// Vector-table collaborator: restore a trap frame and eret to EL0.
    fn trap_return(frame: *mut TrapFrame) -> !;
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn clock_ticks_are_monotonic() {
        let before = uptime();
        clock_intr();
        clock_intr();
        assert!(uptime() >= before + 2);
    }
}

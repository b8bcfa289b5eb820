//! Per-CPU scheduling coroutine and the switch into it.
//!
//! Every core runs [`scheduler`] forever: sweep the table round-robin, run
//! anything RUNNABLE, repeat. A process leaves the CPU only through
//! [`sched`], reached via `yield_now`, `sleep` or `exit`, always holding
//! exactly its own slot lock. Lock ownership crosses the switch: the side
//! that resumes drops the guard the other side acquired, which is what the
//! original design does with explicit acquire/release pairs.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::param::{NPROC, ROOTDEV};
use crate::process::cpu::mycpu;
use crate::process::{myproc, proc_by_index, Proc, ProcShared, ProcState};
use crate::sync::SpinLockGuard;

/// Per-CPU scheduler loop. Never returns.
pub fn scheduler() -> ! {
    let c = mycpu();
    c.proc.set(None);
    loop {
        // With every process asleep we would otherwise spin with interrupts
        // off forever; open the window so device interrupts can make
        // something runnable.
        arch::intr_on();

        for idx in 0..NPROC {
            let p = proc_by_index(idx);
            let mut shared = p.shared.lock();
            if shared.state == ProcState::Runnable {
                shared.state = ProcState::Running;
                c.proc.set(Some(idx));
                // SAFETY: we hold p's lock, so no other CPU touches this
                // slot; the page table outlives the run because freeproc
                // also needs the lock.
                unsafe {
                    let data = p.data();
                    data.pagetable
                        .as_ref()
                        .expect("scheduler: runnable process without page table")
                        .switch_to();
                    arch::swtch(c.context.get(), &data.context);
                }
                // The process left via sched() and changed its own state.
                c.proc.set(None);
            }
            drop(shared);
        }
    }
}

/// Switch to this CPU's scheduler context. Caller holds exactly `p`'s lock
/// (as `shared`), has already moved the state off RUNNING, and runs with
/// interrupts masked. The saved interrupt-enable snapshot travels with the
/// kernel thread, not the CPU, so it is restored here after the switch.
pub(crate) fn sched(shared: &mut SpinLockGuard<'_, ProcShared>, p: &Proc) {
    let c = mycpu();
    if !p.shared.holding() {
        panic!("sched: p->lock not held");
    }
    if c.noff.get() != 1 {
        panic!("sched: {} locks held", c.noff.get());
    }
    if shared.state == ProcState::Running {
        panic!("sched: process still running");
    }
    if arch::intr_get() {
        panic!("sched: interruptible");
    }

    let intena = c.intena.get();
    // SAFETY: p's lock is held across the switch; the scheduler context is
    // this CPU's own record.
    unsafe {
        let data = p.data();
        arch::swtch(&mut data.context, c.context.get());
    }
    mycpu().intena.set(intena);
}

/// Voluntarily give up the CPU for one scheduling round.
pub fn yield_now() {
    let Some(p) = myproc() else {
        return;
    };
    let mut shared = p.shared.lock();
    shared.state = ProcState::Runnable;
    sched(&mut shared, p);
    drop(shared);
}

static FIRST_PROCESS: AtomicBool = AtomicBool::new(true);

/// First landing of every new kernel thread, entered from the scheduler's
/// swtch with the slot lock still held on this CPU's behalf.
pub(crate) fn forkret() -> ! {
    let p = myproc().expect("forkret: no process");
    // SAFETY: the scheduler acquired our lock before switching here and no
    // guard object exists on this brand-new stack.
    unsafe { p.shared.force_release() };

    if FIRST_PROCESS.swap(false, Ordering::AcqRel) {
        // Mounting reads the disk, which sleeps, so it cannot happen on the
        // boot path; the first process does it instead.
        crate::fs::fsinit(ROOTDEV);
    }

    crate::trap::user_trap_return(p)
}

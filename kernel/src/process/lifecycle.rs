//! Process creation and teardown: allocproc/freeproc, fork, exit, wait,
//! the first user process, and heap growth.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::TrapFrame;
use crate::error::KernelError;
use crate::fs;
use crate::mm::{buddy, phys_to_virt, virt_to_phys, PGSIZE};
use crate::param::{KSTACK_PAGES, NOFILE, NPROC};
use crate::process::scheduler::{forkret, sched};
use crate::process::{
    alloc_pid, myproc, proc_by_index, proc_index, Proc, ProcShared, ProcState, PROC, WAIT_LOCK,
};
use crate::sync::SpinLockGuard;
use crate::KernelResult;

/// Slot index of the init process; parentless children are rehomed here.
static INIT_IDX: AtomicUsize = AtomicUsize::new(usize::MAX);

/// First user program: exec("/init", ["/init"]), exit(-1) in a loop if that
/// ever returns. Hand-assembled AArch64, loaded at VA 0.
///
/// ```text
///   adr  x0, path        // 0x00
///   adr  x1, argv        // 0x04
///   mov  x8, #1          // 0x08  SYS_exec
///   svc  #0              // 0x0c
/// fail:
///   mov  x8, #2          // 0x10  SYS_exit
///   movn x0, #0          // 0x14  status = -1
///   svc  #0              // 0x18
///   b    fail            // 0x1c
/// path:
///   .asciz "/init"       // 0x20
/// argv:
///   .quad path           // 0x28
///   .quad 0              // 0x30
/// ```
#[rustfmt::skip]
const INITCODE: [u8; 0x38] = [
    0x00, 0x01, 0x00, 0x10, // adr x0, #0x20
    0x21, 0x01, 0x00, 0x10, // adr x1, #0x24
    0x28, 0x00, 0x80, 0xd2, // mov x8, #1
    0x01, 0x00, 0x00, 0xd4, // svc #0
    0x48, 0x00, 0x80, 0xd2, // mov x8, #2
    0x00, 0x00, 0x80, 0x92, // movn x0, #0
    0x01, 0x00, 0x00, 0xd4, // svc #0
    0xfd, 0xff, 0xff, 0x17, // b #-12
    0x2f, 0x69, 0x6e, 0x69, // "/ini"
    0x74, 0x00, 0x00, 0x00, // "t\0"
    0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // argv[0] = 0x20
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // argv[1] = NULL
];

/// Claim an UNUSED slot: fresh pid, kernel stack, trap-frame slot, empty
/// page table, and a context aimed at `forkret`. Returns the slot index and
/// its held lock, like the original.
pub(crate) fn allocproc() -> KernelResult<(usize, SpinLockGuard<'static, ProcShared>)> {
    for idx in 0..NPROC {
        let p = proc_by_index(idx);
        let mut shared = p.shared.lock();
        if shared.state != ProcState::Unused {
            continue;
        }
        shared.pid = alloc_pid();
        shared.state = ProcState::Embryo;

        // SAFETY: slot lock held and state was UNUSED; nobody else
        // references the private half.
        let data = unsafe { p.data() };

        let kstack = match buddy::alloc_pages(KSTACK_PAGES.trailing_zeros() as usize) {
            Ok(pa) => phys_to_virt(pa) as usize,
            Err(e) => {
                freeproc(p, &mut shared);
                return Err(e.into());
            }
        };
        data.kstack = kstack;
        let top = kstack + KSTACK_PAGES * PGSIZE;
        data.trapframe = ((top - core::mem::size_of::<TrapFrame>()) & !0xF) as *mut TrapFrame;

        match crate::mm::UserPageTable::new() {
            Ok(pt) => data.pagetable = Some(pt),
            Err(e) => {
                freeproc(p, &mut shared);
                return Err(e.into());
            }
        }

        // First switch into this thread lands in forkret on its own stack.
        data.context = crate::arch::Context::zeroed();
        data.context.x29 = data.trapframe as u64;
        data.context.sp = data.trapframe as u64;
        data.context.x30 = forkret_entry() as u64;

        return Ok((idx, shared));
    }
    Err(KernelError::NoProcess)
}

fn forkret_entry() -> usize {
    let f: fn() -> ! = forkret;
    f as usize
}

/// Return a slot to UNUSED, releasing the kernel stack, page table and user
/// pages. The slot lock must be held; open files and cwd must already be
/// gone (exit drops them).
pub(crate) fn freeproc(p: &Proc, shared: &mut ProcShared) {
    // SAFETY: slot lock held and the process is off-CPU for good.
    let data = unsafe { p.data() };
    data.trapframe = core::ptr::null_mut();
    if data.kstack != 0 {
        buddy::free_pages(
            virt_to_phys(data.kstack as *const u8),
            KSTACK_PAGES.trailing_zeros() as usize,
        );
        data.kstack = 0;
    }
    if let Some(pt) = data.pagetable.take() {
        pt.destroy();
    }
    data.sz = 0;
    data.name = [0; 16];
    p.set_parent(None);

    shared.chan = 0;
    shared.killed = false;
    shared.xstate = 0;
    shared.pid = 0;
    shared.state = ProcState::Unused;
}

/// Build pid 1 around the embedded initcode stub and make it runnable.
/// CPU 0, once, at the end of boot.
pub fn userinit() {
    let (idx, mut shared) = allocproc().expect("userinit: no process slot");
    INIT_IDX.store(idx, Ordering::Release);
    let p = proc_by_index(idx);

    // SAFETY: slot lock held, state EMBRYO.
    let data = unsafe { p.data() };
    data.pagetable
        .as_mut()
        .expect("userinit: page table")
        .init_code(&INITCODE)
        .expect("userinit: initcode image");
    data.sz = PGSIZE;

    // SAFETY: trapframe points into our fresh kernel stack.
    unsafe {
        *data.trapframe = TrapFrame::zeroed();
        (*data.trapframe).sp = PGSIZE as u64; // user stack at the page top
        (*data.trapframe).pc = 0; // entry of initcode
    }
    data.set_name("initcode");
    data.cwd = Some(fs::path::namei(b"/").expect("userinit: root inode"));

    shared.state = ProcState::Runnable;
    drop(shared);
}

/// Create a copy of the calling process. Returns the child pid to the
/// caller; the child wakes up in forkret with 0 in its return register.
pub fn fork() -> KernelResult<u32> {
    let p = myproc().ok_or(KernelError::NoProcess)?;
    // SAFETY: we are the running process; the private half is ours.
    let pdata = unsafe { p.data() };

    let (child_idx, mut child_shared) = allocproc()?;
    let child = proc_by_index(child_idx);
    // SAFETY: child lock held, state EMBRYO.
    let cdata = unsafe { child.data() };

    if let Err(e) = pdata
        .pagetable
        .as_ref()
        .expect("fork: parent page table")
        .copy_to(cdata.pagetable.as_mut().expect("fork: child page table"), pdata.sz)
    {
        freeproc(child, &mut child_shared);
        drop(child_shared);
        return Err(e.into());
    }
    cdata.sz = pdata.sz;

    // SAFETY: both trap frames live at the tops of their kernel stacks.
    unsafe {
        *cdata.trapframe = *pdata.trapframe;
        // Child observes fork() == 0.
        (*cdata.trapframe).regs[0] = 0;
    }

    for fd in 0..NOFILE {
        if let Some(f) = pdata.ofile[fd].as_ref() {
            cdata.ofile[fd] = Some(fs::file::dup(f));
        }
    }
    cdata.cwd = pdata.cwd.map(fs::inode::idup);
    cdata.name = pdata.name;

    let child_pid = child_shared.pid;
    drop(child_shared);

    {
        let _wl = WAIT_LOCK.lock();
        child.set_parent(Some(proc_index(p)));
    }

    child.shared.lock().state = ProcState::Runnable;

    Ok(child_pid)
}

/// Rehome `parent_idx`'s children onto init. Caller holds the wait lock.
fn reparent(parent_idx: usize) {
    let init_idx = INIT_IDX.load(Ordering::Acquire);
    for child in PROC.iter() {
        if child.parent() == Some(parent_idx) {
            child.set_parent(Some(init_idx));
            crate::process::wakeup(proc_by_index(init_idx).chan());
        }
    }
}

/// Terminate the calling process with `status`. Never returns; the slot
/// lingers as a ZOMBIE until the parent reaps it.
pub fn exit(status: i32) -> ! {
    let p = myproc().expect("exit: no process");
    let idx = proc_index(p);
    if idx == INIT_IDX.load(Ordering::Acquire) {
        panic!("init exiting with status {}", status);
    }

    // SAFETY: we are the running process.
    let data = unsafe { p.data() };
    for fd in 0..NOFILE {
        if let Some(f) = data.ofile[fd].take() {
            fs::file::close(f);
        }
    }
    if let Some(cwd) = data.cwd.take() {
        fs::log::begin_op();
        fs::inode::iput(cwd);
        fs::log::end_op();
    }

    let wl = WAIT_LOCK.lock();
    reparent(idx);
    if let Some(parent_idx) = p.parent() {
        crate::process::wakeup(proc_by_index(parent_idx).chan());
    }

    let mut shared = p.shared.lock();
    shared.xstate = status;
    shared.state = ProcState::Zombie;
    drop(wl);

    // Holding our own lock; the reaping parent takes it before reading
    // state, so the transition and the wake cannot be missed.
    sched(&mut shared, p);
    unreachable!("zombie returned to exit");
}

/// Wait for any child to become a ZOMBIE; reap it and return its pid. The
/// exit status is copied out to `status_addr` in the caller's address space
/// when given.
pub fn wait(status_addr: Option<usize>) -> KernelResult<u32> {
    let p = myproc().ok_or(KernelError::NoProcess)?;
    let my_idx = proc_index(p);

    let mut wl = WAIT_LOCK.lock();
    loop {
        let mut have_kids = false;
        for idx in 0..NPROC {
            let np = proc_by_index(idx);
            if np.parent() != Some(my_idx) {
                continue;
            }
            // The parent link cannot change between the check and the lock:
            // only the parent (us) rewrites it, and exit's reparent runs
            // under the wait lock we hold.
            have_kids = true;
            let mut shared = np.shared.lock();
            if shared.state == ProcState::Zombie {
                let pid = shared.pid;
                if let Some(addr) = status_addr {
                    let xstate = shared.xstate as i64;
                    // SAFETY: we are the running process.
                    let pdata = unsafe { p.data() };
                    if pdata
                        .pagetable
                        .as_ref()
                        .expect("wait: page table")
                        .copy_out(addr, &xstate.to_le_bytes())
                        .is_err()
                    {
                        drop(shared);
                        return Err(KernelError::Vm(crate::error::VmError::BadUserAccess {
                            va: addr,
                        }));
                    }
                }
                freeproc(np, &mut shared);
                return Ok(pid);
            }
        }

        if !have_kids || p.killed() {
            return Err(KernelError::NoProcess);
        }
        // Sleep on our own slot identity; exiting children wake it.
        wl = crate::process::sleep(p.chan(), wl);
    }
}

/// Grow (or shrink) the user heap by `n` bytes.
pub fn growproc(n: i64) -> KernelResult<()> {
    let p = myproc().ok_or(KernelError::NoProcess)?;
    // SAFETY: we are the running process.
    let data = unsafe { p.data() };
    let pt = data.pagetable.as_mut().expect("growproc: page table");
    let sz = data.sz;
    let newsz = if n >= 0 {
        pt.alloc(sz, sz + n as usize)?
    } else {
        let shrink = (-n) as usize;
        pt.dealloc(sz, sz.saturating_sub(shrink))
    };
    data.sz = newsz;
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::test_support::init_test_zone;

    #[test]
    fn allocproc_builds_an_embryo() {
        let _slots = crate::process::test_support::table_gate();
        init_test_zone();
        let (idx, shared) = allocproc().expect("slot");
        assert_eq!(shared.state, ProcState::Embryo);
        assert!(shared.pid > 0);

        let p = proc_by_index(idx);
        // SAFETY: slot lock held.
        let data = unsafe { p.data() };
        assert_ne!(data.kstack, 0);
        assert!(!data.trapframe.is_null());
        assert!(data.pagetable.is_some());
        // Trap frame sits inside the two-page kernel stack.
        let tf = data.trapframe as usize;
        assert!(tf > data.kstack && tf < data.kstack + KSTACK_PAGES * PGSIZE);

        let mut shared = shared;
        freeproc(p, &mut shared);
        assert_eq!(shared.state, ProcState::Unused);
    }

    #[test]
    fn freed_slot_is_reusable_and_pids_never_recycle() {
        let _slots = crate::process::test_support::table_gate();
        init_test_zone();
        let (idx, mut shared) = allocproc().expect("first");
        let first_pid = shared.pid;
        freeproc(proc_by_index(idx), &mut shared);
        drop(shared);

        let (idx2, mut shared2) = allocproc().expect("second");
        assert!(shared2.pid > first_pid);
        freeproc(proc_by_index(idx2), &mut shared2);
    }

    #[test]
    fn creating_past_nproc_fails_cleanly() {
        let _slots = crate::process::test_support::table_gate();
        init_test_zone();
        let mut held = std::vec::Vec::new();
        loop {
            match allocproc() {
                Ok(slot) => held.push(slot),
                Err(KernelError::NoProcess) => break,
                Err(e) => panic!("allocproc failed with {}", e),
            }
        }
        assert_eq!(held.len(), NPROC, "whole table claimed");
        assert!(matches!(allocproc(), Err(KernelError::NoProcess)));

        for (idx, mut shared) in held {
            freeproc(proc_by_index(idx), &mut shared);
        }
        let (idx, mut shared) = allocproc().expect("table usable again");
        freeproc(proc_by_index(idx), &mut shared);
    }
}

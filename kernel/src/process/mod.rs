//! Process table, wait channels, and cancellation.
//!
//! A fixed array of NPROC slots. Each slot splits in three according to who
//! may touch what:
//!
//! * `shared` (state, channel, killed, exit status, pid): any CPU, under
//!   the slot's spinlock;
//! * `parent`: a weak index into the table, only read or written under the
//!   global wait lock;
//! * `data` (kernel stack, size, page table, trap frame, saved context,
//!   open files, cwd, name): private to the running process, or to a CPU
//!   that holds the slot's lock while the process cannot run.
//!
//! Wait channels are opaque `usize` identities matched by equality; sleepers
//! park in [`sleep`] and wakers sweep the table in [`wakeup`].

pub mod cpu;
pub mod lifecycle;
pub mod scheduler;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use lazy_static::lazy_static;

use crate::arch::{Context, TrapFrame};
use crate::error::KernelError;
use crate::fs::file::FileRef;
use crate::fs::inode::Iref;
use crate::mm::UserPageTable;
use crate::param::{NOFILE, NPROC};
use crate::sync::{SpinLock, SpinLockGuard};
use crate::KernelResult;

pub use lifecycle::{exit, fork, growproc, userinit, wait};
pub use scheduler::{scheduler, yield_now};

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    /// Slot claimed, resources still being attached.
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Lock-protected part of a process slot.
pub struct ProcShared {
    pub state: ProcState,
    /// Wait channel this process sleeps on; 0 when awake.
    pub chan: usize,
    /// Cooperative kill flag, checked at every user-trap boundary.
    pub killed: bool,
    /// Exit status delivered to the parent's wait().
    pub xstate: i32,
    pub pid: u32,
}

/// Private part of a process slot. See the module comment for the access
/// rule.
pub struct ProcData {
    /// Kernel VA of the two-frame kernel stack; 0 when unallocated.
    pub kstack: usize,
    /// User image size in bytes.
    pub sz: usize,
    pub pagetable: Option<UserPageTable>,
    /// Trap frame at the top of the kernel stack.
    pub trapframe: *mut TrapFrame,
    /// Saved callee-save context of the kernel thread.
    pub context: Context,
    pub ofile: [Option<FileRef>; NOFILE],
    pub cwd: Option<Iref>,
    pub name: [u8; 16],
}

impl ProcData {
    fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            pagetable: None,
            trapframe: core::ptr::null_mut(),
            context: Context::zeroed(),
            ofile: [const { None }; NOFILE],
            cwd: None,
            name: [0; 16],
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(self.name.len() - 1);
        self.name[..n].copy_from_slice(&bytes[..n]);
        self.name[n..].fill(0);
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }
}

/// Sentinel in the parent field: no parent.
const NO_PARENT: usize = usize::MAX;

/// One process slot.
pub struct Proc {
    pub shared: SpinLock<ProcShared>,
    /// Parent slot index; mutated only under the wait lock.
    parent: AtomicUsize,
    data: UnsafeCell<ProcData>,
}

// SAFETY: `shared` is lock-protected; `parent` is atomic and ordered by the
// wait lock; `data` follows the private-to-the-process rule documented on
// the module, which never admits two concurrent accessors.
unsafe impl Sync for Proc {}
unsafe impl Send for Proc {}

impl Proc {
    fn new() -> Self {
        Self {
            shared: SpinLock::new(
                "proc",
                ProcShared {
                    state: ProcState::Unused,
                    chan: 0,
                    killed: false,
                    xstate: 0,
                    pid: 0,
                },
            ),
            parent: AtomicUsize::new(NO_PARENT),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    /// The private half of the slot.
    ///
    /// # Safety
    ///
    /// Caller must be the running process itself, or hold `shared` while
    /// the process is not running (allocproc, freeproc, fork, scheduler).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data(&self) -> &mut ProcData {
        // SAFETY: exclusivity is the caller's contract, above.
        unsafe { &mut *self.data.get() }
    }

    pub fn pid(&self) -> u32 {
        self.shared.lock().pid
    }

    pub fn killed(&self) -> bool {
        self.shared.lock().killed
    }

    pub fn set_killed(&self) {
        self.shared.lock().killed = true;
    }

    /// Parent slot index. Callers ordering against exit/wait must hold the
    /// wait lock.
    pub fn parent(&self) -> Option<usize> {
        match self.parent.load(Ordering::Acquire) {
            NO_PARENT => None,
            idx => Some(idx),
        }
    }

    pub(crate) fn set_parent(&self, parent: Option<usize>) {
        self.parent
            .store(parent.unwrap_or(NO_PARENT), Ordering::Release);
    }

    /// Wait-channel identity of this slot.
    pub fn chan(&self) -> usize {
        self as *const Proc as usize
    }
}

lazy_static! {
    /// The process table.
    static ref PROC: [Proc; NPROC] = core::array::from_fn(|_| Proc::new());

    /// Orders "reparent + go ZOMBIE + wake parent" against "scan + sleep"
    /// (the parent-then-child rule).
    pub static ref WAIT_LOCK: SpinLock<()> = SpinLock::new("wait", ());

    /// Monotonic pid source.
    static ref NEXT_PID: SpinLock<u32> = SpinLock::new("pid", 1);
}

pub(crate) fn alloc_pid() -> u32 {
    let mut next = NEXT_PID.lock();
    let pid = *next;
    *next += 1;
    pid
}

/// Shared access to a slot by index.
pub fn proc_by_index(idx: usize) -> &'static Proc {
    &PROC[idx]
}

/// Index of a slot within the table.
pub fn proc_index(p: &Proc) -> usize {
    let base = PROC.as_ptr() as usize;
    let off = p as *const Proc as usize - base;
    off / core::mem::size_of::<Proc>()
}

/// The process running on this CPU, if any.
pub fn myproc() -> Option<&'static Proc> {
    crate::sync::push_off();
    let idx = cpu::mycpu().proc.get();
    crate::sync::pop_off();
    idx.map(|i| &PROC[i])
}

/// Atomically release `guard`'s lock and sleep on `chan`; reacquires the
/// lock before returning. The lost-wakeup race is closed by holding the
/// process's own lock from before the outer lock is dropped until the
/// scheduler switch.
pub fn sleep<'a, T: ?Sized>(chan: usize, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
    let p = myproc().expect("sleep: no process");
    let lk = guard.spinlock();

    let mut shared = p.shared.lock();
    drop(guard);

    shared.chan = chan;
    shared.state = ProcState::Sleeping;

    scheduler::sched(&mut shared, p);

    shared.chan = 0;
    drop(shared);

    lk.lock()
}

/// Make every process sleeping on `chan` runnable. The channel is not
/// cleared here; that is the sleeper's job on its way out of [`sleep`].
pub fn wakeup(chan: usize) {
    let me = myproc().map(|p| p as *const Proc);
    for p in PROC.iter() {
        if me == Some(p as *const Proc) {
            continue;
        }
        let mut shared = p.shared.lock();
        if shared.state == ProcState::Sleeping && shared.chan == chan {
            shared.state = ProcState::Runnable;
        }
    }
}

/// Flag `pid` as killed; a sleeper is promoted to RUNNABLE so it can notice.
/// The victim exits at its next user-trap boundary.
pub fn kill(pid: u32) -> KernelResult<()> {
    for p in PROC.iter() {
        let mut shared = p.shared.lock();
        if shared.state != ProcState::Unused && shared.pid == pid {
            shared.killed = true;
            if shared.state == ProcState::Sleeping {
                shared.state = ProcState::Runnable;
            }
            return Ok(());
        }
    }
    Err(KernelError::ProcessNotFound { pid })
}

/// Console ^P: one line per live slot.
pub fn proc_dump() {
    println!();
    for p in PROC.iter() {
        let (state, pid) = {
            let shared = p.shared.lock();
            (shared.state, shared.pid)
        };
        if state == ProcState::Unused {
            continue;
        }
        // SAFETY: name is written once at creation and read-only after.
        let name = unsafe { p.data() }.name_str();
        println!("{:>3} {:<9} {}", pid, state_name(state), name);
    }
}

fn state_name(state: ProcState) -> &'static str {
    match state {
        ProcState::Unused => "unused",
        ProcState::Embryo => "embryo",
        ProcState::Sleeping => "sleep",
        ProcState::Runnable => "runnable",
        ProcState::Running => "run",
        ProcState::Zombie => "zombie",
    }
}

/// Serialize host tests that consume process-table slots, so a test that
/// deliberately fills the table cannot starve its neighbors.
#[cfg(not(target_os = "none"))]
pub mod test_support {
    pub fn table_gate() -> std::sync::MutexGuard<'static, ()> {
        static GATE: std::sync::Mutex<()> = std::sync::Mutex::new(());
        GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn pids_are_monotonic() {
        let a = alloc_pid();
        let b = alloc_pid();
        assert!(b > a);
    }

    #[test]
    fn proc_index_inverts_lookup() {
        for i in [0, 1, NPROC - 1] {
            assert_eq!(proc_index(proc_by_index(i)), i);
        }
    }

    #[test]
    fn kill_flags_target_and_wakes_sleeper() {
        let _slots = test_support::table_gate();
        crate::mm::test_support::init_test_zone();
        let (idx, mut shared) = lifecycle::allocproc().expect("slot");
        let pid = shared.pid;
        shared.state = ProcState::Sleeping;
        shared.chan = 0xDEAD;
        drop(shared);

        kill(pid).expect("kill by pid");

        let p = proc_by_index(idx);
        {
            let shared = p.shared.lock();
            assert!(shared.killed);
            assert_eq!(shared.state, ProcState::Runnable);
            assert_eq!(shared.chan, 0xDEAD, "kill must not clear the channel");
        }

        let mut shared = p.shared.lock();
        lifecycle::freeproc(p, &mut shared);
    }

    #[test]
    fn kill_unknown_pid_fails() {
        assert!(kill(0xFFFF_FF00).is_err());
    }

    #[test]
    fn wakeup_moves_matching_sleepers_only() {
        let _slots = test_support::table_gate();
        crate::mm::test_support::init_test_zone();
        let (ai, mut a) = lifecycle::allocproc().expect("a");
        a.state = ProcState::Sleeping;
        a.chan = 0x111;
        drop(a);
        let (bi, mut b) = lifecycle::allocproc().expect("b");
        b.state = ProcState::Sleeping;
        b.chan = 0x222;
        drop(b);

        wakeup(0x111);

        assert_eq!(
            proc_by_index(ai).shared.lock().state,
            ProcState::Runnable,
            "matching channel woke"
        );
        assert_eq!(
            proc_by_index(bi).shared.lock().state,
            ProcState::Sleeping,
            "other channel untouched"
        );

        for i in [ai, bi] {
            let p = proc_by_index(i);
            let mut shared = p.shared.lock();
            lifecycle::freeproc(p, &mut shared);
        }
    }
}

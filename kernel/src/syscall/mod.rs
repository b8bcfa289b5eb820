//! System call dispatch.
//!
//! The trap entry leaves the syscall number in x8 and up to six arguments
//! in x0..x5; the return value goes back through x0. Handlers fetch their
//! arguments with the helpers here, which never dereference user pointers
//! directly: pointers are bounds-checked against the image size with
//! overflow-checked arithmetic, and strings are copied out through the user
//! page table. Recoverable errors flatten to -1 at this boundary; an
//! unknown syscall number is an invariant violation in this design.

mod sysfile;
mod sysproc;

use crate::arch::TrapFrame;
use crate::error::SyscallError;
use crate::fs::file::FileRef;
use crate::param::MAXPATH;
use crate::process::myproc;
use crate::KernelResult;

pub const SYS_EXEC: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_GETPID: usize = 3;
pub const SYS_FORK: usize = 4;
pub const SYS_WAIT: usize = 5;
pub const SYS_PIPE: usize = 6;
pub const SYS_YIELD: usize = 7;
pub const SYS_CHDIR: usize = 8;
pub const SYS_KILL: usize = 9;
pub const SYS_SBRK: usize = 10;
pub const SYS_UPTIME: usize = 11;
pub const SYS_SLEEP: usize = 12;
pub const SYS_FSTAT: usize = 13;
pub const SYS_MKNOD: usize = 14;
pub const SYS_MKDIR: usize = 15;
pub const SYS_OPEN: usize = 16;
pub const SYS_CLOSE: usize = 17;
pub const SYS_READ: usize = 18;
pub const SYS_WRITE: usize = 19;
pub const SYS_DUP: usize = 20;
pub const SYS_LINK: usize = 21;
pub const SYS_UNLINK: usize = 22;

type Handler = fn() -> KernelResult<i64>;

static SYSCALLS: [Option<(&str, Handler)>; 23] = [
    None,
    Some(("exec", sysfile::sys_exec)),
    Some(("exit", sysproc::sys_exit)),
    Some(("getpid", sysproc::sys_getpid)),
    Some(("fork", sysproc::sys_fork)),
    Some(("wait", sysproc::sys_wait)),
    Some(("pipe", sysfile::sys_pipe)),
    Some(("yield", sysproc::sys_yield)),
    Some(("chdir", sysfile::sys_chdir)),
    Some(("kill", sysproc::sys_kill)),
    Some(("sbrk", sysproc::sys_sbrk)),
    Some(("uptime", sysproc::sys_uptime)),
    Some(("sleep", sysproc::sys_sleep)),
    Some(("fstat", sysfile::sys_fstat)),
    Some(("mknod", sysfile::sys_mknod)),
    Some(("mkdir", sysfile::sys_mkdir)),
    Some(("open", sysfile::sys_open)),
    Some(("close", sysfile::sys_close)),
    Some(("read", sysfile::sys_read)),
    Some(("write", sysfile::sys_write)),
    Some(("dup", sysfile::sys_dup)),
    Some(("link", sysfile::sys_link)),
    Some(("unlink", sysfile::sys_unlink)),
];

/// Route one trap to its handler; the return value replaces x0.
pub fn dispatch(frame: &TrapFrame) -> i64 {
    let num = frame.regs[8] as usize;
    match SYSCALLS.get(num).copied().flatten() {
        Some((name, handler)) => match handler() {
            Ok(value) => value,
            Err(e) => {
                ::log::debug!("{} failed: {}", name, e);
                -1
            }
        },
        None => panic!("syscall: unsupported number {}", num),
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn trapframe() -> &'static TrapFrame {
    let p = myproc().expect("syscall: no process");
    // SAFETY: we are the running process; the frame was parked on our
    // kernel stack by the trap entry.
    unsafe { &*p.data().trapframe }
}

/// Raw n-th argument register.
fn arg_raw(n: usize) -> KernelResult<u64> {
    if n > 5 {
        return Err(SyscallError::InvalidArgument { arg: n }.into());
    }
    Ok(trapframe().regs[n])
}

/// N-th argument as a signed integer, unchanged.
pub fn arg_int(n: usize) -> KernelResult<i64> {
    arg_raw(n).map(|v| v as i64)
}

/// N-th argument as a user pointer to `size` bytes, validated against the
/// image bounds with overflow-checked arithmetic.
pub fn arg_ptr(n: usize, size: usize) -> KernelResult<usize> {
    let addr = arg_raw(n)? as usize;
    let p = myproc().expect("syscall: no process");
    // SAFETY: we are the running process.
    let sz = unsafe { p.data() }.sz;
    match addr.checked_add(size) {
        Some(end) if end <= sz => Ok(addr),
        _ => Err(SyscallError::InvalidPointer { addr }.into()),
    }
}

/// N-th argument as a NUL-terminated user string, copied into `buf`.
/// Returns its length.
pub fn arg_str(n: usize, buf: &mut [u8]) -> KernelResult<usize> {
    let addr = arg_raw(n)? as usize;
    fetch_str(addr, buf)
}

/// Copy a NUL-terminated string out of user memory.
pub fn fetch_str(addr: usize, buf: &mut [u8]) -> KernelResult<usize> {
    let p = myproc().expect("syscall: no process");
    // SAFETY: we are the running process.
    let data = unsafe { p.data() };
    let len = data
        .pagetable
        .as_ref()
        .expect("syscall: no page table")
        .copy_in_str(buf, addr)
        .map_err(|_| SyscallError::StringTooLong { max: MAXPATH })?;
    Ok(len)
}

/// Fetch a u64 from user memory (argv walking).
pub fn fetch_u64(addr: usize) -> KernelResult<u64> {
    let p = myproc().expect("syscall: no process");
    // SAFETY: we are the running process.
    let data = unsafe { p.data() };
    if addr.checked_add(8).map(|end| end > data.sz).unwrap_or(true) {
        return Err(SyscallError::InvalidPointer { addr }.into());
    }
    let mut raw = [0u8; 8];
    data.pagetable
        .as_ref()
        .expect("syscall: no page table")
        .copy_in(&mut raw, addr)
        .map_err(|_| SyscallError::InvalidPointer { addr })?;
    Ok(u64::from_le_bytes(raw))
}

/// N-th argument as an open descriptor of the calling process.
pub fn arg_fd(n: usize) -> KernelResult<(usize, &'static FileRef)> {
    let fd = arg_raw(n)? as usize;
    let p = myproc().expect("syscall: no process");
    // SAFETY: we are the running process.
    let data = unsafe { p.data() };
    match data.ofile.get(fd).and_then(|f| f.as_ref()) {
        Some(file) => Ok((fd, file)),
        None => Err(crate::error::FsError::BadFileDescriptor.into()),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::PGSIZE;
    use crate::process::{self, lifecycle, proc_by_index, ProcState};

    /// Fabricate a current process with one mapped page and a trap frame,
    /// run `body`, then tear everything down.
    fn with_fake_process(setup: impl FnOnce(&mut TrapFrame), body: impl FnOnce()) {
        let _slots = process::test_support::table_gate();
        crate::mm::test_support::init_test_zone();
        let (idx, mut shared) = lifecycle::allocproc().expect("slot");
        shared.state = ProcState::Running;
        drop(shared);
        let p = proc_by_index(idx);
        // SAFETY: test owns the slot end to end.
        let data = unsafe { p.data() };
        data.sz = data
            .pagetable
            .as_mut()
            .unwrap()
            .alloc(0, PGSIZE)
            .expect("one user page");
        // SAFETY: points into our fresh kernel stack.
        unsafe {
            *data.trapframe = TrapFrame::zeroed();
            setup(&mut *data.trapframe);
        }
        process::cpu::mycpu().proc.set(Some(idx));

        body();

        process::cpu::mycpu().proc.set(None);
        let mut shared = p.shared.lock();
        lifecycle::freeproc(p, &mut shared);
    }

    #[test]
    fn arg_int_passes_registers_through() {
        with_fake_process(
            |tf| {
                tf.regs[0] = 42;
                tf.regs[3] = (-7i64) as u64;
            },
            || {
                assert_eq!(arg_int(0).expect("arg 0"), 42);
                assert_eq!(arg_int(3).expect("arg 3"), -7);
                assert!(arg_int(6).is_err(), "only six argument registers");
            },
        );
    }

    #[test]
    fn arg_ptr_checks_bounds_and_overflow() {
        with_fake_process(
            |tf| {
                tf.regs[0] = 100;
                tf.regs[1] = (PGSIZE - 4) as u64;
                tf.regs[2] = u64::MAX - 2;
            },
            || {
                assert_eq!(arg_ptr(0, 16).expect("in range"), 100);
                assert!(arg_ptr(1, 8).is_err(), "tail past the image");
                assert!(arg_ptr(2, 8).is_err(), "address arithmetic overflow");
            },
        );
    }

    /// The whole stack at once: dispatch reads arguments out of the trap
    /// frame, copies through the user page table, runs the fs layers under
    /// transactions, and the data survives on the RAM disk.
    #[test]
    fn file_syscalls_end_to_end() {
        use crate::fs::device::{self, MemDisk};
        use crate::fs::mkfs::mkfs;
        use crate::param::{FSSIZE, NOFILE, ROOTDEV};
        use std::sync::Arc;

        let _fs = crate::fs::test_serial();
        let disk = Arc::new(MemDisk::new(FSSIZE));
        mkfs(disk.as_ref(), FSSIZE, 64);
        device::register(disk);
        crate::fs::buffer::binit();
        crate::fs::inode::iinit();
        crate::fs::file::file_init();
        crate::fs::fsinit(ROOTDEV);

        const PATH: usize = 0x40;
        const DATA: usize = 0x80;
        const READBACK: usize = 0x100;
        const STAT: usize = 0x200;
        const O_RDWR_CREATE: u64 = 0x202;

        with_fake_process(
            |_| {},
            || {
                let p = myproc().expect("fake process");
                // SAFETY: test owns the process.
                let data = unsafe { p.data() };
                let pt = data.pagetable.as_ref().unwrap();
                pt.copy_out(PATH, b"/notes\0").expect("path");
                pt.copy_out(DATA, b"hello syscall").expect("payload");
                // SAFETY: frame parked on our kernel stack.
                let tf = unsafe { &mut *data.trapframe };

                tf.regs[8] = SYS_OPEN as u64;
                tf.regs[0] = PATH as u64;
                tf.regs[1] = O_RDWR_CREATE;
                let fd = dispatch(tf);
                assert!(fd >= 0, "open(O_CREATE|O_RDWR)");

                tf.regs[8] = SYS_WRITE as u64;
                tf.regs[0] = fd as u64;
                tf.regs[1] = DATA as u64;
                tf.regs[2] = 13;
                assert_eq!(dispatch(tf), 13);

                tf.regs[8] = SYS_FSTAT as u64;
                tf.regs[0] = fd as u64;
                tf.regs[1] = STAT as u64;
                assert_eq!(dispatch(tf), 0);
                let mut st = [0u8; 24];
                let p = myproc().expect("fake process");
                // SAFETY: test owns the process.
                let data = unsafe { p.data() };
                data.pagetable.as_ref().unwrap().copy_in(&mut st, STAT).expect("stat bytes");
                let size = u64::from_le_bytes(st[16..24].try_into().unwrap());
                assert_eq!(size, 13);

                tf.regs[8] = SYS_CLOSE as u64;
                tf.regs[0] = fd as u64;
                assert_eq!(dispatch(tf), 0);

                // Reopen read-only and read the bytes back through user
                // memory.
                tf.regs[8] = SYS_OPEN as u64;
                tf.regs[0] = PATH as u64;
                tf.regs[1] = 0; // O_RDONLY
                let fd = dispatch(tf);
                assert!(fd >= 0, "reopen");

                tf.regs[8] = SYS_READ as u64;
                tf.regs[0] = fd as u64;
                tf.regs[1] = READBACK as u64;
                tf.regs[2] = 32;
                assert_eq!(dispatch(tf), 13, "short read at EOF");

                let mut back = [0u8; 13];
                let data = unsafe { myproc().unwrap().data() };
                data.pagetable
                    .as_ref()
                    .unwrap()
                    .copy_in(&mut back, READBACK)
                    .expect("readback");
                assert_eq!(&back, b"hello syscall");

                // dup until the descriptor table is full; the overflow
                // fails with -1, not a panic.
                let mut dups = std::vec::Vec::new();
                loop {
                    tf.regs[8] = SYS_DUP as u64;
                    tf.regs[0] = fd as u64;
                    let nfd = dispatch(tf);
                    if nfd < 0 {
                        break;
                    }
                    dups.push(nfd);
                }
                assert_eq!(dups.len(), NOFILE - 1, "every slot but fd's own");

                for nfd in dups.into_iter().chain([fd]) {
                    tf.regs[8] = SYS_CLOSE as u64;
                    tf.regs[0] = nfd as u64;
                    assert_eq!(dispatch(tf), 0);
                }
            },
        );
    }

    #[test]
    fn arg_str_copies_through_the_page_table() {
        with_fake_process(
            |tf| {
                tf.regs[0] = 64;
            },
            || {
                let p = myproc().expect("fake process");
                // SAFETY: test owns the process.
                let data = unsafe { p.data() };
                data.pagetable
                    .as_ref()
                    .unwrap()
                    .copy_out(64, b"/etc/motd\0")
                    .expect("seed string");

                let mut buf = [0u8; MAXPATH];
                let len = arg_str(0, &mut buf).expect("copy string");
                assert_eq!(&buf[..len], b"/etc/motd");
            },
        );
    }
}

//! Process-facing system calls.

use super::{arg_int, arg_ptr};
use crate::process::{self, myproc};
use crate::trap;
use crate::KernelResult;

pub fn sys_exit() -> KernelResult<i64> {
    let status = arg_int(0)? as i32;
    process::exit(status);
}

pub fn sys_getpid() -> KernelResult<i64> {
    Ok(myproc().expect("getpid: no process").pid() as i64)
}

pub fn sys_fork() -> KernelResult<i64> {
    process::fork().map(|pid| pid as i64)
}

pub fn sys_wait() -> KernelResult<i64> {
    let raw = arg_int(0)?;
    let status_addr = if raw == 0 {
        None
    } else {
        Some(arg_ptr(0, core::mem::size_of::<i64>())?)
    };
    process::wait(status_addr).map(|pid| pid as i64)
}

pub fn sys_yield() -> KernelResult<i64> {
    process::yield_now();
    Ok(0)
}

pub fn sys_kill() -> KernelResult<i64> {
    let pid = arg_int(0)?;
    process::kill(pid as u32).map(|_| 0)
}

/// Grow or shrink the heap; returns the old break.
pub fn sys_sbrk() -> KernelResult<i64> {
    let delta = arg_int(0)?;
    let p = myproc().expect("sbrk: no process");
    // SAFETY: we are the running process.
    let old = unsafe { p.data() }.sz as i64;
    process::growproc(delta)?;
    Ok(old)
}

pub fn sys_uptime() -> KernelResult<i64> {
    Ok(trap::uptime() as i64)
}

pub fn sys_sleep() -> KernelResult<i64> {
    let n = arg_int(0)?;
    trap::sleep_ticks(n.max(0) as u64)?;
    Ok(0)
}

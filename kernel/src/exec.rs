//! exec: replace the current image with a program from the filesystem.
//!
//! Programs are flat binaries entered at VA 0, the convention the embedded
//! initcode also follows. The new image is assembled completely: code,
//! guard page, stack, argv block, before anything of the old one is
//! touched, so a failing exec leaves the caller intact.
//!
//! New user stack, downward from the top:
//!
//! ```text
//! | argv strings (NUL terminated) |
//! | argv[] pointer array, NULL-terminated |
//! | <- sp (16-aligned)            |
//! | ... one guard page below ...  |
//! ```

use crate::error::{FsError, KernelError};
use crate::fs::inode::{ilock, iunlockput};
use crate::fs::path::namei;
use crate::fs::{log, InodeType, IoDst};
use crate::mm::{page_round_up, UserPageTable, VirtAddr, PGSIZE};
use crate::param::MAXARG;
use crate::process::myproc;
use crate::KernelResult;

/// Replace the calling process's image. Returns argc, which lands in x0:
/// main(argc, argv) convention.
pub fn exec(path: &[u8], argv: &[&[u8]]) -> KernelResult<usize> {
    if argv.len() > MAXARG {
        return Err(KernelError::Syscall(
            crate::error::SyscallError::InvalidArgument { arg: 1 },
        ));
    }
    let p = myproc().ok_or(KernelError::NoProcess)?;

    // Read the program into a fresh address space.
    log::begin_op();
    let image = load_image(path);
    log::end_op();
    let (mut pt, code_sz) = image?;

    // Guard page (user access revoked) below two pages of stack.
    let guard_base = page_round_up(code_sz);
    let sz = match pt.alloc(guard_base, guard_base + 2 * PGSIZE) {
        Ok(sz) => sz,
        Err(e) => {
            pt.destroy();
            return Err(e.into());
        }
    };
    pt.clear_user(VirtAddr::new(guard_base));
    let stack_top = sz;

    match build_stack(&pt, stack_top, argv) {
        Ok((sp, uargv)) => {
            // Point of no return: swap the image under the process.
            // SAFETY: we are the running process.
            let data = unsafe { p.data() };
            let argc = argv.len();

            // SAFETY: the frame lives at the top of our kernel stack.
            unsafe {
                let tf = &mut *data.trapframe;
                tf.pc = 0;
                tf.sp = sp as u64;
                tf.regs[0] = argc as u64;
                tf.regs[1] = uargv as u64;
            }
            if let Some(last) = path.rsplit(|&b| b == b'/').next() {
                data.set_name(core::str::from_utf8(last).unwrap_or("?"));
            }
            let old = data.pagetable.replace(pt);
            data.sz = sz;
            pt_switch(data);
            if let Some(old) = old {
                old.destroy();
            }
            Ok(argc)
        }
        Err(e) => {
            pt.destroy();
            Err(e)
        }
    }
}

fn pt_switch(data: &crate::process::ProcData) {
    if let Some(pt) = data.pagetable.as_ref() {
        pt.switch_to();
    }
}

/// Pull the program file into a new address space at VA 0.
fn load_image(path: &[u8]) -> KernelResult<(UserPageTable, usize)> {
    let ip = namei(path)?;
    let mut guard = ilock(ip);
    if guard.typ != InodeType::File {
        iunlockput(guard);
        return Err(FsError::WrongType.into());
    }
    let size = guard.size as usize;
    if size == 0 {
        iunlockput(guard);
        return Err(FsError::WrongType.into());
    }

    let mut pt = match UserPageTable::new() {
        Ok(pt) => pt,
        Err(e) => {
            iunlockput(guard);
            return Err(e.into());
        }
    };
    if let Err(e) = pt.alloc(0, size) {
        pt.destroy();
        iunlockput(guard);
        return Err(e.into());
    }

    // One block at a time through a kernel bounce buffer into the new
    // table; readi's user path would write through the *current* one.
    let mut off = 0usize;
    while off < size {
        let mut chunk = [0u8; crate::fs::BSIZE];
        let n = match guard.read(
            &mut IoDst::Kernel(&mut chunk),
            off as u32,
            crate::fs::BSIZE as u32,
        ) {
            Ok(n) if n > 0 => n,
            _ => {
                pt.destroy();
                iunlockput(guard);
                return Err(FsError::InvalidOffset.into());
            }
        };
        if let Err(e) = pt.copy_out(off, &chunk[..n]) {
            pt.destroy();
            iunlockput(guard);
            return Err(e.into());
        }
        off += n;
    }
    iunlockput(guard);
    Ok((pt, size))
}

/// Copy argv strings and the pointer array onto the new stack. Returns
/// (sp, argv base).
fn build_stack(pt: &UserPageTable, stack_top: usize, argv: &[&[u8]]) -> KernelResult<(usize, usize)> {
    let mut sp = stack_top;
    let stack_floor = stack_top - PGSIZE; // guard page is below this

    let mut pointers = [0u64; MAXARG + 1];
    for (i, arg) in argv.iter().enumerate() {
        sp -= arg.len() + 1;
        sp &= !0xF; // SP must stay 16-aligned
        if sp < stack_floor {
            return Err(KernelError::Syscall(
                crate::error::SyscallError::InvalidArgument { arg: 1 },
            ));
        }
        pt.copy_out(sp, arg)?;
        pt.copy_out(sp + arg.len(), &[0u8])?;
        pointers[i] = sp as u64;
    }
    pointers[argv.len()] = 0;

    let table_bytes = (argv.len() + 1) * 8;
    sp -= table_bytes;
    sp &= !0xF;
    if sp < stack_floor {
        return Err(KernelError::Syscall(
            crate::error::SyscallError::InvalidArgument { arg: 1 },
        ));
    }
    let uargv = sp;
    for (i, ptr) in pointers[..=argv.len()].iter().enumerate() {
        pt.copy_out(uargv + i * 8, &ptr.to_le_bytes())?;
    }
    Ok((sp, uargv))
}

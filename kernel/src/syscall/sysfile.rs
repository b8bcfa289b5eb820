//! File-facing system calls: thin argument-fetching shells over the fs
//! layer. Every on-disk mutation runs inside one log transaction.

use alloc::vec::Vec;

use super::{arg_fd, arg_int, arg_ptr, arg_str, fetch_str, fetch_u64};
use crate::error::{FsError, KernelError};
use crate::fs::file::{self, FileKind, FileRef};
use crate::fs::inode::{ilock, iput, iunlockput};
use crate::fs::path::{create, link, namei, unlink};
use crate::fs::pipe::pipe_alloc;
use crate::fs::{log, InodeType, IoDst, IoSrc};
use crate::param::{MAXARG, MAXPATH, NDEV, NOFILE};
use crate::process::myproc;
use crate::KernelResult;

pub const O_RDONLY: i64 = 0x000;
pub const O_WRONLY: i64 = 0x001;
pub const O_RDWR: i64 = 0x002;
pub const O_CREATE: i64 = 0x200;
pub const O_TRUNC: i64 = 0x400;

/// Install a file reference in the first free descriptor slot; hands the
/// reference back on a full table.
fn fdalloc(f: FileRef) -> Result<usize, FileRef> {
    let p = myproc().expect("fdalloc: no process");
    // SAFETY: we are the running process.
    let data = unsafe { p.data() };
    for fd in 0..NOFILE {
        if data.ofile[fd].is_none() {
            data.ofile[fd] = Some(f);
            return Ok(fd);
        }
    }
    Err(f)
}

pub fn sys_dup() -> KernelResult<i64> {
    let (_, f) = arg_fd(0)?;
    let nf = file::dup(f);
    match fdalloc(nf) {
        Ok(fd) => Ok(fd as i64),
        Err(nf) => {
            file::close(nf);
            Err(FsError::NoFds.into())
        }
    }
}

pub fn sys_read() -> KernelResult<i64> {
    let (_, f) = arg_fd(0)?;
    let n = arg_int(2)?;
    if n < 0 {
        return Err(FsError::InvalidOffset.into());
    }
    let addr = arg_ptr(1, n as usize)?;
    let read = file::read(f, &mut IoDst::User(addr), n as usize)?;
    Ok(read as i64)
}

pub fn sys_write() -> KernelResult<i64> {
    let (_, f) = arg_fd(0)?;
    let n = arg_int(2)?;
    if n < 0 {
        return Err(FsError::InvalidOffset.into());
    }
    let addr = arg_ptr(1, n as usize)?;
    let wrote = file::write(f, &IoSrc::User(addr), n as usize)?;
    Ok(wrote as i64)
}

pub fn sys_close() -> KernelResult<i64> {
    let (fd, _) = arg_fd(0)?;
    let p = myproc().expect("close: no process");
    // SAFETY: we are the running process.
    let f = unsafe { p.data() }.ofile[fd].take().expect("close: checked fd");
    file::close(f);
    Ok(0)
}

pub fn sys_fstat() -> KernelResult<i64> {
    let (_, f) = arg_fd(0)?;
    let addr = arg_ptr(1, 24)?;
    let st = file::stat(f)?;
    let p = myproc().expect("fstat: no process");
    // SAFETY: we are the running process.
    let data = unsafe { p.data() };
    data.pagetable
        .as_ref()
        .expect("fstat: no page table")
        .copy_out(addr, &st.encode())?;
    Ok(0)
}

pub fn sys_link() -> KernelResult<i64> {
    let mut old = [0u8; MAXPATH];
    let mut new = [0u8; MAXPATH];
    let old_len = arg_str(0, &mut old)?;
    let new_len = arg_str(1, &mut new)?;

    log::begin_op();
    let r = link(&old[..old_len], &new[..new_len]);
    log::end_op();
    r.map(|_| 0)
}

pub fn sys_unlink() -> KernelResult<i64> {
    let mut path = [0u8; MAXPATH];
    let len = arg_str(0, &mut path)?;

    log::begin_op();
    let r = unlink(&path[..len]);
    log::end_op();
    r.map(|_| 0)
}

pub fn sys_open() -> KernelResult<i64> {
    let mut path = [0u8; MAXPATH];
    let len = arg_str(0, &mut path)?;
    let path = &path[..len];
    let mode = arg_int(1)?;

    log::begin_op();
    let r = open_inner(path, mode);
    log::end_op();
    r
}

fn open_inner(path: &[u8], mode: i64) -> KernelResult<i64> {
    let mut guard = if mode & O_CREATE != 0 {
        create(path, InodeType::File, 0, 0)?
    } else {
        let ip = namei(path)?;
        let guard = ilock(ip);
        // Directories open read-only.
        if guard.typ == InodeType::Dir && mode != O_RDONLY {
            iunlockput(guard);
            return Err(FsError::WrongType.into());
        }
        guard
    };

    if guard.typ == InodeType::Device && guard.major as usize >= NDEV {
        iunlockput(guard);
        return Err(FsError::BadDevice.into());
    }

    let kind = match guard.typ {
        InodeType::Device => FileKind::Device {
            ip: guard.ip,
            major: guard.major,
        },
        _ => FileKind::Inode(guard.ip),
    };
    let readable = mode & O_WRONLY == 0;
    let writable = (mode & O_WRONLY != 0) || (mode & O_RDWR != 0);

    let Some(f) = file::alloc(kind, readable, writable) else {
        iunlockput(guard);
        return Err(FsError::NoFileSlots.into());
    };
    let fd = match fdalloc(f) {
        Ok(fd) => fd,
        Err(f) => {
            file::close(f); // drops the table's inode reference
            drop(guard);
            return Err(FsError::NoFds.into());
        }
    };

    if mode & O_TRUNC != 0 && guard.typ == InodeType::File {
        guard.truncate();
    }
    drop(guard); // table keeps its reference
    Ok(fd as i64)
}

pub fn sys_mkdir() -> KernelResult<i64> {
    let mut path = [0u8; MAXPATH];
    let len = arg_str(0, &mut path)?;

    log::begin_op();
    let r = create(&path[..len], InodeType::Dir, 0, 0);
    let r = match r {
        Ok(guard) => {
            iunlockput(guard);
            Ok(0)
        }
        Err(e) => Err(e),
    };
    log::end_op();
    r
}

pub fn sys_mknod() -> KernelResult<i64> {
    let mut path = [0u8; MAXPATH];
    let len = arg_str(0, &mut path)?;
    let major = arg_int(1)?;
    let minor = arg_int(2)?;

    log::begin_op();
    let r = create(&path[..len], InodeType::Device, major as u16, minor as u16);
    let r = match r {
        Ok(guard) => {
            iunlockput(guard);
            Ok(0)
        }
        Err(e) => Err(e),
    };
    log::end_op();
    r
}

pub fn sys_chdir() -> KernelResult<i64> {
    let mut path = [0u8; MAXPATH];
    let len = arg_str(0, &mut path)?;
    let p = myproc().ok_or(KernelError::NoProcess)?;

    log::begin_op();
    let r = (|| {
        let ip = namei(&path[..len])?;
        let guard = ilock(ip);
        if guard.typ != InodeType::Dir {
            iunlockput(guard);
            return Err(KernelError::Fs(FsError::NotADirectory));
        }
        drop(guard);
        // SAFETY: we are the running process.
        let data = unsafe { p.data() };
        if let Some(old) = data.cwd.replace(ip) {
            iput(old);
        }
        Ok(0)
    })();
    log::end_op();
    r
}

pub fn sys_pipe() -> KernelResult<i64> {
    let addr = arg_ptr(0, 8)?; // int fd[2]
    let (rf, wf) = pipe_alloc()?;

    let p = myproc().expect("pipe: no process");
    let (fd0, fd1) = match fdalloc(rf) {
        Ok(fd0) => match fdalloc(wf) {
            Ok(fd1) => (fd0, fd1),
            Err(wf) => {
                // SAFETY: we are the running process.
                let f = unsafe { p.data() }.ofile[fd0].take().expect("pipe fd0");
                file::close(f);
                file::close(wf);
                return Err(FsError::NoFds.into());
            }
        },
        Err(rf) => {
            file::close(rf);
            file::close(wf);
            return Err(FsError::NoFds.into());
        }
    };

    let mut raw = [0u8; 8];
    raw[0..4].copy_from_slice(&(fd0 as i32).to_le_bytes());
    raw[4..8].copy_from_slice(&(fd1 as i32).to_le_bytes());
    // SAFETY: we are the running process.
    let data = unsafe { p.data() };
    if data
        .pagetable
        .as_ref()
        .expect("pipe: no page table")
        .copy_out(addr, &raw)
        .is_err()
    {
        for fd in [fd0, fd1] {
            if let Some(f) = data.ofile[fd].take() {
                file::close(f);
            }
        }
        return Err(KernelError::Vm(crate::error::VmError::BadUserAccess {
            va: addr,
        }));
    }
    Ok(0)
}

pub fn sys_exec() -> KernelResult<i64> {
    let mut path = [0u8; MAXPATH];
    let len = arg_str(0, &mut path)?;
    let uargv = arg_int(1)? as usize;

    let mut argv: Vec<Vec<u8>> = Vec::new();
    for i in 0..=MAXARG {
        if i == MAXARG {
            return Err(KernelError::Syscall(
                crate::error::SyscallError::InvalidArgument { arg: 1 },
            ));
        }
        let uarg = fetch_u64(uargv + 8 * i)? as usize;
        if uarg == 0 {
            break;
        }
        let mut buf = [0u8; MAXPATH];
        let n = fetch_str(uarg, &mut buf)?;
        argv.push(buf[..n].to_vec());
    }

    let args: Vec<&[u8]> = argv.iter().map(|a| a.as_slice()).collect();
    crate::exec::exec(&path[..len], &args).map(|argc| argc as i64)
}

//! The system-wide open-file table.
//!
//! NFILE slots, each a refcounted polymorphic handle over an inode, a
//! device or a pipe end. Descriptors in per-process tables hold one
//! reference each; `dup` adds one, `close` drops one and tears the
//! underlying object down at zero. Running out of slots is recoverable (the
//! syscall returns -1), unlike most table exhaustions in the kernel.

use alloc::sync::Arc;

use lazy_static::lazy_static;

use core::sync::atomic::{AtomicU32, Ordering};

use spin::RwLock;

use super::inode::{self, ilock, Iref};
use super::pipe::Pipe;
use super::{log, IoDst, IoSrc, Stat, BSIZE};
use crate::error::{FsError, KernelError};
use crate::param::{MAXOPBLOCKS, NDEV, NFILE};
use crate::sync::SpinLock;
use crate::KernelResult;

/// Console major device number.
pub const CONSOLE: u16 = 1;

/// What a file handle refers to.
#[derive(Clone)]
pub enum FileKind {
    None,
    Pipe(Arc<Pipe>),
    Inode(Iref),
    Device { ip: Iref, major: u16 },
}

struct FileSlot {
    refcnt: u32,
    readable: bool,
    writable: bool,
    kind: FileKind,
}

impl FileSlot {
    const fn free() -> Self {
        Self {
            refcnt: 0,
            readable: false,
            writable: false,
            kind: FileKind::None,
        }
    }
}

struct FTable {
    slots: SpinLock<[FileSlot; NFILE]>,
    /// Byte offsets for inode/device files; advanced under the inode lock,
    /// so reads and writes through one handle serialize there.
    offsets: [AtomicU32; NFILE],
}

lazy_static! {
    static ref FTABLE: FTable = FTable {
        slots: SpinLock::new("ftable", core::array::from_fn(|_| FileSlot::free())),
        offsets: core::array::from_fn(|_| AtomicU32::new(0)),
    };
}

/// Reset the table; boot once, host tests per scenario. No handles may be
/// live.
pub fn file_init() {
    let mut slots = FTABLE.slots.lock();
    for (i, slot) in slots.iter_mut().enumerate() {
        *slot = FileSlot::free();
        FTABLE.offsets[i].store(0, Ordering::Relaxed);
    }
}

/// One reference to an open file. Not `Copy`: references are created only
/// by [`alloc`] and [`dup`] and consumed by [`close`].
#[derive(Debug, PartialEq, Eq)]
pub struct FileRef {
    idx: usize,
}

/// Claim a free slot. `None` when the table is full (not a panic).
pub fn alloc(kind: FileKind, readable: bool, writable: bool) -> Option<FileRef> {
    let mut slots = FTABLE.slots.lock();
    for (i, slot) in slots.iter_mut().enumerate() {
        if slot.refcnt == 0 {
            *slot = FileSlot {
                refcnt: 1,
                readable,
                writable,
                kind,
            };
            FTABLE.offsets[i].store(0, Ordering::Relaxed);
            return Some(FileRef { idx: i });
        }
    }
    None
}

/// Another reference to the same open file.
pub fn dup(f: &FileRef) -> FileRef {
    let mut slots = FTABLE.slots.lock();
    if slots[f.idx].refcnt < 1 {
        panic!("filedup: refcnt {}", slots[f.idx].refcnt);
    }
    slots[f.idx].refcnt += 1;
    FileRef { idx: f.idx }
}

/// Drop a reference; the last one out closes the underlying object.
pub fn close(f: FileRef) {
    let (kind, writable) = {
        let mut slots = FTABLE.slots.lock();
        let slot = &mut slots[f.idx];
        if slot.refcnt < 1 {
            panic!("fileclose: refcnt {}", slot.refcnt);
        }
        slot.refcnt -= 1;
        if slot.refcnt > 0 {
            return;
        }
        let writable = slot.writable;
        let kind = core::mem::replace(&mut slot.kind, FileKind::None);
        slot.readable = false;
        slot.writable = false;
        (kind, writable)
    };

    match kind {
        FileKind::Pipe(pipe) => pipe.close(writable),
        FileKind::Inode(ip) | FileKind::Device { ip, .. } => {
            log::begin_op();
            inode::iput(ip);
            log::end_op();
        }
        FileKind::None => {}
    }
}

fn snapshot(f: &FileRef) -> (FileKind, bool, bool) {
    let slots = FTABLE.slots.lock();
    let slot = &slots[f.idx];
    (slot.kind.clone(), slot.readable, slot.writable)
}

/// Inode/device stat for fstat.
pub fn stat(f: &FileRef) -> KernelResult<Stat> {
    match snapshot(f).0 {
        FileKind::Inode(ip) | FileKind::Device { ip, .. } => {
            let guard = ilock(ip);
            Ok(guard.stat())
        }
        _ => Err(KernelError::Fs(FsError::BadFileDescriptor)),
    }
}

/// Read from a file into `dst`, honoring the handle's mode and advancing
/// the offset for inode files.
pub fn read(f: &FileRef, dst: &mut IoDst<'_>, n: usize) -> KernelResult<usize> {
    let (kind, readable, _) = snapshot(f);
    if !readable {
        return Err(KernelError::Fs(FsError::BadFileDescriptor));
    }
    match kind {
        FileKind::Pipe(pipe) => pipe.read(dst, n),
        FileKind::Device { major, .. } => (device_switch(major)?.read)(dst, n),
        FileKind::Inode(ip) => {
            let off = FTABLE.offsets[f.idx].load(Ordering::Relaxed);
            let mut guard = ilock(ip);
            let r = guard.read(dst, off, n as u32)?;
            FTABLE.offsets[f.idx].store(off + r as u32, Ordering::Relaxed);
            Ok(r)
        }
        FileKind::None => panic!("fileread: empty slot"),
    }
}

/// Per-transaction ceiling for inode writes: i-node block, indirect block,
/// allocation bitmap, and two blocks of slop for unaligned ends.
const WRITE_CHUNK: usize = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;

/// Write `n` bytes from `src` to a file. Inode writes are split across
/// transactions so no single op overruns the log reservation.
pub fn write(f: &FileRef, src: &IoSrc<'_>, n: usize) -> KernelResult<usize> {
    let (kind, _, writable) = snapshot(f);
    if !writable {
        return Err(KernelError::Fs(FsError::BadFileDescriptor));
    }
    match kind {
        FileKind::Pipe(pipe) => pipe.write(src, n),
        FileKind::Device { major, .. } => (device_switch(major)?.write)(src, n),
        FileKind::Inode(ip) => {
            let mut done = 0;
            while done < n {
                let n1 = (n - done).min(WRITE_CHUNK);
                log::begin_op();
                let mut guard = ilock(ip);
                let off = FTABLE.offsets[f.idx].load(Ordering::Relaxed);
                let r = guard.write(&src.slice_from(done), off, n1 as u32);
                if let Ok(r) = r {
                    FTABLE.offsets[f.idx].store(off + r as u32, Ordering::Relaxed);
                }
                drop(guard);
                log::end_op();
                match r {
                    Ok(r) if r == n1 => done += r,
                    Ok(_) => return Err(KernelError::Fs(FsError::NoBlocks)),
                    Err(e) if done == 0 => return Err(e),
                    Err(_) => break,
                }
            }
            Ok(done)
        }
        FileKind::None => panic!("filewrite: empty slot"),
    }
}

// ---------------------------------------------------------------------------
// Device switch
// ---------------------------------------------------------------------------

/// Read/write entry points for a character device.
#[derive(Clone, Copy)]
pub struct DevSw {
    pub read: fn(&mut IoDst<'_>, usize) -> KernelResult<usize>,
    pub write: fn(&IoSrc<'_>, usize) -> KernelResult<usize>,
}

static DEVSW: RwLock<[Option<DevSw>; NDEV]> = RwLock::new([None; NDEV]);

/// Register the handlers for a major number (console does this at boot).
pub fn register_device(major: u16, dev: DevSw) {
    DEVSW.write()[major as usize] = Some(dev);
}

fn device_switch(major: u16) -> KernelResult<DevSw> {
    if (major as usize) >= NDEV {
        return Err(KernelError::Fs(FsError::BadDevice));
    }
    DEVSW.read()[major as usize].ok_or(KernelError::Fs(FsError::BadDevice))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::pipe::pipe_alloc;

    #[test]
    fn table_exhaustion_is_recoverable() {
        let _serial = crate::fs::test_serial();
        file_init();
        let mut held = std::vec::Vec::new();
        for _ in 0..NFILE {
            held.push(alloc(FileKind::None, true, false).expect("slot"));
        }
        assert!(alloc(FileKind::None, true, false).is_none());
        for f in held {
            close(f);
        }
        assert!(alloc(FileKind::None, true, false).is_some());
        file_init();
    }

    #[test]
    fn dup_shares_one_underlying_object() {
        let _serial = crate::fs::test_serial();
        file_init();
        let (rf, wf) = pipe_alloc().expect("pipe");
        let rf2 = dup(&rf);

        // Write, close the ORIGINAL read ref: the dup keeps the read end
        // open, so the write end must still work.
        assert_eq!(write(&wf, &IoSrc::Kernel(b"abc"), 3).expect("write"), 3);
        close(rf);
        assert_eq!(write(&wf, &IoSrc::Kernel(b"d"), 1).expect("write"), 1);

        let mut out = [0u8; 8];
        let n = read(&rf2, &mut IoDst::Kernel(&mut out), 8).expect("read");
        assert_eq!(&out[..n], b"abcd");

        close(wf);
        close(rf2);
        file_init();
    }

    #[test]
    fn mode_bits_are_enforced() {
        let _serial = crate::fs::test_serial();
        file_init();
        let (rf, wf) = pipe_alloc().expect("pipe");
        let mut out = [0u8; 4];
        assert!(read(&wf, &mut IoDst::Kernel(&mut out), 4).is_err());
        assert!(write(&rf, &IoSrc::Kernel(b"x"), 1).is_err());
        close(rf);
        close(wf);
        file_init();
    }
}

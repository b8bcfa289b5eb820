//! Inodes: the on-disk inode table, the in-memory cache over it, and the
//! data-block bitmap.
//!
//! In-memory handles are `Copy` table indices ([`Iref`]) with explicit
//! reference discipline: `iget`/`idup` take a reference, `iput` drops one
//! (freeing the on-disk inode when the last reference to an unlinked inode
//! goes away). The dinode copy behind a handle is guarded by a per-entry
//! sleep lock; [`ilock`] returns the guard, loading the dinode from disk on
//! first touch. Everything that mutates disk state must run inside a log
//! transaction.

use lazy_static::lazy_static;

use super::buffer::{self};
use super::log::log_write;
use super::{sb, InodeType, IoDst, IoSrc, Stat, BPB, BSIZE, DINODE_SIZE, IPB, MAXFILE, NDIRECT, NINDIRECT};
use crate::error::{FsError, KernelError};
use crate::param::NINODE;
use crate::sync::{SleepLock, SleepLockGuard, SpinLock};
use crate::KernelResult;

/// Cached dinode plus the valid flag; sleep-lock protected.
pub struct InodeData {
    /// Has the dinode been read from disk?
    pub valid: bool,
    pub typ: InodeType,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
    /// NDIRECT direct blocks plus one singly-indirect block.
    pub addrs: [u32; NDIRECT + 1],
}

impl InodeData {
    const fn empty() -> Self {
        Self {
            valid: false,
            typ: InodeType::Free,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }

    /// Decode the dinode at `slot` of an inode block.
    pub(crate) fn load(&mut self, block: &[u8; BSIZE], slot: usize) {
        let d = &block[slot * DINODE_SIZE..(slot + 1) * DINODE_SIZE];
        let half = |i: usize| u16::from_le_bytes(d[i..i + 2].try_into().unwrap());
        self.typ = InodeType::from_u16(half(0));
        self.major = half(2);
        self.minor = half(4);
        self.nlink = half(6);
        self.size = u32::from_le_bytes(d[8..12].try_into().unwrap());
        for (i, a) in self.addrs.iter_mut().enumerate() {
            let at = 12 + i * 4;
            *a = u32::from_le_bytes(d[at..at + 4].try_into().unwrap());
        }
    }

    /// Encode into the dinode at `slot` of an inode block.
    pub(crate) fn store(&self, block: &mut [u8; BSIZE], slot: usize) {
        let d = &mut block[slot * DINODE_SIZE..(slot + 1) * DINODE_SIZE];
        d[0..2].copy_from_slice(&(self.typ as u16).to_le_bytes());
        d[2..4].copy_from_slice(&self.major.to_le_bytes());
        d[4..6].copy_from_slice(&self.minor.to_le_bytes());
        d[6..8].copy_from_slice(&self.nlink.to_le_bytes());
        d[8..12].copy_from_slice(&self.size.to_le_bytes());
        for (i, a) in self.addrs.iter().enumerate() {
            let at = 12 + i * 4;
            d[at..at + 4].copy_from_slice(&a.to_le_bytes());
        }
    }
}

struct IMeta {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

struct ITable {
    index: SpinLock<[IMeta; NINODE]>,
    inodes: [SleepLock<InodeData>; NINODE],
}

lazy_static! {
    static ref ITABLE: ITable = ITable {
        index: SpinLock::new(
            "itable",
            core::array::from_fn(|_| IMeta {
                dev: 0,
                inum: 0,
                refcnt: 0,
            })
        ),
        inodes: core::array::from_fn(|_| SleepLock::new("inode", InodeData::empty())),
    };
}

/// Reset the in-memory inode cache. Boot calls it once; host tests call it
/// to start each scenario cold. Live references must not exist.
pub fn iinit() {
    let mut index = ITABLE.index.lock();
    for meta in index.iter_mut() {
        meta.dev = 0;
        meta.inum = 0;
        meta.refcnt = 0;
    }
    drop(index);
    for entry in ITABLE.inodes.iter() {
        entry.lock().valid = false;
    }
}

/// A counted reference to a cached inode. `Copy` like the original's
/// pointers; the count is managed explicitly through `idup`/`iput`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iref {
    idx: usize,
    pub dev: u32,
    pub inum: u32,
}

/// Find or create a cache entry for (dev, inum); bumps the count, does not
/// read from disk. A full table is an invariant violation (NINODE bounds
/// live references).
pub fn iget(dev: u32, inum: u32) -> Iref {
    let mut index = ITABLE.index.lock();
    let mut empty = None;
    for (i, meta) in index.iter_mut().enumerate() {
        if meta.refcnt > 0 && meta.dev == dev && meta.inum == inum {
            meta.refcnt += 1;
            return Iref { idx: i, dev, inum };
        }
        if empty.is_none() && meta.refcnt == 0 {
            empty = Some(i);
        }
    }
    let idx = match empty {
        Some(i) => i,
        None => panic!("iget: inode table exhausted"),
    };
    index[idx] = IMeta {
        dev,
        inum,
        refcnt: 1,
    };
    // A recycled entry must be re-read on the next ilock.
    // SAFETY: the slot had no references, so no sleep-lock holder exists,
    // and none can appear before we release the index lock.
    unsafe { (*ITABLE.inodes[idx].data_ptr()).valid = false };
    Iref { idx, dev, inum }
}

/// Take one more reference.
pub fn idup(ip: Iref) -> Iref {
    ITABLE.index.lock()[ip.idx].refcnt += 1;
    ip
}

/// Drop a reference. The last reference to an unlinked inode truncates it
/// and frees the dinode; nothing can resurrect it because no directory
/// entry points at it anymore.
pub fn iput(ip: Iref) {
    let index = ITABLE.index.lock();
    // With refcnt == 1 we hold the only reference, so nobody can hold (or
    // newly take) the entry's sleep lock; peeking at the data is sound, and
    // the lock below cannot contend.
    let drop_inode = index[ip.idx].refcnt == 1 && {
        // SAFETY: sole reference, per the argument above.
        let data = unsafe { &*ITABLE.inodes[ip.idx].data_ptr() };
        data.valid && data.nlink == 0
    };
    if drop_inode {
        // No directory entry references the inode (nlink is 0) and no
        // in-memory handle but ours exists: nothing can resurrect it while
        // the index lock is dropped for the disk traffic.
        drop(index);
        let mut guard = InodeGuard {
            ip,
            guard: ITABLE.inodes[ip.idx].lock(),
        };
        guard.truncate();
        guard.typ = InodeType::Free;
        guard.update();
        guard.valid = false;
        drop(guard);
        ITABLE.index.lock()[ip.idx].refcnt -= 1;
    } else {
        let mut index = index;
        index[ip.idx].refcnt -= 1;
    }
}

/// Exclusive, loaded access to an inode's contents.
pub struct InodeGuard {
    pub ip: Iref,
    guard: SleepLockGuard<'static, InodeData>,
}

impl core::ops::Deref for InodeGuard {
    type Target = InodeData;

    fn deref(&self) -> &InodeData {
        &self.guard
    }
}

impl core::ops::DerefMut for InodeGuard {
    fn deref_mut(&mut self) -> &mut InodeData {
        &mut self.guard
    }
}

/// Lock an inode, reading the dinode from disk on first use. Locking a
/// freed inode is an invariant violation.
pub fn ilock(ip: Iref) -> InodeGuard {
    let mut guard = InodeGuard {
        ip,
        guard: ITABLE.inodes[ip.idx].lock(),
    };
    if !guard.valid {
        let buf = buffer::bread(ip.dev, sb().iblock(ip.inum));
        let slot = (ip.inum as usize) % IPB;
        let data = &mut *guard;
        data.load(&buf, slot);
        data.valid = true;
        if data.typ == InodeType::Free {
            panic!("ilock: inode {} has no type", ip.inum);
        }
    }
    guard
}

/// Unlock and drop one reference, the common tail of directory operations.
pub fn iunlockput(guard: InodeGuard) {
    let ip = guard.ip;
    drop(guard);
    iput(ip);
}

impl InodeGuard {
    /// Write the cached dinode through to disk (inside the caller's
    /// transaction). Required after any field change: the cache is
    /// write-through.
    pub fn update(&self) {
        let mut buf = buffer::bread(self.ip.dev, sb().iblock(self.ip.inum));
        let slot = (self.ip.inum as usize) % IPB;
        self.guard.store(&mut buf, slot);
        log_write(&buf);
    }

    /// Copy out stat fields.
    pub fn stat(&self) -> Stat {
        Stat {
            dev: self.ip.dev as i32,
            ino: self.ip.inum,
            typ: self.typ as u16 as i16,
            nlink: self.nlink as i16,
            size: self.size as u64,
        }
    }

    /// Disk block backing file block `bn`, allocating on first touch (the
    /// new block and any indirect-table update are logged).
    pub fn bmap(&mut self, bn: u32) -> Result<u32, FsError> {
        let dev = self.ip.dev;
        let bn = bn as usize;
        if bn < NDIRECT {
            let mut addr = self.addrs[bn];
            if addr == 0 {
                addr = balloc(dev)?;
                self.addrs[bn] = addr;
            }
            return Ok(addr);
        }
        let bn = bn - NDIRECT;
        if bn < NINDIRECT {
            let mut ind = self.addrs[NDIRECT];
            if ind == 0 {
                ind = balloc(dev)?;
                self.addrs[NDIRECT] = ind;
            }
            let mut bp = buffer::bread(dev, ind);
            let at = bn * 4;
            let mut addr = u32::from_le_bytes(bp[at..at + 4].try_into().unwrap());
            if addr == 0 {
                addr = balloc(dev)?;
                bp[at..at + 4].copy_from_slice(&addr.to_le_bytes());
                log_write(&bp);
            }
            return Ok(addr);
        }
        panic!("bmap: block {} out of range", bn + NDIRECT);
    }

    /// Discard all content: free every data block (direct, indirect table
    /// included), zero the size, push the dinode to disk.
    pub fn truncate(&mut self) {
        let dev = self.ip.dev;
        for i in 0..NDIRECT {
            if self.addrs[i] != 0 {
                bfree(dev, self.addrs[i]);
                self.addrs[i] = 0;
            }
        }
        if self.addrs[NDIRECT] != 0 {
            {
                let bp = buffer::bread(dev, self.addrs[NDIRECT]);
                for j in 0..NINDIRECT {
                    let at = j * 4;
                    let addr = u32::from_le_bytes(bp[at..at + 4].try_into().unwrap());
                    if addr != 0 {
                        bfree(dev, addr);
                    }
                }
            }
            bfree(dev, self.addrs[NDIRECT]);
            self.addrs[NDIRECT] = 0;
        }
        self.size = 0;
        self.update();
    }

    /// Read `n` bytes at `off` into `dst`. Short reads at EOF; 0 for
    /// offsets past the end.
    pub fn read(&mut self, dst: &mut IoDst<'_>, off: u32, n: u32) -> KernelResult<usize> {
        if off > self.size || off.checked_add(n).is_none() {
            return Ok(0);
        }
        let n = n.min(self.size - off);
        let mut tot: u32 = 0;
        while tot < n {
            let pos = off + tot;
            let addr = self.bmap(pos / BSIZE as u32)?;
            let bp = buffer::bread(self.ip.dev, addr);
            let boff = pos as usize % BSIZE;
            let m = ((n - tot) as usize).min(BSIZE - boff);
            dst.write_at(tot as usize, &bp[boff..boff + m])?;
            tot += m as u32;
        }
        Ok(tot as usize)
    }

    /// Write `n` bytes at `off` from `src`, growing the file as needed.
    /// Refuses to start past EOF or beyond the maximum file size. The
    /// dinode is pushed even when the size is unchanged: bmap may have
    /// grown the address table.
    pub fn write(&mut self, src: &IoSrc<'_>, off: u32, n: u32) -> KernelResult<usize> {
        if off > self.size || off.checked_add(n).is_none() {
            return Err(FsError::InvalidOffset.into());
        }
        if (off as usize) + (n as usize) > MAXFILE * BSIZE {
            return Err(FsError::FileTooLarge.into());
        }
        let mut tot: u32 = 0;
        let mut result: KernelResult<()> = Ok(());
        while tot < n {
            let pos = off + tot;
            let addr = match self.bmap(pos / BSIZE as u32) {
                Ok(addr) => addr,
                Err(e) => {
                    result = Err(KernelError::Fs(e));
                    break;
                }
            };
            let mut bp = buffer::bread(self.ip.dev, addr);
            let boff = pos as usize % BSIZE;
            let m = ((n - tot) as usize).min(BSIZE - boff);
            if let Err(e) = src.read_at(tot as usize, &mut bp[boff..boff + m]) {
                result = Err(e);
                break;
            }
            log_write(&bp);
            tot += m as u32;
        }
        if off + tot > self.size {
            self.size = off + tot;
        }
        self.update();
        match result {
            Err(e) if tot == 0 => Err(e),
            _ => Ok(tot as usize),
        }
    }
}

// ---------------------------------------------------------------------------
// Disk inode and data-block allocation
// ---------------------------------------------------------------------------

/// Allocate a free dinode on `dev` and mark it with `typ`. Returns an
/// unlocked, referenced handle. Exhaustion is recoverable: the caller's
/// syscall fails with -1.
pub fn ialloc(dev: u32, typ: InodeType) -> Result<Iref, FsError> {
    let sb = sb();
    for inum in 1..sb.ninodes {
        let mut bp = buffer::bread(dev, sb.iblock(inum));
        let slot = (inum as usize) % IPB;
        let d = &mut bp[slot * DINODE_SIZE..(slot + 1) * DINODE_SIZE];
        if u16::from_le_bytes(d[0..2].try_into().unwrap()) == 0 {
            d.fill(0);
            d[0..2].copy_from_slice(&(typ as u16).to_le_bytes());
            log_write(&bp);
            drop(bp);
            return Ok(iget(dev, inum));
        }
    }
    Err(FsError::NoInodes)
}

/// Allocate a zeroed data block. Exhaustion is recoverable.
pub fn balloc(dev: u32) -> Result<u32, FsError> {
    let sb = sb();
    let mut b: u32 = 0;
    while b < sb.size {
        let mut bp = buffer::bread(dev, sb.bblock(b));
        let mut bi: u32 = 0;
        while bi < BPB as u32 && b + bi < sb.size {
            let mask = 1u8 << (bi % 8);
            let byte = (bi / 8) as usize;
            if bp[byte] & mask == 0 {
                bp[byte] |= mask;
                log_write(&bp);
                drop(bp);
                bzero(dev, b + bi);
                return Ok(b + bi);
            }
            bi += 1;
        }
        b += BPB as u32;
    }
    Err(FsError::NoBlocks)
}

/// Clear a block's bitmap bit. Freeing a free block is an invariant
/// violation (on-disk corruption).
pub fn bfree(dev: u32, b: u32) {
    let mut bp = buffer::bread(dev, sb().bblock(b));
    let bi = b % BPB as u32;
    let mask = 1u8 << (bi % 8);
    let byte = (bi / 8) as usize;
    if bp[byte] & mask == 0 {
        panic!("bfree: freeing free block {}", b);
    }
    bp[byte] &= !mask;
    log_write(&bp);
}

/// Zero a freshly allocated block through the log.
fn bzero(dev: u32, bno: u32) {
    let mut bp = buffer::bread(dev, bno);
    bp.fill(0);
    log_write(&bp);
}

//! The block buffer cache.
//!
//! NBUF fixed buffers on a circular LRU list (most-recently-released
//! first). The index (which buffer holds which block, reference
//! counts, list order) is one spinlock; each buffer's 512 data bytes are a
//! sleep-lock, so a holder may do disk I/O without stalling the cache. At
//! most one buffer ever covers a given block.
//!
//! `bread` returns an RAII guard; dropping it is `brelease` (sleep-lock
//! released, refcount dropped, buffer moved to the MRU end). The log pins
//! blocks it has absorbed so the cache cannot recycle them before
//! checkpoint; there is no write-back eviction, so running out of
//! recyclable buffers is a bug, not a condition.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;

use super::{device, BSIZE};
use crate::param::NBUF;
use crate::sync::{SleepLock, SleepLockGuard, SpinLock};

/// Sentinel index: the list head lives at `meta[NBUF]`.
const HEAD: usize = NBUF;

struct BufMeta {
    dev: u32,
    blockno: u32,
    /// Threads using or waiting on this buffer, plus log pins.
    refcnt: u32,
    prev: usize,
    next: usize,
}

impl BufMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            prev: HEAD,
            next: HEAD,
        }
    }
}

struct Index {
    meta: [BufMeta; NBUF + 1],
}

impl Index {
    /// Unlink `i` and reinsert right after the head (MRU position).
    fn move_to_front(&mut self, i: usize) {
        let (prev, next) = (self.meta[i].prev, self.meta[i].next);
        self.meta[prev].next = next;
        self.meta[next].prev = prev;
        let first = self.meta[HEAD].next;
        self.meta[i].next = first;
        self.meta[i].prev = HEAD;
        self.meta[first].prev = i;
        self.meta[HEAD].next = i;
    }
}

struct BCache {
    index: SpinLock<Index>,
    /// Block contents, one sleep lock each.
    data: [SleepLock<[u8; BSIZE]>; NBUF],
    /// Contents match the disk block. Written under the data sleep-lock or
    /// while repurposing (cache lock held, refcnt freshly 1).
    valid: [AtomicBool; NBUF],
    /// Memory newer than disk; transferred by `disk_rw`.
    dirty: [AtomicBool; NBUF],
}

lazy_static! {
    static ref BCACHE: BCache = BCache {
        index: SpinLock::new("bcache", Index {
            meta: [const { BufMeta::new() }; NBUF + 1],
        }),
        data: core::array::from_fn(|_| SleepLock::new("buffer", [0u8; BSIZE])),
        valid: core::array::from_fn(|_| AtomicBool::new(false)),
        dirty: core::array::from_fn(|_| AtomicBool::new(false)),
    };
}

/// (Re)build the LRU list with every buffer free. Called once at boot; host
/// tests call it again to start each scenario cold.
pub fn binit() {
    let mut index = BCACHE.index.lock();
    index.meta[HEAD] = BufMeta::new();
    for i in 0..NBUF {
        let first = index.meta[HEAD].next;
        index.meta[i] = BufMeta {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            prev: HEAD,
            next: first,
        };
        index.meta[first].prev = i;
        index.meta[HEAD].next = i;
        BCACHE.valid[i].store(false, Ordering::Relaxed);
        BCACHE.dirty[i].store(false, Ordering::Relaxed);
    }
}

/// A held buffer: sleep-lock guard plus identity. Deref gives the block
/// bytes. Dropping releases.
pub struct BufGuard {
    idx: usize,
    dev: u32,
    blockno: u32,
    guard: Option<SleepLockGuard<'static, [u8; BSIZE]>>,
}

impl BufGuard {
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Keep the buffer in the cache after this guard goes away; the log
    /// pins absorbed blocks until checkpoint.
    pub fn pin(&self) {
        BCACHE.index.lock().meta[self.idx].refcnt += 1;
    }

    /// Drop a pin taken with [`BufGuard::pin`].
    pub fn unpin(&self) {
        let mut index = BCACHE.index.lock();
        let refcnt = &mut index.meta[self.idx].refcnt;
        debug_assert!(*refcnt > 1, "unpin without pin");
        *refcnt -= 1;
    }
}

impl Deref for BufGuard {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &[u8; BSIZE] {
        self.guard.as_ref().expect("buffer released")
    }
}

impl DerefMut for BufGuard {
    fn deref_mut(&mut self) -> &mut [u8; BSIZE] {
        self.guard.as_mut().expect("buffer released")
    }
}

impl Drop for BufGuard {
    fn drop(&mut self) {
        // Sleep-lock first, then the index, same order as the original
        // brelease.
        drop(self.guard.take());
        let mut index = BCACHE.index.lock();
        index.meta[self.idx].refcnt -= 1;
        if index.meta[self.idx].refcnt == 0 {
            // Nobody waits for it; most recently released goes first.
            index.move_to_front(self.idx);
        }
    }
}

/// Find or claim a buffer for (dev, blockno) and take its sleep lock.
fn bget(dev: u32, blockno: u32) -> BufGuard {
    let mut index = BCACHE.index.lock();

    // Cached? Scan MRU to LRU.
    let mut i = index.meta[HEAD].next;
    while i != HEAD {
        if index.meta[i].dev == dev && index.meta[i].blockno == blockno {
            index.meta[i].refcnt += 1;
            drop(index);
            return BufGuard {
                idx: i,
                dev,
                blockno,
                guard: Some(BCACHE.data[i].lock()),
            };
        }
        i = index.meta[i].next;
    }

    // Not cached: recycle the least recently used clean buffer.
    let mut i = index.meta[HEAD].prev;
    while i != HEAD {
        if index.meta[i].refcnt == 0 && !BCACHE.dirty[i].load(Ordering::Relaxed) {
            index.meta[i].dev = dev;
            index.meta[i].blockno = blockno;
            index.meta[i].refcnt = 1;
            BCACHE.valid[i].store(false, Ordering::Relaxed);
            drop(index);
            return BufGuard {
                idx: i,
                dev,
                blockno,
                guard: Some(BCACHE.data[i].lock()),
            };
        }
        i = index.meta[i].prev;
    }

    // Every buffer is in use or pinned by the log; the log's reservation
    // arithmetic is supposed to make that impossible.
    panic!("bget: no buffers for dev {} block {}", dev, blockno);
}

/// Synchronous transfer for a held buffer: direction from the dirty flag,
/// valid set after a read, dirty cleared after a write.
fn disk_rw(buf: &mut BufGuard) {
    let idx = buf.idx;
    let write = BCACHE.dirty[idx].load(Ordering::Acquire);
    device::rw(buf.blockno, &mut *buf, write);
    if write {
        BCACHE.dirty[idx].store(false, Ordering::Release);
    }
    BCACHE.valid[idx].store(true, Ordering::Release);
}

/// Return a locked buffer holding the contents of `blockno`.
pub fn bread(dev: u32, blockno: u32) -> BufGuard {
    let mut buf = bget(dev, blockno);
    if !BCACHE.valid[buf.idx].load(Ordering::Acquire) {
        disk_rw(&mut buf);
    }
    buf
}

/// Write a held buffer through to the device.
pub fn bwrite(buf: &mut BufGuard) {
    BCACHE.dirty[buf.idx].store(true, Ordering::Release);
    disk_rw(buf);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::device::MemDisk;
    use alloc::sync::Arc;

    fn fresh_disk(nblocks: u32) -> Arc<MemDisk> {
        let disk = Arc::new(MemDisk::new(nblocks));
        device::register(disk.clone());
        binit();
        disk
    }

    #[test]
    fn bread_after_bwrite_sees_data() {
        let _serial = crate::fs::test_serial();
        let disk = fresh_disk(64);
        {
            let mut buf = bread(1, 7);
            buf[0] = 0xAB;
            buf[511] = 0xCD;
            bwrite(&mut buf);
        }
        assert_eq!(disk.snapshot(7)[0], 0xAB);

        binit(); // forget the cache; force a device read
        let buf = bread(1, 7);
        assert_eq!(buf[0], 0xAB);
        assert_eq!(buf[511], 0xCD);
    }

    #[test]
    fn same_block_maps_to_same_buffer() {
        let _serial = crate::fs::test_serial();
        fresh_disk(64);
        let idx = {
            let buf = bread(1, 3);
            buf.idx
        };
        let buf2 = bread(1, 3);
        assert_eq!(buf2.idx, idx, "one buffer per (dev, blockno)");
    }

    #[test]
    fn lru_recycles_oldest_clean_buffer() {
        let _serial = crate::fs::test_serial();
        fresh_disk(256);
        // Cache-only mutation of block 0, then a flood of NBUF other blocks
        // recycles its buffer; re-reading must hit the (zeroed) disk.
        {
            let mut buf = bread(1, 0);
            buf[0] = 0xEE;
        }
        for b in 1..=(NBUF as u32) {
            let _ = bread(1, b);
        }
        let buf = bread(1, 0);
        assert_eq!(buf[0], 0, "unwritten cache contents lost after recycle");
    }

    #[test]
    fn pinned_buffers_survive_the_flood() {
        let _serial = crate::fs::test_serial();
        fresh_disk(256);
        {
            let mut buf = bread(1, 5);
            buf[0] = 0x5A;
            buf.pin();
        }
        for b in 10..10 + NBUF as u32 {
            let _ = bread(1, b);
        }
        // Still cached: the contents come back without a disk read even
        // though the backing store was never written.
        let buf = bread(1, 5);
        assert_eq!(buf[0], 0x5A);
        buf.unpin();
    }
}

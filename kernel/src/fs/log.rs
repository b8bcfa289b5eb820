//! Write-ahead log: crash-consistent transactions over the buffer cache.
//!
//! The on-disk log region is a header block (count + home block numbers)
//! followed by LOGSIZE data slots. Filesystem syscalls bracket their block
//! updates with [`begin_op`]/[`end_op`]; modified buffers go through
//! [`log_write`], which absorbs repeats and pins the buffer in the cache.
//! The last outstanding operation commits: copy the cached blocks into the
//! log slots, write the header (the commit point), install the blocks to
//! their home locations, then clear the header. Recovery at mount replays
//! a committed header and is a no-op otherwise.
//!
//! Block numbers in the header are filesystem-relative end-to-end; the
//! device driver alone speaks LBAs.

use lazy_static::lazy_static;

use super::buffer::{self, BufGuard};
use super::SuperBlock;
use crate::param::{LOGSIZE, MAXOPBLOCKS};
use crate::process::{sleep, wakeup};
use crate::sync::SpinLock;

struct Log {
    /// First block of the log region (the header).
    start: u32,
    /// Blocks in the log region, header included.
    size: u32,
    dev: u32,
    /// Filesystem syscalls currently inside begin_op/end_op.
    outstanding: u32,
    committing: bool,
    /// Committed header: count and home block numbers.
    n: u32,
    block: [u32; LOGSIZE],
}

lazy_static! {
    static ref LOG: SpinLock<Log> = SpinLock::new("log", Log {
        start: 0,
        size: 0,
        dev: 0,
        outstanding: 0,
        committing: false,
        n: 0,
        block: [0; LOGSIZE],
    });
}

fn chan() -> usize {
    LOG.data_ptr() as usize
}

/// Configure the log from the superblock and recover any committed
/// transaction the previous boot left behind.
pub fn init(dev: u32, sb: &SuperBlock) {
    assert!(
        4 + LOGSIZE * 4 <= super::BSIZE,
        "log: header does not fit one block"
    );
    {
        let mut log = LOG.lock();
        log.start = sb.logstart;
        log.size = sb.nlog;
        log.dev = dev;
        log.outstanding = 0;
        log.committing = false;
        log.n = 0;
    }
    recover();
}

/// Read the on-disk header.
fn read_head(dev: u32, start: u32) -> (u32, [u32; LOGSIZE]) {
    let buf = buffer::bread(dev, start);
    let n = i32::from_le_bytes(buf[0..4].try_into().unwrap()) as u32;
    let mut block = [0u32; LOGSIZE];
    for (i, slot) in block.iter_mut().enumerate() {
        let at = 4 + i * 4;
        *slot = i32::from_le_bytes(buf[at..at + 4].try_into().unwrap()) as u32;
    }
    (n, block)
}

/// Write the in-memory header to disk. With `n > 0` this is the commit
/// point: a crash on either side of it is now deterministic.
fn write_head(dev: u32, start: u32, n: u32, block: &[u32; LOGSIZE]) {
    let mut buf = buffer::bread(dev, start);
    buf[0..4].copy_from_slice(&(n as i32).to_le_bytes());
    for (i, slot) in block.iter().enumerate() {
        let at = 4 + i * 4;
        buf[at..at + 4].copy_from_slice(&(*slot as i32).to_le_bytes());
    }
    buffer::bwrite(&mut buf);
}

/// Copy each absorbed block from the cache into its log slot on disk.
fn write_log(dev: u32, start: u32, n: u32, block: &[u32; LOGSIZE]) {
    for tail in 0..n as usize {
        let from = buffer::bread(dev, block[tail]);
        let mut to = buffer::bread(dev, start + tail as u32 + 1);
        *to = *from;
        buffer::bwrite(&mut to);
    }
}

/// Copy each logged block from the log region to its home location.
/// Recovery keeps the pins alone (there are none after a reboot).
fn install_trans(dev: u32, start: u32, n: u32, block: &[u32; LOGSIZE], recovering: bool) {
    for tail in 0..n as usize {
        let lbuf = buffer::bread(dev, start + tail as u32 + 1);
        let mut dbuf = buffer::bread(dev, block[tail]);
        *dbuf = *lbuf;
        buffer::bwrite(&mut dbuf);
        if !recovering {
            dbuf.unpin();
        }
    }
}

/// Replay whatever the header says; clear it afterwards.
fn recover() {
    let (dev, start) = {
        let log = LOG.lock();
        (log.dev, log.start)
    };
    let (n, block) = read_head(dev, start);
    install_trans(dev, start, n, &block, true);
    write_head(dev, start, 0, &[0; LOGSIZE]);
    LOG.lock().n = 0;
}

/// Enter a filesystem transaction. Blocks while a commit is running or
/// while reserved log space (`MAXOPBLOCKS` per outstanding op) would
/// overflow LOGSIZE.
pub fn begin_op() {
    let mut log = LOG.lock();
    loop {
        if log.committing {
            log = sleep(chan(), log);
        } else if log.n as usize + (log.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE {
            log = sleep(chan(), log);
        } else {
            log.outstanding += 1;
            return;
        }
    }
}

/// Leave a transaction; the last one out commits.
pub fn end_op() {
    let do_commit;
    {
        let mut log = LOG.lock();
        log.outstanding -= 1;
        if log.committing {
            panic!("end_op: already committing");
        }
        if log.outstanding == 0 {
            do_commit = true;
            log.committing = true;
        } else {
            do_commit = false;
            // Headroom may have opened for a blocked begin_op.
            wakeup(chan());
        }
    }

    if do_commit {
        // No locks held: commit sleeps in the buffer layer.
        commit();
        let mut log = LOG.lock();
        log.committing = false;
        wakeup(chan());
    }
}

fn commit() {
    let (dev, start, n, block) = {
        let log = LOG.lock();
        (log.dev, log.start, log.n, log.block)
    };
    if n == 0 {
        return;
    }
    write_log(dev, start, n, &block);
    write_head(dev, start, n, &block); // commit point
    install_trans(dev, start, n, &block, false);
    LOG.lock().n = 0;
    write_head(dev, start, 0, &[0; LOGSIZE]);
}

/// Record a modified buffer in the current transaction and pin it until
/// checkpoint. Re-logging the same block reuses its slot (absorption).
pub fn log_write(buf: &BufGuard) {
    let mut log = LOG.lock();
    if log.n as usize >= LOGSIZE || log.n >= log.size - 1 {
        panic!("log_write: transaction too big");
    }
    if log.outstanding < 1 {
        panic!("log_write: outside of a transaction");
    }

    let n = log.n as usize;
    let mut i = 0;
    while i < n {
        if log.block[i] == buf.blockno() {
            break;
        }
        i += 1;
    }
    log.block[i] = buf.blockno();
    if i == n {
        buf.pin();
        log.n += 1;
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::device::{self, MemDisk};
    use alloc::sync::Arc;

    const LOGSTART: u32 = 2;

    /// Fresh disk + cache + log, layout [boot | super | log(31) | data...].
    fn setup() -> Arc<MemDisk> {
        let disk = Arc::new(MemDisk::new(256));
        device::register(disk.clone());
        buffer::binit();
        let sb = SuperBlock {
            logstart: LOGSTART,
            nlog: (LOGSIZE + 1) as u32,
            ..Default::default()
        };
        init(1, &sb);
        disk
    }

    fn fill(dev: u32, blockno: u32, byte: u8) {
        let mut buf = buffer::bread(dev, blockno);
        buf.fill(byte);
        log_write(&buf);
    }

    #[test]
    fn committed_op_reaches_home_blocks() {
        let _serial = crate::fs::test_serial();
        let disk = setup();
        begin_op();
        fill(1, 100, 0x11);
        fill(1, 101, 0x22);
        end_op();
        assert_eq!(disk.snapshot(100)[0], 0x11);
        assert_eq!(disk.snapshot(101)[99], 0x22);
        // Header cleared after checkpoint.
        let (n, _) = read_head(1, LOGSTART);
        assert_eq!(n, 0);
    }

    #[test]
    fn absorption_reuses_the_slot() {
        let _serial = crate::fs::test_serial();
        setup();
        begin_op();
        fill(1, 120, 0xAA);
        fill(1, 120, 0xBB);
        assert_eq!(LOG.lock().n, 1, "same block twice takes one slot");
        end_op();
    }

    #[test]
    fn crash_before_commit_point_loses_the_op() {
        let _serial = crate::fs::test_serial();
        let disk = setup();

        begin_op();
        fill(1, 130, 0x77);
        // Crash simulation: the log data slots may have been written, but
        // the header never was.
        let (dev, start, n, block) = {
            let log = LOG.lock();
            (log.dev, log.start, log.n, log.block)
        };
        write_log(dev, start, n, &block);

        // "Reboot": cold cache, then recovery.
        buffer::binit();
        LOG.lock().outstanding = 0;
        LOG.lock().n = 0;
        recover();

        assert_eq!(disk.snapshot(130)[0], 0, "home block keeps old contents");
    }

    #[test]
    fn crash_after_commit_point_replays_the_op() {
        let _serial = crate::fs::test_serial();
        let disk = setup();

        begin_op();
        fill(1, 140, 0x11);
        fill(1, 141, 0x22);
        // Crash simulation: log slots and header written (the commit
        // point), but installation never ran.
        let (dev, start, n, block) = {
            let log = LOG.lock();
            (log.dev, log.start, log.n, log.block)
        };
        write_log(dev, start, n, &block);
        write_head(dev, start, n, &block);
        assert_eq!(disk.snapshot(140)[0], 0, "not yet installed");

        // "Reboot": cold cache, then recovery replays both blocks.
        buffer::binit();
        LOG.lock().outstanding = 0;
        LOG.lock().n = 0;
        recover();

        assert_eq!(disk.snapshot(140)[0], 0x11);
        assert_eq!(disk.snapshot(141)[0], 0x22);
        let (n, _) = read_head(1, LOGSTART);
        assert_eq!(n, 0, "log cleared after recovery");
    }

    #[test]
    fn reservation_invariant_holds_at_begin_op_return() {
        let _serial = crate::fs::test_serial();
        setup();
        begin_op();
        let log = LOG.lock();
        assert!(log.n as usize + log.outstanding as usize * MAXOPBLOCKS <= LOGSIZE);
        drop(log);
        end_op();
    }
}

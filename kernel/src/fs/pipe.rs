//! Anonymous pipes.
//!
//! A 512-byte ring with free-running read/write cursors (wrapped only when
//! indexing) and one open flag per endpoint. Readers and writers sleep on
//! the addresses of the two cursors; the storage lives in an `Arc` that
//! goes away when the last file handle on either end closes.

use alloc::sync::Arc;

use super::file::{self, FileKind, FileRef};
use super::{IoDst, IoSrc};
use crate::error::{FsError, KernelError};
use crate::process::{myproc, sleep, wakeup};
use crate::sync::SpinLock;
use crate::KernelResult;

pub const PIPE_SIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPE_SIZE],
    /// Bytes read so far; never wraps arithmetically.
    nread: u32,
    /// Bytes written so far.
    nwrite: u32,
    readopen: bool,
    writeopen: bool,
}

/// One pipe; both file handles share it through an `Arc`.
pub struct Pipe {
    inner: SpinLock<PipeInner>,
}

fn current_killed() -> bool {
    myproc().map(|p| p.killed()).unwrap_or(false)
}

impl Pipe {
    fn new() -> Self {
        Self {
            inner: SpinLock::new(
                "pipe",
                PipeInner {
                    data: [0; PIPE_SIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
        }
    }

    /// Readers rendezvous on the read cursor's identity...
    fn read_chan(&self) -> usize {
        self.inner.data_ptr() as usize
    }

    /// ...and writers on the write cursor's.
    fn write_chan(&self) -> usize {
        self.inner.data_ptr() as usize + 4
    }

    /// Write `n` bytes, sleeping whenever the ring fills. Fails once the
    /// read end is gone or the writer is killed.
    pub fn write(&self, src: &IoSrc<'_>, n: usize) -> KernelResult<usize> {
        let mut i = 0;
        let mut inner = self.inner.lock();
        while i < n {
            if !inner.readopen {
                return Err(KernelError::BrokenPipe);
            }
            if current_killed() {
                return Err(KernelError::Killed);
            }
            if inner.nwrite == inner.nread + PIPE_SIZE as u32 {
                wakeup(self.read_chan());
                inner = sleep(self.write_chan(), inner);
            } else {
                let mut byte = [0u8; 1];
                src.read_at(i, &mut byte)?;
                let at = (inner.nwrite % PIPE_SIZE as u32) as usize;
                inner.data[at] = byte[0];
                inner.nwrite += 1;
                i += 1;
            }
        }
        wakeup(self.read_chan());
        Ok(i)
    }

    /// Read up to `n` bytes; blocks while the ring is empty and the write
    /// end lives. A drained ring with a dead write end reads 0 (EOF).
    pub fn read(&self, dst: &mut IoDst<'_>, n: usize) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        while inner.nread == inner.nwrite && inner.writeopen {
            if current_killed() {
                return Err(KernelError::Killed);
            }
            inner = sleep(self.read_chan(), inner);
        }
        let mut i = 0;
        while i < n {
            if inner.nread == inner.nwrite {
                break;
            }
            let at = (inner.nread % PIPE_SIZE as u32) as usize;
            let byte = inner.data[at];
            inner.nread += 1;
            dst.write_at(i, &[byte])?;
            i += 1;
        }
        wakeup(self.write_chan());
        Ok(i)
    }

    /// Drop one endpoint, waking the peer so it can observe EOF or a
    /// broken pipe.
    pub fn close(&self, writable: bool) {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
            wakeup(self.read_chan());
        } else {
            inner.readopen = false;
            wakeup(self.write_chan());
        }
    }
}

/// Create a connected (read, write) file-handle pair.
pub fn pipe_alloc() -> KernelResult<(FileRef, FileRef)> {
    let pipe = Arc::new(Pipe::new());
    let rf = file::alloc(FileKind::Pipe(pipe.clone()), true, false)
        .ok_or(KernelError::Fs(FsError::NoFileSlots))?;
    let Some(wf) = file::alloc(FileKind::Pipe(pipe), false, true) else {
        file::close(rf);
        return Err(KernelError::Fs(FsError::NoFileSlots));
    };
    Ok((rf, wf))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn bytes_cross_the_ring_in_order() {
        let pipe = Pipe::new();
        let msg = b"pipe traffic";
        let wrote = pipe.write(&IoSrc::Kernel(msg), msg.len()).expect("write");
        assert_eq!(wrote, msg.len());

        let mut out = [0u8; 32];
        let out_len = out.len();
        let read = pipe
            .read(&mut IoDst::Kernel(&mut out), out_len)
            .expect("read");
        assert_eq!(&out[..read], msg);
    }

    #[test]
    fn cursors_wrap_only_on_indexing() {
        let pipe = Pipe::new();
        // Several full revolutions of the ring.
        for round in 0..5u8 {
            let chunk = [round; PIPE_SIZE];
            assert_eq!(
                pipe.write(&IoSrc::Kernel(&chunk), PIPE_SIZE).expect("write"),
                PIPE_SIZE
            );
            let mut out = [0u8; PIPE_SIZE];
            assert_eq!(
                pipe.read(&mut IoDst::Kernel(&mut out), PIPE_SIZE).expect("read"),
                PIPE_SIZE
            );
            assert!(out.iter().all(|&b| b == round));
        }
        let inner = pipe.inner.lock();
        assert_eq!(inner.nread, 5 * PIPE_SIZE as u32);
        assert_eq!(inner.nwrite, 5 * PIPE_SIZE as u32);
    }

    #[test]
    fn closed_write_end_reads_eof() {
        let pipe = Pipe::new();
        pipe.write(&IoSrc::Kernel(b"xy"), 2).expect("write");
        pipe.close(true);

        let mut out = [0u8; 8];
        let n = pipe
            .read(&mut IoDst::Kernel(&mut out), 8)
            .expect("drain");
        assert_eq!(&out[..n], b"xy");
        let n = pipe.read(&mut IoDst::Kernel(&mut out), 8).expect("eof");
        assert_eq!(n, 0, "drained pipe with dead writer is EOF");
    }

    #[test]
    fn closed_read_end_breaks_writes() {
        let pipe = Pipe::new();
        pipe.close(false);
        let err = pipe.write(&IoSrc::Kernel(b"z"), 1);
        assert_eq!(err, Err(KernelError::BrokenPipe));
    }

    #[test]
    fn producer_consumer_transfers_4096_bytes_then_eof() {
        // One ring's worth at a time, alternating writer and reader, the
        // way two processes drain each other; then a closed write end.
        let pipe = Pipe::new();
        let payload = [b'a'; 4096];
        let mut received = std::vec::Vec::new();

        for chunk in payload.chunks(PIPE_SIZE) {
            assert_eq!(
                pipe.write(&IoSrc::Kernel(chunk), chunk.len()).expect("write"),
                chunk.len()
            );
            let mut out = [0u8; PIPE_SIZE];
            let n = pipe
                .read(&mut IoDst::Kernel(&mut out), PIPE_SIZE)
                .expect("read");
            received.extend_from_slice(&out[..n]);
        }
        pipe.close(true);

        let mut out = [0u8; 8];
        let n = pipe.read(&mut IoDst::Kernel(&mut out), 8).expect("eof");
        assert_eq!(n, 0);
        assert_eq!(received.len(), 4096);
        assert!(received.iter().all(|&b| b == b'a'));
    }
}

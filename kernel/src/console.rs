//! Console device: line discipline over the UART.
//!
//! Input accumulates in a ring with three cursors: `r` (next byte a reader
//! takes), `w` (end of the last committed line) and `e` (edit position).
//! The interrupt handler edits between `w` and `e` (backspace, ^U
//! kill-line) and commits a line on newline, ^D or a full buffer, waking
//! sleeping readers. Registered in the device switch as major 1.

use crate::fs::file::{register_device, DevSw, CONSOLE};
use crate::fs::{IoDst, IoSrc};
use crate::param::INPUT_BUF;
use crate::process::{myproc, sleep, wakeup};
use crate::sync::SpinLock;
use crate::{drivers::uart, KernelError, KernelResult};

const fn ctrl(c: u8) -> u8 {
    c - b'@'
}

struct Console {
    buf: [u8; INPUT_BUF],
    /// Read cursor.
    r: u32,
    /// Committed-line cursor.
    w: u32,
    /// Edit cursor.
    e: u32,
}

static CONS: SpinLock<Console> = SpinLock::new(
    "cons",
    Console {
        buf: [0; INPUT_BUF],
        r: 0,
        w: 0,
        e: 0,
    },
);

fn read_chan() -> usize {
    CONS.data_ptr() as usize
}

/// Synchronous character output (echo, kernel messages).
pub fn putc(c: u8) {
    uart::putc_sync(c);
}

/// Echo the erasure of one character.
fn rubout() {
    uart::putc_sync(8);
    uart::putc_sync(b' ');
    uart::putc_sync(8);
}

/// `write(2)` to the console: buffered UART path.
fn console_write(src: &IoSrc<'_>, n: usize) -> KernelResult<usize> {
    for i in 0..n {
        let mut byte = [0u8; 1];
        src.read_at(i, &mut byte)?;
        uart::putc(byte[0]);
    }
    Ok(n)
}

/// `read(2)` from the console: block until a whole line (or EOF) is in,
/// then hand over at most `n` bytes of it.
fn console_read(dst: &mut IoDst<'_>, n: usize) -> KernelResult<usize> {
    let target = n;
    let mut left = n;
    let mut cons = CONS.lock();
    while left > 0 {
        while cons.r == cons.w {
            if myproc().map(|p| p.killed()).unwrap_or(false) {
                return Err(KernelError::Killed);
            }
            cons = sleep(read_chan(), cons);
        }
        let c = cons.buf[(cons.r % INPUT_BUF as u32) as usize];
        cons.r += 1;

        if c == ctrl(b'D') {
            if left < target {
                // Leave the EOF for the next read so this one returns the
                // partial line.
                cons.r -= 1;
            }
            break;
        }
        dst.write_at(target - left, &[c])?;
        left -= 1;
        if c == b'\n' {
            break;
        }
    }
    Ok(target - left)
}

/// Receive-side interrupt: one incoming byte. Runs the line editor and
/// wakes readers when a line commits.
pub fn intr(c: u8) {
    let mut cons = CONS.lock();
    match c {
        c if c == ctrl(b'P') => {
            drop(cons);
            crate::process::proc_dump();
            return;
        }
        c if c == ctrl(b'U') => {
            while cons.e != cons.w
                && cons.buf[((cons.e - 1) % INPUT_BUF as u32) as usize] != b'\n'
            {
                cons.e -= 1;
                rubout();
            }
        }
        0x08 | 0x7f => {
            // ^H / DEL
            if cons.e != cons.w {
                cons.e -= 1;
                rubout();
            }
        }
        _ => {
            if c != 0 && cons.e - cons.r < INPUT_BUF as u32 {
                let c = if c == b'\r' { b'\n' } else { c };
                putc(c);
                let at = (cons.e % INPUT_BUF as u32) as usize;
                cons.buf[at] = c;
                cons.e += 1;
                if c == b'\n' || c == ctrl(b'D') || cons.e == cons.r + INPUT_BUF as u32 {
                    cons.w = cons.e;
                    wakeup(read_chan());
                }
            }
        }
    }
}

/// Writer hook for `print!`.
#[cfg(target_os = "none")]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;

    struct Sink;
    impl Write for Sink {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            for &b in s.as_bytes() {
                putc(b);
            }
            Ok(())
        }
    }
    let _ = Sink.write_fmt(args);
}

/// Hook the console into the world: UART up, device switch entry in.
pub fn init() {
    uart::init();
    register_device(
        CONSOLE,
        DevSw {
            read: console_read,
            write: console_write,
        },
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn reset() {
        let mut cons = CONS.lock();
        cons.r = 0;
        cons.w = 0;
        cons.e = 0;
        cons.buf = [0; INPUT_BUF];
        let _ = uart::take_output();
    }

    fn type_line(s: &[u8]) {
        for &c in s {
            intr(c);
        }
    }

    #[test]
    fn line_is_delivered_after_newline() {
        let _serial = crate::fs::test_serial();
        reset();
        type_line(b"echo hi\n");
        let mut out = [0u8; 64];
        let n = console_read(&mut IoDst::Kernel(&mut out), 64).expect("read");
        assert_eq!(&out[..n], b"echo hi\n");
    }

    #[test]
    fn carriage_return_becomes_newline_and_echoes() {
        let _serial = crate::fs::test_serial();
        reset();
        type_line(b"ok\r");
        assert_eq!(uart::take_output(), b"ok\n");
        let mut out = [0u8; 8];
        let n = console_read(&mut IoDst::Kernel(&mut out), 8).expect("read");
        assert_eq!(&out[..n], b"ok\n");
    }

    #[test]
    fn backspace_erases_and_echoes_rubout() {
        let _serial = crate::fs::test_serial();
        reset();
        type_line(b"cax");
        intr(0x7f); // DEL
        type_line(b"t\n");
        let mut out = [0u8; 8];
        let n = console_read(&mut IoDst::Kernel(&mut out), 8).expect("read");
        assert_eq!(&out[..n], b"cat\n");
        let echoed = uart::take_output();
        assert!(echoed.windows(3).any(|w| w == [8, b' ', 8]));
    }

    #[test]
    fn kill_line_discards_everything_unread() {
        let _serial = crate::fs::test_serial();
        reset();
        type_line(b"garbage");
        intr(ctrl(b'U'));
        type_line(b"ls\n");
        let mut out = [0u8; 16];
        let n = console_read(&mut IoDst::Kernel(&mut out), 16).expect("read");
        assert_eq!(&out[..n], b"ls\n");
    }

    #[test]
    fn eof_alone_reads_zero_bytes() {
        let _serial = crate::fs::test_serial();
        reset();
        intr(ctrl(b'D'));
        let mut out = [0u8; 8];
        let n = console_read(&mut IoDst::Kernel(&mut out), 8).expect("read");
        assert_eq!(n, 0);
    }

    #[test]
    fn eof_after_text_returns_partial_line_then_zero() {
        let _serial = crate::fs::test_serial();
        reset();
        type_line(b"par");
        intr(ctrl(b'D'));
        let mut out = [0u8; 8];
        let n = console_read(&mut IoDst::Kernel(&mut out), 8).expect("read");
        assert_eq!(&out[..n], b"par");
        let n = console_read(&mut IoDst::Kernel(&mut out), 8).expect("eof");
        assert_eq!(n, 0);
    }

    #[test]
    fn full_buffer_commits_the_line() {
        let _serial = crate::fs::test_serial();
        reset();
        for _ in 0..INPUT_BUF {
            intr(b'a');
        }
        // No newline arrived, yet the line is readable.
        let mut out = [0u8; INPUT_BUF];
        let n = console_read(&mut IoDst::Kernel(&mut out), INPUT_BUF).expect("read");
        assert_eq!(n, INPUT_BUF);
        assert!(out.iter().all(|&b| b == b'a'));
    }
}

//! Serial port: buffered transmit over the board UART collaborator.
//!
//! The hardware pokes themselves (FIFO registers, baud setup) belong to the
//! board driver, reached through the `uart_hw_*` contract at the bottom.
//! This module owns what the kernel cares about: a small transmit ring that
//! lets writers sleep instead of spinning on a busy FIFO, a synchronous
//! path for diagnostics that must come out even with interrupts off, and
//! the receive hand-off into the console's line discipline.

use crate::process::{sleep, wakeup};
use crate::sync::SpinLock;

const TX_BUF: usize = 32;

struct Tx {
    buf: [u8; TX_BUF],
    /// Write cursor; free-running like the pipe's.
    w: u64,
    /// Read cursor.
    r: u64,
}

static TX: SpinLock<Tx> = SpinLock::new(
    "uart",
    Tx {
        buf: [0; TX_BUF],
        w: 0,
        r: 0,
    },
);

fn tx_chan() -> usize {
    TX.data_ptr() as usize
}

/// Bring the port up. CPU 0, early.
pub fn init() {
    hw::init();
}

/// Blocking, unbuffered output for the console and panics: polls the FIFO
/// with interrupts masked.
pub fn putc_sync(c: u8) {
    crate::sync::push_off();
    while !hw::tx_ready() {
        core::hint::spin_loop();
    }
    hw::tx(c);
    crate::sync::pop_off();
}

/// Buffered output for ordinary writes; sleeps while the ring is full and
/// lets the transmit interrupt drain it.
pub fn putc(c: u8) {
    let mut tx = TX.lock();
    while tx.w == tx.r + TX_BUF as u64 {
        tx = sleep(tx_chan(), tx);
    }
    let at = (tx.w % TX_BUF as u64) as usize;
    tx.buf[at] = c;
    tx.w += 1;
    start(&mut tx);
}

/// Push buffered bytes while the FIFO accepts them; wake a blocked writer
/// for every byte that leaves.
fn start(tx: &mut Tx) {
    while tx.r < tx.w && hw::tx_ready() {
        let at = (tx.r % TX_BUF as u64) as usize;
        let c = tx.buf[at];
        tx.r += 1;
        wakeup(tx_chan());
        hw::tx(c);
    }
}

/// UART interrupt: drain incoming bytes into the console, then keep the
/// transmitter busy.
pub fn intr() {
    while let Some(c) = hw::rx() {
        crate::console::intr(c);
    }
    let mut tx = TX.lock();
    start(&mut tx);
}

/// Board UART collaborator contract.
#[cfg(target_os = "none")]
mod hw {
    pub fn init() {
        // SAFETY: collaborator contract; called once on CPU 0.
        unsafe { uart_hw_init() }
    }

    pub fn tx_ready() -> bool {
        // SAFETY: status read has no side effects.
        unsafe { uart_hw_tx_ready() }
    }

    pub fn tx(c: u8) {
        // SAFETY: caller checked tx_ready.
        unsafe { uart_hw_tx(c) }
    }

    pub fn rx() -> Option<u8> {
        // SAFETY: returns -1 when the FIFO is empty.
        let raw = unsafe { uart_hw_rx() };
        (raw >= 0).then_some(raw as u8)
    }

    extern "C" {
        fn uart_hw_init();
        fn uart_hw_tx_ready() -> bool;
        fn uart_hw_tx(c: u8);
        fn uart_hw_rx() -> i32;
    }
}

/// Host stand-in: an always-ready port that records its output for tests.
#[cfg(not(target_os = "none"))]
mod hw {
    use spin::Mutex;
    use std::vec::Vec;

    static OUTPUT: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    pub fn init() {}

    pub fn tx_ready() -> bool {
        true
    }

    pub fn tx(c: u8) {
        OUTPUT.lock().push(c);
    }

    pub fn rx() -> Option<u8> {
        None
    }

    pub fn take_output() -> Vec<u8> {
        core::mem::take(&mut OUTPUT.lock())
    }
}

/// Drain everything the simulated port transmitted (host tests).
#[cfg(not(target_os = "none"))]
pub fn take_output() -> std::vec::Vec<u8> {
    hw::take_output()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn buffered_bytes_reach_the_wire_in_order() {
        let _serial = crate::fs::test_serial();
        let _ = take_output();
        for &c in b"hello uart" {
            putc(c);
        }
        let out = take_output();
        assert!(out.ends_with(b"hello uart"));
    }

    #[test]
    fn sync_path_bypasses_the_ring() {
        let _serial = crate::fs::test_serial();
        let _ = take_output();
        putc_sync(b'!');
        assert!(take_output().ends_with(b"!"));
    }
}

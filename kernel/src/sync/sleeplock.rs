//! Sleep locks: long-term mutual exclusion that yields the CPU.
//!
//! A sleep lock wraps a spinlock-protected `held` flag; contenders sleep on
//! the lock's own address instead of spinning, so a holder may keep the lock
//! across disk I/O and its own suspensions. Used for buffer data and inode
//! contents.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::process::{self, myproc};
use crate::sync::SpinLock;

struct Inner {
    held: bool,
    /// Pid of the holder, for `holding` checks; 0 when held from a context
    /// with no process (early boot, host tests).
    pid: u32,
}

/// A mutex that sleeps rather than spins.
pub struct SleepLock<T: ?Sized> {
    inner: SpinLock<Inner>,
    data: UnsafeCell<T>,
}

// SAFETY: the lock protocol guarantees exclusive access to `data`.
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            inner: SpinLock::new(name, Inner { held: false, pid: 0 }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// Wait-channel identity: the lock's own address.
    fn chan(&self) -> usize {
        self as *const Self as *const () as usize
    }

    /// Acquire, sleeping while another holder exists.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut inner = self.inner.lock();
        while inner.held {
            inner = process::sleep(self.chan(), inner);
        }
        inner.held = true;
        inner.pid = myproc().map(|p| p.pid()).unwrap_or(0);
        drop(inner);
        SleepLockGuard { lock: self }
    }

    /// Does the current process hold this lock?
    pub fn holding(&self) -> bool {
        let inner = self.inner.lock();
        inner.held && inner.pid == myproc().map(|p| p.pid()).unwrap_or(0)
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        inner.held = false;
        inner.pid = 0;
        process::wakeup(self.chan());
    }

    /// Raw pointer to the protected data.
    ///
    /// Dereferencing is only sound when the caller can rule out any other
    /// holder, e.g. the inode layer peeking at an entry whose reference
    /// count proves nobody else can be holding its lock.
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

/// RAII guard; dropping it releases the lock and wakes one rank of waiters.
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
}

impl<T: ?Sized> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock_round_trip() {
        let lk = SleepLock::new("buffer", [0u8; 8]);
        {
            let mut g = lk.lock();
            g[0] = 7;
            assert!(lk.holding());
        }
        assert!(!lk.holding());
        assert_eq!(lk.lock()[0], 7);
    }
}

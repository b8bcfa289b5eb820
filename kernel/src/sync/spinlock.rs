//! Spinlocks with interrupt-depth accounting.
//!
//! `push_off`/`pop_off` are a per-CPU nested interrupt mask: interrupts go
//! off at the first push and come back (if they were on) only when the
//! outermost pop unwinds. Every spinlock acquisition brackets its critical
//! section with a push/pop pair, which is what makes it legal for interrupt
//! handlers and thread context to share these locks: a handler that wants
//! lock L can never fire on a CPU that already holds L.
//!
//! The guard is an ordinary RAII guard with one scheduler-specific wrinkle:
//! during a context switch, lock ownership of a process lock is handed
//! between the scheduler coroutine and the process kernel thread, so a guard
//! may legitimately be dropped by a different CPU than the one that acquired
//! it. `sched()` keeps each CPU's push/pop depth balanced across that
//! exchange, and the first-ever return into a new process releases through
//! [`SpinLock::force_release`] because no guard object exists there.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use crate::arch;
use crate::process::cpu::{mycpu, Cpu};

/// Record the interrupt-enable flag and mask all exceptions. Nestable.
pub fn push_off() {
    let old = arch::intr_get();
    arch::intr_off();
    let cpu = mycpu();
    if cpu.noff.get() == 0 {
        cpu.intena.set(old);
    }
    cpu.noff.set(cpu.noff.get() + 1);
}

/// Undo one `push_off`; re-enable interrupts when the outermost pop unwinds
/// and they were enabled to begin with.
pub fn pop_off() {
    let cpu = mycpu();
    if arch::intr_get() {
        panic!("pop_off: interruptible");
    }
    let depth = cpu.noff.get();
    if depth < 1 {
        panic!("pop_off: depth {}", depth);
    }
    cpu.noff.set(depth - 1);
    if depth == 1 && cpu.intena.get() {
        arch::intr_on();
    }
}

/// Mutual exclusion spinlock owning its data.
pub struct SpinLock<T: ?Sized> {
    name: &'static str,
    locked: AtomicBool,
    /// Address of the holder's CPU record; 0 when free.
    cpu: AtomicUsize,
    data: UnsafeCell<T>,
}

// SAFETY: the lock protocol guarantees exclusive access to `data`.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spin until the lock is held, then return the access guard.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        push_off();
        if self.holding() {
            panic!("acquire: {} already held by this cpu", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.cpu
            .store(mycpu() as *const Cpu as usize, Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    /// Does this CPU hold the lock? Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.cpu.load(Ordering::Relaxed) == mycpu() as *const Cpu as usize
    }

    /// Release without a guard.
    ///
    /// # Safety
    ///
    /// Only for the scheduler handoff: the calling CPU must hold the lock
    /// (acquired on its behalf by the scheduler), and no guard for this
    /// acquisition may exist.
    pub unsafe fn force_release(&self) {
        self.release();
    }

    fn release(&self) {
        if !self.holding() {
            panic!("release: {} not held by this cpu", self.name);
        }
        self.cpu.store(0, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    /// Raw pointer to the protected data, for wait-channel identities.
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// RAII guard; dropping it releases the lock.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// The lock this guard came from; used by `sleep` to reacquire after a
    /// wakeup.
    pub fn spinlock(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn push_pop_restores_interrupt_flag() {
        arch::intr_on();
        push_off();
        assert!(!arch::intr_get());
        push_off();
        pop_off();
        assert!(!arch::intr_get(), "inner pop must not re-enable");
        pop_off();
        assert!(arch::intr_get(), "outermost pop restores the saved flag");
        arch::intr_off();
    }

    #[test]
    fn nested_locks_keep_interrupts_masked() {
        arch::intr_on();
        let a = SpinLock::new("a", 1u32);
        let b = SpinLock::new("b", 2u32);
        {
            let ga = a.lock();
            assert!(!arch::intr_get());
            {
                let gb = b.lock();
                assert_eq!(*ga + *gb, 3);
            }
            assert!(!arch::intr_get(), "releasing b must not unmask under a");
        }
        assert!(arch::intr_get());
        arch::intr_off();
    }

    #[test]
    fn guard_gives_exclusive_mutation() {
        let lock = SpinLock::new("counter", 0u64);
        for _ in 0..100 {
            *lock.lock() += 1;
        }
        assert_eq!(*lock.lock(), 100);
    }

    #[test]
    fn holding_tracks_this_cpu() {
        let lock = SpinLock::new("h", ());
        let guard = lock.lock();
        assert!(lock.holding());
        drop(guard);
        push_off();
        assert!(!lock.holding());
        pop_off();
    }
}

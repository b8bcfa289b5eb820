//! Synchronization primitives.
//!
//! Two lock flavors, per the concurrency model: spinlocks for short critical
//! sections (they mask interrupts for their whole hold time), and sleep
//! locks for long-term exclusion such as disk I/O (they yield the CPU).

pub mod sleeplock;
pub mod spinlock;

pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{pop_off, push_off, SpinLock, SpinLockGuard};

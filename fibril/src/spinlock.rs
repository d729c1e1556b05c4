//! Spinlocks
//!
//! Every lock in the scheduler is a busy-wait lock: all of them can be
//! taken from signal-handler context, where sleeping is not an option.
//!
//! [`SpinLock`] is the guard-based form. Acquiring it masks `SIGVTALRM`
//! and `SIGUSR1` on the calling k-thread for the duration of the guard,
//! so a preemption handler can never re-enter a critical section on the
//! same CPU; the prior mask state is restored on drop.
//!
//! [`RawSpinLock`] protects the runqueues. It does no masking of its
//! own because the scheduling path needs the signals to stay masked
//! past the unlock, across the context switch, until the switched-to
//! side reopens them.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::signal;

/// Mutual exclusion with preemption-signal masking.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Mask the scheduling signals, then spin until the lock is held.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let was_blocked = signal::block_sched_signals();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinLockGuard {
            lock: self,
            was_blocked,
        }
    }
}

/// RAII guard: releases the lock and restores the signal mask on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    was_blocked: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        signal::restore_sched_signals(self.was_blocked);
    }
}

/// Bare test-and-set lock. Callers mask the scheduling signals before
/// acquiring; the scheduler keeps them masked across the unlock.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

//! # Kernel synchronization primitives

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod semaphore;
mod sync_once_cell;

pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{RawSemaphore, RawSpinLock};
pub use sync_once_cell::SyncOnceCell;

/// A mutex whose raw lock is the cooperative [`RawSpinLock`].
pub type SpinMutex<T> = Mutex<T, RawSpinLock>;

impl<T> SpinMutex<T> {
    /// Creates a new spin-locked mutex around `value`.
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpinLock::new(), value)
    }
}

/// Locking half of a raw lock primitive usable by [`Mutex`].
pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

/// Unlocking half of a raw lock primitive usable by [`Mutex`].
pub trait RawUnlock {
    /// # Safety
    /// Must only be called by the holder of the lock.
    unsafe fn raw_unlock(&self);
}

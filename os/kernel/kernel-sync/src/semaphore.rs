use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

/// A spinning counting semaphore backed by a 32-bit atomic counter.
///
/// `down` spins while the counter is zero; once it observes a nonzero
/// value it retries a weak compare-exchange down to `value - 1` until
/// one succeeds. `up` is a single release fetch-add.
///
/// There is no fairness and no blocking: callers either make progress
/// immediately or keep polling the cache line. This matches the
/// cooperative, rarely-contended boot-time locking this kernel relies
/// on; it is correct under multiple cores but has no priority handling.
///
/// # Examples
///
/// ```
/// use kernel_sync::RawSemaphore;
///
/// let sem = RawSemaphore::new(1);
/// sem.down();
/// sem.up();
/// ```
pub struct RawSemaphore {
    value: AtomicU32,
}

impl RawSemaphore {
    /// Creates a semaphore with `initial` permits available.
    #[must_use]
    pub const fn new(initial: u32) -> Self {
        Self {
            value: AtomicU32::new(initial),
        }
    }

    /// Acquires one permit, spinning until one is available.
    pub fn down(&self) {
        loop {
            let current = self.value.load(Ordering::Acquire);
            if current == 0 {
                spin_loop();
                continue;
            }
            match self.value.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
    }

    /// Attempts to acquire one permit without spinning.
    ///
    /// Returns `false` immediately if no permit is currently available
    /// rather than retrying on a lost race; a caller that wants to keep
    /// trying should call this in its own loop.
    pub fn try_down(&self) -> bool {
        let current = self.value.load(Ordering::Acquire);
        if current == 0 {
            return false;
        }
        self.value
            .compare_exchange(
                current,
                current - 1,
                Ordering::Release,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Releases one permit.
    #[inline]
    pub fn up(&self) {
        self.value.fetch_add(1, Ordering::Release);
    }
}

/// A binary semaphore used as a mutual-exclusion lock.
///
/// `RawSpinLock` is a [`RawSemaphore`] initialized to a single permit.
/// `acquire`/`release` are `down`/`up`. It implements [`RawLock`] and
/// [`RawUnlock`] so it can back a [`crate::Mutex`].
///
/// # Examples
///
/// ```
/// use kernel_sync::{Mutex, RawSpinLock};
///
/// let m: Mutex<u32, RawSpinLock> = Mutex::from_raw(RawSpinLock::new(), 0);
/// *m.lock() += 1;
/// assert_eq!(*m.lock(), 1);
/// ```
pub struct RawSpinLock {
    sem: RawSemaphore,
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpinLock {
    /// Creates a new, unlocked `RawSpinLock`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sem: RawSemaphore::new(1),
        }
    }
}

impl RawLock for RawSpinLock {
    #[inline]
    fn raw_lock(&self) {
        self.sem.down();
    }

    #[inline]
    fn raw_try_lock(&self) -> bool {
        self.sem.try_down()
    }
}

impl RawUnlock for RawSpinLock {
    #[inline]
    unsafe fn raw_unlock(&self) {
        self.sem.up();
    }
}

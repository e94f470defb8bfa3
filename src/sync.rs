//! Synchronization primitives built on busy-waiting.
//!
//! `spin::Mutex` covers every lock whose guard stays inside one function.
//! Two cases need more: the per-frame pin lock is acquired and released in
//! different functions (a guard cannot express that), and the read-ahead
//! worker sleeps on a counting semaphore. Both live here. Every wait loop
//! yields so that a spinning thread cannot starve the lock holder.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Yields the CPU inside a busy-wait loop.
#[inline]
pub(crate) fn relax() {
    #[cfg(test)]
    std::thread::yield_now();
    #[cfg(not(test))]
    core::hint::spin_loop();
}

/// A guardless mutual-exclusion lock.
///
/// Unlike `spin::Mutex`, acquisition and release are independent calls, so
/// the lock can be handed across function boundaries. It protects no data
/// by itself; what it guards is stated where it is embedded.
pub struct RawLock {
    locked: AtomicBool,
}

impl RawLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn acquire(&self) {
        while !self.try_acquire() {
            relax();
        }
    }

    /// Acquires the lock without waiting. Returns whether it was taken.
    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A counting semaphore.
pub struct Semaphore {
    value: AtomicUsize,
}

impl Semaphore {
    pub const fn new(value: usize) -> Self {
        Self {
            value: AtomicUsize::new(value),
        }
    }

    /// Increments the value, waking one waiter.
    pub fn up(&self) {
        self.value.fetch_add(1, Ordering::Release);
    }

    /// Decrements the value, waiting until it is positive.
    pub fn down(&self) {
        while !self.try_down() {
            relax();
        }
    }

    /// Decrements the value if it is positive. Returns whether it was.
    pub fn try_down(&self) -> bool {
        self.value
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn raw_lock_excludes() {
        let lock = Arc::new(RawLock::new());
        lock.acquire();
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn semaphore_counts() {
        let sema = Semaphore::new(0);
        assert!(!sema.try_down());
        sema.up();
        sema.up();
        sema.down();
        assert!(sema.try_down());
        assert!(!sema.try_down());
    }

    #[test]
    fn semaphore_wakes_waiter() {
        let sema = Arc::new(Semaphore::new(0));
        let waiter = {
            let sema = Arc::clone(&sema);
            thread::spawn(move || sema.down())
        };
        sema.up();
        waiter.join().unwrap();
    }
}

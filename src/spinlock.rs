//! Reader/writer spinlock built on a single atomic counter.
//!
//! The emit paths run in signal handlers, so blocking OS primitives are off
//! the table there; the shared side offers `try_lock_shared` which fails
//! (and the caller drops the sample) whenever the exclusive side holds the
//! lock for chunk rotation or shutdown.

use std::sync::atomic::{AtomicI32, Ordering};

const EXCLUSIVE: i32 = -1;

pub struct RwSpinLock {
    state: AtomicI32,
}

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwSpinLock {
    pub const fn new() -> Self {
        RwSpinLock {
            state: AtomicI32::new(0),
        }
    }

    /// Created already holding the exclusive lock; `unlock` releases it.
    pub const fn new_locked() -> Self {
        RwSpinLock {
            state: AtomicI32::new(EXCLUSIVE),
        }
    }

    pub fn lock(&self) {
        loop {
            if self
                .state
                .compare_exchange_weak(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            while self.state.load(Ordering::Relaxed) != 0 {
                std::hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.state.store(0, Ordering::Release);
    }

    pub fn lock_shared(&self) {
        loop {
            if self.try_lock_shared() {
                return;
            }
            while self.state.load(Ordering::Relaxed) < 0 {
                std::hint::spin_loop();
            }
        }
    }

    pub fn try_lock_shared(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        while state >= 0 {
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
        false
    }

    pub fn unlock_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_shared_excludes_exclusive() {
        let lock = RwSpinLock::new();
        assert!(lock.try_lock_shared());
        assert!(lock.try_lock_shared());
        lock.unlock_shared();
        lock.unlock_shared();
        lock.lock();
        assert!(!lock.try_lock_shared());
        lock.unlock();
        assert!(lock.try_lock_shared());
        lock.unlock_shared();
    }

    #[test]
    fn test_new_locked_starts_exclusive() {
        let lock = RwSpinLock::new_locked();
        assert!(!lock.try_lock_shared());
        lock.unlock();
        assert!(lock.try_lock_shared());
        lock.unlock_shared();
    }

    #[test]
    fn test_contended_counter() {
        let lock = Arc::new(RwSpinLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    lock.lock();
                    counter.fetch_add(1, Ordering::Relaxed);
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
    }
}

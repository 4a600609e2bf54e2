//! Monotonic tick source for event timestamps.
//!
//! On x86_64 this reads the time-stamp counter directly so the sampling
//! signal handler never enters the VDSO; elsewhere it falls back to the
//! monotonic clock. The tick frequency is calibrated once at initialization
//! and embedded into every chunk header so offline tooling can convert
//! ticks to absolute time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::os;

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static FREQUENCY: AtomicU64 = AtomicU64::new(1_000_000_000);

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn raw_ticks() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn raw_ticks() -> u64 {
    os::nanotime()
}

#[inline(always)]
pub fn ticks() -> u64 {
    raw_ticks()
}

pub fn frequency() -> u64 {
    FREQUENCY.load(Ordering::Relaxed)
}

pub fn initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Calibrate ticks/second against the monotonic clock. Idempotent; the
/// first caller wins.
pub fn initialize() {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    {
        let wall_start = os::nanotime();
        let tick_start = raw_ticks();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let wall_end = os::nanotime();
        let tick_end = raw_ticks();

        let wall_delta = wall_end.saturating_sub(wall_start);
        let tick_delta = tick_end.saturating_sub(tick_start);
        if wall_delta > 0 && tick_delta > 0 {
            let freq = (tick_delta as u128 * 1_000_000_000 / wall_delta as u128) as u64;
            FREQUENCY.store(freq, Ordering::Relaxed);
        }
    }
    // Non-x86 ticks are already nanoseconds, frequency stays 1e9.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_monotonic_after_init() {
        initialize();
        assert!(initialized());
        let a = ticks();
        let b = ticks();
        assert!(b >= a);
    }

    #[test]
    fn test_frequency_plausible() {
        initialize();
        // Anything from a slow clock source to a fast TSC, but never zero.
        assert!(frequency() >= 1_000_000);
    }
}

//! Injectable time and randomness sources.
//!
//! Lifecycle code never reads the wall clock or a global RNG directly, so
//! tests can pin both.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use rand::Rng;

use crate::db::unix_timestamp;

/// Wall clock in unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        unix_timestamp()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub const fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Uniform integer source used for backoff jitter.
pub trait JitterSource: Send + Sync {
    /// A value in `low..=high`. Implementations clamp when `low > high`.
    fn sample(&self, low: u64, high: u64) -> u64;
}

/// Thread-local `rand` generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self, low: u64, high: u64) -> u64 {
        if low >= high {
            return low;
        }
        rand::thread_rng().gen_range(low..=high)
    }
}

/// Always returns the same value, clamped into the requested range.
#[derive(Debug, Default)]
pub struct FixedJitter {
    value: AtomicU64,
}

impl FixedJitter {
    pub const fn new(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::SeqCst);
    }
}

impl JitterSource for FixedJitter {
    fn sample(&self, low: u64, high: u64) -> u64 {
        self.value.load(Ordering::SeqCst).clamp(low, high.max(low))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(86_400);
        assert_eq!(clock.now(), 87_400);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn thread_rng_jitter_stays_in_range() {
        let jitter = ThreadRngJitter;
        for _ in 0..1_000 {
            let v = jitter.sample(1, 30);
            assert!((1..=30).contains(&v));
        }
        assert_eq!(jitter.sample(7, 7), 7);
        assert_eq!(jitter.sample(9, 3), 9);
    }

    #[test]
    fn fixed_jitter_is_clamped() {
        let jitter = FixedJitter::new(100);
        assert_eq!(jitter.sample(1, 30), 30);
        jitter.set(0);
        assert_eq!(jitter.sample(1, 30), 1);
        jitter.set(12);
        assert_eq!(jitter.sample(1, 30), 12);
    }

    #[test]
    fn system_clock_tracks_unix_time() {
        let before = unix_timestamp();
        let now = SystemClock.now();
        assert!(now >= before);
    }
}

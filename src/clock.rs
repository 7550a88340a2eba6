//! Time sources for refill and prediction arithmetic.
//!
//! The library runs no background threads or timers; all refill and
//! prediction math happens on demand against a caller-supplied clock,
//! which also makes timing-sensitive behavior deterministic in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// A monotonic-enough source of nanosecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds.
    fn now_nanos(&self) -> u64;
}

/// Wall-clock time source backed by `SystemTime`.
///
/// Distributed buckets need timestamps that are meaningful across
/// processes, so this uses time since the Unix epoch rather than a
/// process-local `Instant`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at the given timestamp.
    pub fn starting_at(nanos: u64) -> Arc<Self> {
        Arc::new(Self {
            nanos: AtomicU64::new(nanos),
        })
    }

    /// Advance the clock by `delta` nanoseconds.
    pub fn advance(&self, delta: u64) {
        self.nanos.fetch_add(delta, Ordering::SeqCst);
    }

    /// Set the clock to an absolute timestamp.
    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_nanos(&self) -> u64 {
        (**self).now_nanos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::starting_at(1_000);
        assert_eq!(clock.now_nanos(), 1_000);

        clock.advance(500);
        assert_eq!(clock.now_nanos(), 1_500);

        clock.set(10_000);
        assert_eq!(clock.now_nanos(), 10_000);
    }
}

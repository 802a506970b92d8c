//! Logical clocks used to stamp cache entries.
//!
//! The cache only ever compares timestamps with each other, so any source of monotonically non-decreasing values
//! works.  Timestamps are signed so that a volatile entry stamped `now - bias` right after start-up is still
//! representable.
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// A logical timestamp in milliseconds (or ticks) since the clock's origin.
pub type Timestamp = i64;

/// A source of monotonically non-decreasing timestamps.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// Milliseconds elapsed since the clock was created, backed by [Instant].
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        self.origin.elapsed().as_millis() as Timestamp
    }
}

/// A counter which advances by one every time it is read.
///
/// Every read yields a distinct value, which makes eviction order fully deterministic.  Useful for tests and for
/// callers which drive the cache from a frame counter rather than from time.
#[derive(Debug, Default)]
pub struct LogicalClock {
    next: AtomicI64,
}

impl LogicalClock {
    pub fn new() -> LogicalClock {
        Default::default()
    }

    /// Start counting at `start`.
    pub fn starting_at(start: Timestamp) -> LogicalClock {
        LogicalClock {
            next: AtomicI64::new(start),
        }
    }
}

impl Clock for LogicalClock {
    fn now(&self) -> Timestamp {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// A clock which only moves when told to.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ManualClock {
    now: AtomicI64,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::Relaxed);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::Relaxed)
    }
}

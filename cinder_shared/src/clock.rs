//! Monotonic clock abstraction used by the scheduler and motion pipeline.

use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// A point on the process-wide monotonic clock, in nanoseconds since the
/// clock's epoch. Never wall time. Differences are signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimePoint(i64);

impl TimePoint {
    pub const ZERO: TimePoint = TimePoint(0);

    pub fn from_nanos(ns: i64) -> Self {
        TimePoint(ns)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        TimePoint((secs * 1e9) as i64)
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Signed distance to an earlier point, clamped at zero when `earlier`
    /// is actually later.
    pub fn saturating_since(self, earlier: TimePoint) -> Duration {
        Duration::from_nanos((self.0 - earlier.0).max(0) as u64)
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0 + rhs.as_nanos() as i64)
    }
}

impl AddAssign<Duration> for TimePoint {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.as_nanos() as i64;
    }
}

impl Sub<TimePoint> for TimePoint {
    /// Signed nanoseconds.
    type Output = i64;

    fn sub(self, rhs: TimePoint) -> i64 {
        self.0 - rhs.0
    }
}

/// The clock contract every higher component depends on. The underlying OS
/// primitive is behind this trait, not a detail of the callers.
pub trait Clock: Send + Sync {
    fn now(&self) -> TimePoint;

    /// Block the calling thread until the monotonic clock reaches `deadline`.
    /// Returns immediately when the deadline has already passed.
    fn sleep_until(&self, deadline: TimePoint);
}

/// Production clock backed by `std::time::Instant`, anchored at construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
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
    fn now(&self) -> TimePoint {
        TimePoint(self.origin.elapsed().as_nanos() as i64)
    }

    fn sleep_until(&self, deadline: TimePoint) {
        let now = self.now();
        if deadline > now {
            std::thread::sleep(deadline.saturating_since(now));
        }
    }
}

/// Manually advanced clock for tests and the simulator harness. `sleep_until`
/// jumps the clock forward instead of blocking, so timed pipelines run at
/// full speed under test.
#[derive(Debug, Default)]
pub struct SimClock {
    now_ns: AtomicI64,
}

impl SimClock {
    pub fn new() -> Self {
        SimClock {
            now_ns: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ns.fetch_add(by.as_nanos() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, to: TimePoint) {
        self.now_ns.store(to.as_nanos(), Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> TimePoint {
        TimePoint(self.now_ns.load(Ordering::SeqCst))
    }

    fn sleep_until(&self, deadline: TimePoint) {
        self.now_ns.fetch_max(deadline.as_nanos(), Ordering::SeqCst);
    }
}

//! Time abstractions for testable scheduling.
//!
//! Job scheduling and worker polling read time through [`Clock`] so tests can
//! drive retries and backoff without waiting on the wall clock.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses `RealClock`, tests inject `TestClock`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Returns the current system time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Real clock implementation using system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test clock for deterministic time control.
///
/// Time only moves when [`TestClock::advance`] or [`Clock::sleep`] is called.
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Nanoseconds advanced since creation.
    elapsed_ns: Arc<AtomicU64>,
    /// Base instant for monotonic time calculations.
    base_instant: Instant,
    /// System time at creation.
    base_system: SystemTime,
}

impl TestClock {
    /// Creates a new test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific system time.
    pub fn with_start_time(start: SystemTime) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            base_instant: Instant::now(),
            base_system: start,
        }
    }

    /// Advances the clock by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let duration_ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(duration_ns, Ordering::AcqRel);
    }

    /// Returns elapsed time since clock creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        self.base_system + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

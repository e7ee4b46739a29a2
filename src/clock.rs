// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Injectable wall clock and sleep.
//!
//! Bootstrap and the node monitors read the time and sleep through a
//! [`Clock`] so tests can drive them without real delays. [`TokioClock`]
//! is the production clock (it honours `tokio::time::pause()`),
//! [`ManualClock`] advances only when something sleeps on it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Boxed sleep future.
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Source of wall-clock time and timed suspension.
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Suspend for `duration`.
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// Real time: `SystemTime::now()` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests.
///
/// `sleep()` advances the clock by the requested amount, counts the call
/// and yields once to the scheduler instead of waiting.
#[derive(Debug)]
pub struct ManualClock {
    start: SystemTime,
    advanced_nanos: AtomicU64,
    sleeps: AtomicU64,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            start,
            advanced_nanos: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
        }
    }

    /// Clock starting at the given unix time (seconds).
    pub fn at_unix_secs(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    /// Move the clock forward without sleeping.
    pub fn advance(&self, by: Duration) {
        self.advanced_nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Number of completed `sleep()` calls.
    pub fn sleeps(&self) -> u64 {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at_unix_secs(1_700_000_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        self.start + Duration::from_nanos(self.advanced_nanos.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        self.advance(duration);
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        Box::pin(tokio::task::yield_now())
    }
}

/// Nanoseconds since the unix epoch (saturating, 0 before the epoch).
pub fn unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Inverse of [`unix_nanos`] for non-negative values.
pub fn from_unix_nanos(nanos: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos.max(0) as u64)
}

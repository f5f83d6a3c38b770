//! Injectable wall clock.
//!
//! Components that make time-based decisions (idle cuts, heartbeat expiry,
//! rate limiting) take an `Arc<dyn TimeProvider>` so tests can drive the
//! clock deterministically with [`MockProvider`].
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::RwLock;
use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// A point in time, stored as nanoseconds since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(i64);

impl Time {
    /// Create a `Time` from nanoseconds since the unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a `Time` from milliseconds since the unix epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Nanoseconds since the unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0
    }

    /// Milliseconds since the unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// The duration elapsed since `earlier`, or `None` if `earlier` is in
    /// the future.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        let delta = self.0.checked_sub(earlier.0)?;
        (delta >= 0).then(|| Duration::from_nanos(delta as u64))
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs.as_nanos() as i64)
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self(self.0 - rhs.as_nanos() as i64)
    }
}

/// A source of the current time.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] that reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Time::from_timestamp_nanos(d.as_nanos() as i64)
    }
}

/// A [`TimeProvider`] fixed at a settable instant, for tests.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider pinned at `now`.
    pub fn new(now: Time) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Replace the current instant.
    pub fn set(&self, now: Time) {
        *self.now.write() = now;
    }

    /// Advance the clock by `duration`, returning the new instant.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_arithmetic() {
        let t = Time::from_timestamp_nanos(100);
        assert_eq!(t + Duration::from_nanos(50), Time::from_timestamp_nanos(150));
        assert_eq!(t - Duration::from_nanos(50), Time::from_timestamp_nanos(50));

        assert_eq!(
            t.checked_duration_since(Time::from_timestamp_nanos(40)),
            Some(Duration::from_nanos(60))
        );
        assert_eq!(
            t.checked_duration_since(Time::from_timestamp_nanos(200)),
            None
        );
    }

    #[test]
    fn mock_provider() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(provider.now(), Time::from_timestamp_nanos(0));

        provider.inc(Duration::from_nanos(10));
        assert_eq!(provider.now(), Time::from_timestamp_nanos(10));

        provider.set(Time::from_timestamp_nanos(5));
        assert_eq!(provider.now(), Time::from_timestamp_nanos(5));
    }

    #[test]
    fn system_provider_is_monotonic_enough() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(b >= a);
    }
}

//! Injectable wall-clock time.
//!
//! Lifecycle timers (cooldown/recycle delays, queue-length cache staleness) need to
//! compare "now" against a recorded instant. Threading a `SystemProvider` through
//! production code and a `MockProvider` through tests means none of those tests sleep.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::RwLock;
use std::fmt::Debug;
use std::time::Duration;

/// A nanosecond-precision timestamp.
///
/// Wraps `chrono::DateTime<Utc>` so arithmetic stays in `Duration`/`i64` nanos
/// rather than leaking a timezone-aware type through every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(chrono::DateTime<chrono::Utc>);

impl Time {
    /// Create a `Time` from a nanosecond offset from the Unix epoch.
    pub fn from_timestamp_nanos(ts: i64) -> Self {
        Self(chrono::DateTime::from_timestamp_nanos(ts))
    }

    /// The number of nanoseconds since the Unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    /// Duration elapsed since `earlier`, or `None` if `earlier` is in the future.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        (self.0 - earlier.0).to_std().ok()
    }

    /// Duration elapsed since `earlier`, clamped to zero if `earlier` is in the future.
    pub fn duration_since(&self, earlier: Self) -> Duration {
        self.checked_duration_since(earlier).unwrap_or_default()
    }

    /// `self + duration`.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| self.0.checked_add_signed(d))
            .map(Self)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Something that can produce the current time.
///
/// Implemented by [`SystemProvider`] in production and [`MockProvider`] in tests.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] that reads the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new [`SystemProvider`].
    pub fn new() -> Self {
        Self {}
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(chrono::Utc::now())
    }
}

/// A [`TimeProvider`] with a settable clock, for deterministic tests.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a new [`MockProvider`] initialized to `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Set the time returned by subsequent calls to [`TimeProvider::now`].
    pub fn set(&self, time: Time) {
        *self.now.write() = time;
    }

    /// Advance the clock by `duration`.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = now.checked_add(duration).expect("time overflow");
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
    fn system_provider_advances() {
        let p = SystemProvider::new();
        let t1 = p.now();
        std::thread::sleep(Duration::from_millis(1));
        let t2 = p.now();
        assert!(t2 > t1);
    }

    #[test]
    fn mock_provider_is_settable() {
        let p = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(p.now(), Time::from_timestamp_nanos(0));
        p.inc(Duration::from_secs(5));
        assert_eq!(p.now(), Time::from_timestamp_nanos(5_000_000_000));
    }

    #[test]
    fn duration_since_clamps_future() {
        let earlier = Time::from_timestamp_nanos(10);
        let later = Time::from_timestamp_nanos(5);
        assert_eq!(earlier.checked_duration_since(later), None);
        assert_eq!(later.duration_since(earlier), Duration::ZERO);
    }
}

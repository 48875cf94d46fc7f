//! Epoch-microsecond time primitives and the clock collaborator.
//!
//! Karl's consistency contract is stated in microseconds: the keepalive log assigns
//! strictly increasing microsecond timestamps, and every liveness decision compares
//! them. Wall-clock acquisition goes through the [`Clock`] trait so that tests can
//! substitute a mock and drive timeouts deterministically.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A point in time, expressed as microseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MicroTimestamp(i64);

impl MicroTimestamp {
    /// The epoch itself; doubles as the "never" sentinel in caches.
    pub const ZERO: Self = Self(0);

    /// Creates a timestamp from raw epoch microseconds.
    #[must_use]
    pub const fn from_micros(us: i64) -> Self {
        Self(us)
    }

    /// Returns the raw epoch-microsecond value.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Returns true for the zero sentinel.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MicroTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// A signed interval in microseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MicroDuration(i64);

impl MicroDuration {
    /// The zero-length interval.
    pub const ZERO: Self = Self(0);

    /// Creates an interval from raw microseconds.
    #[must_use]
    pub const fn from_micros(us: i64) -> Self {
        Self(us)
    }

    /// Creates an interval from whole seconds.
    #[must_use]
    pub const fn from_seconds(seconds: i64) -> Self {
        Self(seconds * 1_000_000)
    }

    /// Creates an interval from whole minutes.
    #[must_use]
    pub const fn from_minutes(minutes: i64) -> Self {
        Self::from_seconds(minutes * 60)
    }

    /// Returns the raw microsecond value.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Returns the magnitude of the interval.
    #[must_use]
    pub const fn abs(self) -> Self {
        Self(self.0.abs())
    }

    /// Returns true when the interval is strictly positive.
    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Converts to a [`std::time::Duration`], clamping negatives to zero.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn as_std(self) -> std::time::Duration {
        std::time::Duration::from_micros(self.0.max(0) as u64)
    }
}

impl fmt::Display for MicroDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

impl Sub for MicroTimestamp {
    type Output = MicroDuration;

    fn sub(self, rhs: Self) -> MicroDuration {
        MicroDuration(self.0 - rhs.0)
    }
}

impl Add<MicroDuration> for MicroTimestamp {
    type Output = Self;

    fn add(self, rhs: MicroDuration) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign<MicroDuration> for MicroTimestamp {
    fn add_assign(&mut self, rhs: MicroDuration) {
        self.0 += rhs.0;
    }
}

impl Sub<MicroDuration> for MicroTimestamp {
    type Output = Self;

    fn sub(self, rhs: MicroDuration) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign<MicroDuration> for MicroTimestamp {
    fn sub_assign(&mut self, rhs: MicroDuration) {
        self.0 -= rhs.0;
    }
}

impl Add for MicroDuration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for MicroDuration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Neg for MicroDuration {
    type Output = Self;

    fn neg(self) -> Self {
        Self(-self.0)
    }
}

/// Wall-clock collaborator.
///
/// Injected at construction everywhere time is read, so tests can advance a mock
/// clock past the service timeout without sleeping.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> MicroTimestamp;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> MicroTimestamp {
        MicroTimestamp(Utc::now().timestamp_micros())
    }
}

/// Formats an interval for humans: the two most significant units of
/// days/hours/minutes/seconds, or milliseconds below one second.
#[must_use]
pub fn humanize_interval(interval: MicroDuration) -> String {
    let us = interval.as_micros().abs();
    let total_seconds = us / 1_000_000;
    if total_seconds == 0 {
        return format!("{}ms", us / 1_000);
    }

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    let units = [
        (days, "d"),
        (hours, "h"),
        (minutes, "m"),
        (seconds, "s"),
    ];
    units
        .iter()
        .skip_while(|(value, _)| *value == 0)
        .take(2)
        .map(|(value, suffix)| format!("{value}{suffix}"))
        .collect::<Vec<_>>()
        .join(" ")
}

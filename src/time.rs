//! Time APIs for obtaining the current time and calculating with points in time and durations.
//!
//! These APIs are made for the HAP stack and are not meant to be general-purpose. The APIs here
//! have millisecond resolution and use 64-bit arithmetic, matching the wall-clock precision the
//! protocol timeouts are specified in.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A duration with millisecond resolution.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u64);

impl Duration {
    /// Creates a [`Duration`] from a number of milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Duration(millis)
    }

    /// Creates a [`Duration`] representing a number of seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs * 1000)
    }

    /// Returns the number of whole seconds that fit in `self`.
    pub fn whole_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Returns the number of milliseconds represented by `self`.
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.checked_add(rhs.0).expect("duration overflow"))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.checked_sub(rhs.0).expect("duration underflow"))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1000 && self.0 % 1000 == 0 {
            write!(f, "{}s", self.whole_secs())
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// A point in time, relative to an unspecified epoch.
///
/// `Instant`s are obtained from an implementation of [`Clock`]. `Instant`s created from different
/// [`Clock`] instances (even when using the same implementation) are not compatible, and mixing
/// them in operations causes unspecified results. [`Duration`]s are independent of the [`Clock`]
/// implementation and thus can be mixed freely.
///
/// [`Clock`]: ../platform/trait.Clock.html
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64);

impl Instant {
    /// Creates an `Instant` from raw milliseconds since an arbitrary implementation-defined
    /// reference point.
    ///
    /// This should only be called from a [`Clock`] implementation.
    ///
    /// [`Clock`]: ../platform/trait.Clock.html
    pub const fn from_raw_millis(millis: u64) -> Self {
        Instant(millis)
    }

    /// Returns the raw value from which this `Instant` was created.
    pub fn raw_millis(&self) -> u64 {
        self.0
    }

    /// Calculates the duration of time that has passed between `earlier` and `self`.
    ///
    /// Both `self` and `earlier` must have been created by the same [`Clock`], and `earlier` must
    /// not lie in the future, or the result of this function will be unspecified.
    ///
    /// [`Clock`]: ../platform/trait.Clock.html
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }
}

/// [`Instant`]s can be subtracted, which computes the [`Duration`] between the rhs and lhs using
/// [`Instant::duration_since`].
impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.duration_since(rhs)
    }
}

/// A [`Duration`] can be added to an [`Instant`], moving the [`Instant`] forwards in time.
impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.wrapping_add(d.as_millis()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// A deadline slot for a single-shot timeout.
///
/// `None` means the timeout is not armed; re-arming and disarming are idempotent. The stack polls
/// deadlines against the platform clock instead of registering callbacks.
pub type Deadline = Option<Instant>;

/// Returns whether an armed deadline has elapsed at `now`.
pub fn elapsed(deadline: Deadline, now: Instant) -> bool {
    match deadline {
        Some(at) => now >= at,
        None => false,
    }
}

/// Returns the earlier of two optional deadlines.
pub fn earliest(a: Deadline, b: Deadline) -> Deadline {
    match (a, b) {
        (Some(a), Some(b)) => Some(if a <= b { a } else { b }),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_helpers() {
        let t0 = Instant::from_raw_millis(1000);
        let t1 = t0 + Duration::from_secs(10);
        assert!(!elapsed(None, t1));
        assert!(!elapsed(Some(t1), t0));
        assert!(elapsed(Some(t1), t1));
        assert_eq!(earliest(Some(t0), Some(t1)), Some(t0));
        assert_eq!(earliest(None, Some(t1)), Some(t1));
        assert_eq!(earliest(None, None), None);
        assert_eq!(t1 - t0, Duration::from_secs(10));
    }
}

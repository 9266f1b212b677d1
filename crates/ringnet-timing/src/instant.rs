use std::ops::{Add, AddAssign, Sub};

use crate::Duration;

/// A monotonic point in time, used for transaction deadlines and reconnect
/// scheduling. Wraps `std::time::Instant` rather than a calibrated TSC
/// reading: this crate has no need for cross-socket comparable timestamps.
#[derive(Copy, Clone, Debug)]
pub struct Instant(std::time::Instant);

impl Instant {
    #[inline]
    pub fn now() -> Self {
        Self(std::time::Instant::now())
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed().into()
    }

    #[inline]
    pub fn elapsed_since(&self, since: Instant) -> Duration {
        self.0.saturating_duration_since(since.0).into()
    }

    #[inline]
    pub fn saturating_sub(&self, other: Instant) -> Duration {
        self.0.saturating_duration_since(other.0).into()
    }

    #[inline]
    pub fn has_elapsed(&self, now: Instant) -> bool {
        now.0 >= self.0
    }
}

impl PartialEq for Instant {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for Instant {}

impl PartialOrd for Instant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        Instant(self.0 + std::time::Duration::from(rhs))
    }
}

impl AddAssign<Duration> for Instant {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += std::time::Duration::from(rhs);
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0 - std::time::Duration::from(rhs))
    }
}

impl Sub for Instant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Instant) -> Duration {
        self.saturating_sub(rhs)
    }
}

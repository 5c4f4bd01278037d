/*! Time structures.

The engine is driven by an external periodic tick, nominally 10 Hz. Every timer in the stack
(retransmission, persist, keepalive, TIME_WAIT, ARP eviction, reassembly expiry) is expressed in
whole ticks of that clock.

 - [Instant] is used to represent absolute time, as a tick count.
 - [Duration] is used to represent relative time, as a number of ticks.

[Instant]: struct.Instant.html
[Duration]: struct.Duration.html
*/
use core::{cmp, fmt, ops};

/// A representation of an absolute time value.
///
/// The `Instant` type is a wrapper around an `i64` tick count, monotonically increasing since an
/// arbitrary moment in time, such as system startup.
///
/// * A value of `0` is inherently arbitrary.
/// * A value less than `0` indicates a time before the starting point.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant {
    pub ticks: i64,
}

/// A relative amount of time, in ticks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration {
    pub ticks: u64,
}

/// An expiration time, inversion of `Option`.
///
/// `Never` compares greater than any concrete deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    When(Instant),
    Never,
}

use self::Expiration::{Never, When};

/// The nominal tick frequency assumed by all timeout constants.
pub const TICK_HZ: u64 = 10;

impl Instant {
    /// Create a new `Instant` from a tick count.
    pub const fn from_ticks(ticks: i64) -> Instant {
        Instant { ticks }
    }

    /// The total number of ticks that have passed since the beginning of time.
    pub const fn total_ticks(&self) -> i64 {
        self.ticks
    }

    /// The number of whole seconds represented, at the nominal tick rate.
    pub const fn secs(&self) -> i64 {
        self.ticks / TICK_HZ as i64
    }
}

impl Duration {
    /// The zero-length duration.
    pub const ZERO: Duration = Duration { ticks: 0 };

    /// Create a new `Duration` from a number of ticks.
    pub const fn from_ticks(ticks: u64) -> Duration {
        Duration { ticks }
    }

    /// Create a new `Duration` from a number of seconds, at the nominal tick rate.
    pub const fn from_secs(secs: u64) -> Duration {
        Duration { ticks: secs * TICK_HZ }
    }

    /// The number of ticks represented.
    pub const fn as_ticks(&self) -> u64 {
        self.ticks
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}t", self.ticks)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}t", self.ticks)
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant::from_ticks(self.ticks + rhs.ticks as i64)
    }
}

impl ops::AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.ticks += rhs.ticks as i64;
    }
}

impl ops::Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant::from_ticks(self.ticks - rhs.ticks as i64)
    }
}

impl ops::Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        // A span ending before it begins is empty, not its mirror image.
        Duration::from_ticks((self.ticks - rhs.ticks).max(0) as u64)
    }
}

impl ops::Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration::from_ticks(self.ticks + rhs.ticks)
    }
}

impl ops::Mul<u64> for Duration {
    type Output = Duration;

    fn mul(self, rhs: u64) -> Duration {
        Duration::from_ticks(self.ticks * rhs)
    }
}

impl Default for Expiration {
    fn default() -> Self {
        Expiration::Never
    }
}

impl From<Option<Instant>> for Expiration {
    fn from(opt: Option<Instant>) -> Self {
        match opt {
            Some(instant) => When(instant),
            None => Never,
        }
    }
}

impl From<Expiration> for Option<Instant> {
    fn from(opt: Expiration) -> Self {
        match opt {
            When(instant) => Some(instant),
            Never => None,
        }
    }
}

impl cmp::PartialOrd<Self> for Expiration {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl cmp::Ord for Expiration {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        match (*self, *other) {
            (Never, Never) => cmp::Ordering::Equal,
            (Never, When(_)) => cmp::Ordering::Greater,
            (When(_), Never) => cmp::Ordering::Less,
            (When(ref a), When(ref b)) => a.cmp(b),
        }
    }
}

impl Expiration {
    /// Whether the deadline, if any, has been reached at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        match *self {
            When(at) => now >= at,
            Never => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_instant_ops() {
        assert_eq!(Instant::from_ticks(4) + Duration::from_ticks(6), Instant::from_ticks(10));
        assert_eq!(Instant::from_ticks(7) - Duration::from_ticks(5), Instant::from_ticks(2));
        assert_eq!(Instant::from_ticks(7) - Instant::from_ticks(5), Duration::from_ticks(2));
        assert_eq!(Instant::from_ticks(5) - Instant::from_ticks(7), Duration::from_ticks(0));
    }

    #[test]
    fn test_expiration_order() {
        assert!(Expiration::Never > Expiration::When(Instant::from_ticks(i64::max_value())));
        assert!(Expiration::When(Instant::from_ticks(1)) < Expiration::When(Instant::from_ticks(2)));
    }

    #[test]
    fn test_expiration_due() {
        let deadline = Expiration::When(Instant::from_ticks(10));
        assert!(!deadline.is_due(Instant::from_ticks(9)));
        assert!(deadline.is_due(Instant::from_ticks(10)));
        assert!(!Expiration::Never.is_due(Instant::from_ticks(i64::max_value())));
    }
}

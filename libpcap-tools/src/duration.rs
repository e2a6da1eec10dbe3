use serde::Serialize;
use std::fmt;
use std::ops::{Add, Sub};

/// Reimplementation of std::time::Duration, but panic-free
/// and partial, only to match our needs:
///   - use micros instead of nanos, avoid casts
///   - expose fields
///
/// Used both for capture timestamps and for timeouts, since all timers
/// run on the capture clock.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug, Serialize)]
pub struct Duration {
    pub secs: u32,
    pub micros: u32,
}

pub const MICROS_PER_SEC: u32 = 1_000_000;

impl Duration {
    /// Build Duration from secs and micros
    pub fn new(secs: u32, micros: u32) -> Duration {
        let secs = secs.wrapping_add(micros / MICROS_PER_SEC);
        Duration {
            secs,
            micros: micros % MICROS_PER_SEC,
        }
    }

    pub const fn from_secs(secs: u32) -> Duration {
        Duration { secs, micros: 0 }
    }

    pub fn from_micros(micros: u64) -> Duration {
        let secs = (micros / MICROS_PER_SEC as u64).min(u32::MAX as u64) as u32;
        let micros = (micros % MICROS_PER_SEC as u64) as u32;
        Duration { secs, micros }
    }

    /// Test if Duration object is null
    #[inline]
    pub fn is_null(self) -> bool {
        self.secs == 0 && self.micros == 0
    }

    #[inline]
    pub fn as_micros(self) -> u64 {
        self.secs as u64 * MICROS_PER_SEC as u64 + self.micros as u64
    }

    /// Subtraction clamped to zero, for intervals computed from
    /// timestamps that may be slightly out of order.
    pub fn saturating_sub(self, other: Duration) -> Duration {
        if self <= other {
            Duration::default()
        } else {
            self - other
        }
    }
}

impl Add for Duration {
    type Output = Duration;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn add(self, other: Duration) -> Self::Output {
        let secs = self.secs.wrapping_add(other.secs);
        let micros = self.micros.wrapping_add(other.micros);
        let (secs, micros) = if micros >= MICROS_PER_SEC {
            (
                secs.wrapping_add(micros / MICROS_PER_SEC),
                micros % MICROS_PER_SEC,
            )
        } else {
            (secs, micros)
        };

        Duration { secs, micros }
    }
}

impl Sub for Duration {
    type Output = Duration;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn sub(self, other: Duration) -> Self::Output {
        let secs = self.secs.wrapping_sub(other.secs);
        let (secs, micros) = if self.micros >= other.micros {
            (secs, self.micros - other.micros)
        } else {
            let diff = other.micros.wrapping_sub(self.micros);
            let secs_less = diff / MICROS_PER_SEC;
            let micros = MICROS_PER_SEC - (diff % MICROS_PER_SEC);
            (secs.wrapping_sub(1 + secs_less), micros)
        };

        Duration { secs, micros }
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}

#[cfg(test)]
mod tests {
    use super::Duration;
    #[test]
    fn duration_sub() {
        let d1 = Duration::new(1234, 5678);
        let d2 = Duration::new(1234, 6789);
        let d = d2 - d1;
        assert_eq!(d.secs, 0);
        assert_eq!(d.micros, 1111);

        let d = Duration::new(10, 100) - Duration::new(8, 200);
        assert_eq!(d, Duration::new(1, 999_900));
    }

    #[test]
    fn duration_add_carries() {
        let d = Duration::new(1, 600_000) + Duration::new(2, 400_000);
        assert_eq!(d, Duration::new(4, 0));
        let d = Duration::new(1, 999_999) + Duration::new(0, 2);
        assert_eq!(d, Duration::new(2, 1));
    }

    #[test]
    fn duration_micros() {
        let d = Duration::new(3, 250);
        assert_eq!(d.as_micros(), 3_000_250);
        assert_eq!(Duration::from_micros(3_000_250), d);
        assert_eq!(
            Duration::new(1, 0).saturating_sub(Duration::new(2, 0)),
            Duration::default()
        );
        assert_eq!(format!("{}", Duration::new(5, 42)), "5.000042");
    }
}

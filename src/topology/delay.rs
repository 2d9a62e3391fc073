use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Latency in milliseconds with two reserved values: `-1` no data, `0` timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delay(i64);

impl Delay {
    pub const NO_DATA: Delay = Delay(-1);
    pub const TIMED_OUT: Delay = Delay(0);

    /// Measured latency; a zero measurement is indistinguishable from a timeout.
    pub fn ms(millis: u32) -> Self {
        Delay(i64::from(millis))
    }

    /// Clamp any raw value into the three-way domain.
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            Delay::NO_DATA
        } else {
            Delay(raw)
        }
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_available(self) -> bool {
        self.0 > 0
    }

    pub fn is_timed_out(self) -> bool {
        self.0 == 0
    }

    pub fn is_missing(self) -> bool {
        self.0 < 0
    }

    fn tier(self) -> u8 {
        match self.0 {
            n if n > 0 => 0,
            0 => 1,
            _ => 2,
        }
    }

    /// Ordering used by latency sorts: measured, then timed out, then no data.
    /// Only two measured values are compared numerically.
    pub fn rank(self, other: Delay, descending: bool) -> Ordering {
        match self.tier().cmp(&other.tier()) {
            Ordering::Equal if self.is_available() => {
                if descending {
                    other.0.cmp(&self.0)
                } else {
                    self.0.cmp(&other.0)
                }
            }
            ordering => ordering,
        }
    }

    pub fn label(self) -> &'static str {
        match self.0 {
            n if n <= 0 => "Unavailable",
            n if n < 200 => "Fast",
            n if n < 500 => "Good",
            _ => "Slow",
        }
    }
}

impl Default for Delay {
    fn default() -> Self {
        Delay::NO_DATA
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            n if n > 0 => write!(f, "{}ms", n),
            0 => write!(f, "timeout"),
            _ => write!(f, "-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_tiers() {
        let fast = Delay::ms(80);
        let slow = Delay::ms(400);
        assert_eq!(fast.rank(slow, false), Ordering::Less);
        assert_eq!(fast.rank(slow, true), Ordering::Greater);
        // tiers never flip with direction
        assert_eq!(slow.rank(Delay::TIMED_OUT, true), Ordering::Less);
        assert_eq!(Delay::TIMED_OUT.rank(Delay::NO_DATA, false), Ordering::Less);
        assert_eq!(Delay::NO_DATA.rank(Delay::NO_DATA, false), Ordering::Equal);
    }

    #[test]
    fn test_from_raw_clamps() {
        assert_eq!(Delay::from_raw(-42), Delay::NO_DATA);
        assert_eq!(Delay::from_raw(0), Delay::TIMED_OUT);
        assert_eq!(Delay::from_raw(120).to_string(), "120ms");
    }

    #[test]
    fn test_label_tiers() {
        assert_eq!(Delay::ms(80).label(), "Fast");
        assert_eq!(Delay::ms(300).label(), "Good");
        assert_eq!(Delay::ms(800).label(), "Slow");
        assert_eq!(Delay::TIMED_OUT.label(), "Unavailable");
        assert_eq!(Delay::NO_DATA.label(), "Unavailable");
    }
}

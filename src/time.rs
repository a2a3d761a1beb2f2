//! Simulation time for the event-loop kernel.
//!
//! Represents a point on the simulated time axis with no dependency on
//! `std::time`. Time advances only when the event loop moves to the next
//! timed notification, never from wall-clock observation.

use std::cmp::Ordering;

use crate::error::{KernelError, KernelResult};

/// A non-negative point in simulation time.
///
/// Wraps an `f64` but provides a *total* order so it can key the
/// scheduler's min-heap. Values are produced only through [`SimTime::ZERO`]
/// and [`SimTime::plus`], which rejects negative and NaN delays, so the
/// ordering never has to deal with NaN in practice.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SimTime(f64);

impl SimTime {
    /// The zero-point of simulation time.
    pub const ZERO: SimTime = SimTime(0.0);

    /// Return the raw time value.
    #[inline]
    pub fn value(self) -> f64 {
        self.0
    }

    /// Compute the absolute time that is `delay` after `self`.
    ///
    /// Returns [`KernelError::NegativeDelay`] if `delay` is negative or NaN.
    #[inline]
    pub fn plus(self, delay: f64) -> KernelResult<SimTime> {
        check_delay(delay)?;
        Ok(SimTime(self.0 + delay))
    }

    /// Returns `true` if `self` is strictly before `other`.
    #[inline]
    pub fn is_before(self, other: SimTime) -> bool {
        self.0 < other.0
    }

    /// Returns `true` if `self` lies beyond the `limit` of a bounded run.
    #[inline]
    pub fn exceeds(self, limit: f64) -> bool {
        self.0 > limit
    }
}

impl Eq for SimTime {}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<SimTime> for f64 {
    fn from(t: SimTime) -> f64 {
        t.0
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T={}", self.0)
    }
}

/// Validate a notification delay.
pub(crate) fn check_delay(delay: f64) -> KernelResult<()> {
    // `!(x >= 0)` also catches NaN.
    if !(delay >= 0.0) {
        return Err(KernelError::NegativeDelay { delay });
    }
    Ok(())
}

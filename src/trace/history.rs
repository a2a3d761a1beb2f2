//! Append-only, time-ordered sample storage with binary-search queries.

use crate::error::{KernelError, KernelResult};

/// Parallel vectors of sample times and values.
///
/// Times are non-decreasing; several samples may share one instant.
#[derive(Debug, Clone, Default)]
pub(crate) struct History<T> {
    times: Vec<f64>,
    values: Vec<T>,
}

impl<T> History<T> {
    pub(crate) fn new() -> Self {
        History {
            times: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Append a sample, rejecting a time before the last recorded one.
    pub(crate) fn record(&mut self, trace: &str, time: f64, value: T) -> KernelResult<()> {
        if let Some(&last) = self.times.last() {
            // `!(a >= b)` also rejects NaN.
            if !(time >= last) {
                return Err(KernelError::NonMonotonicRecord {
                    trace: trace.to_string(),
                    time,
                    last,
                });
            }
        }
        self.times.push(time);
        self.values.push(value);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.times.clear();
        self.values.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.times.len()
    }

    pub(crate) fn times(&self) -> &[f64] {
        &self.times
    }

    pub(crate) fn values(&self) -> &[T] {
        &self.values
    }

    /// Index of the first sample at or after `t`.
    fn first_at(&self, t: f64) -> usize {
        self.times.partition_point(|&x| x < t)
    }

    /// One past the index of the last sample at or before `t`.
    fn end_at(&self, t: f64) -> usize {
        self.times.partition_point(|&x| x <= t)
    }

    /// The sample in effect at `t`.
    ///
    /// Without a sample exactly at `t` this is the latest sample before
    /// `t`. With samples at `t`, `after` selects the last of them, and
    /// `!after` the sample preceding the first of them.
    pub(crate) fn sample_at(&self, trace: &str, t: f64, after: bool) -> KernelResult<&T> {
        let bound = if after { self.end_at(t) } else { self.first_at(t) };
        bound
            .checked_sub(1)
            .map(|i| &self.values[i])
            .ok_or_else(|| KernelError::UndefinedHistory {
                trace: trace.to_string(),
                time: t,
            })
    }

    /// Latest recorded time at or before `t`.
    pub(crate) fn last_at_or_before(&self, t: f64) -> Option<f64> {
        self.end_at(t).checked_sub(1).map(|i| self.times[i])
    }

    /// Returns `true` if any sample lies in the closed range `[lo, hi]`.
    pub(crate) fn any_within(&self, lo: f64, hi: f64) -> bool {
        self.times
            .get(self.first_at(lo))
            .is_some_and(|&t| t <= hi)
    }
}

impl<T: PartialEq> History<T> {
    /// Latest instant at or before `t` whose final value differs from
    /// the value in effect just before it.
    ///
    /// Samples sharing an instant collapse to the last of them, so a
    /// value that changes and changes back within one instant does not
    /// count. The first recorded instant always counts as a change.
    pub(crate) fn last_changed(&self, t: f64) -> f64 {
        let mut end = self.end_at(t);
        while end > 0 {
            let instant = self.times[end - 1];
            let start = self.first_at(instant);
            if start == 0 || self.values[end - 1] != self.values[start - 1] {
                return instant;
            }
            end = start;
        }
        f64::NEG_INFINITY
    }
}

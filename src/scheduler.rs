//! Pending queue of timed notifications.
//!
//! Uses a `BinaryHeap` with reversed `Ord` on [`Scheduled`] to act as a
//! min-heap keyed by `(fire_at, seq)`. Sequence numbers are strictly
//! increasing, so notifications due at the same instant are drained in
//! the order they were issued and two runs with the same notify script
//! produce the same dispatch order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::event::Event;
use crate::time::SimTime;

// ── Scheduled ─────────────────────────────────────────────────────────

/// A single queued notification.
#[derive(Debug, Clone)]
pub(crate) struct Scheduled {
    pub(crate) fire_at: SimTime,
    pub(crate) seq: u64,
    pub(crate) event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

/// Ordering: smallest `(fire_at, seq)` first.
///
/// Rust's `BinaryHeap` is a *max*-heap, so the natural ordering is
/// reversed here to turn it into a min-heap.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────

/// Time-ordered pending queue owned by the event loop.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    queue: BinaryHeap<Scheduled>,
    next_seq: u64,
}

impl Scheduler {
    /// Create a new, empty queue.
    pub(crate) fn new() -> Self {
        Scheduler {
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Queue `event` to fire at the absolute time `fire_at`.
    pub(crate) fn schedule(&mut self, fire_at: SimTime, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Scheduled { fire_at, seq, event });
    }

    /// Fire time of the earliest outstanding notification.
    pub(crate) fn peek_time(&self) -> Option<SimTime> {
        self.queue.peek().map(|s| s.fire_at)
    }

    /// Remove and return every notification due at or before `now`,
    /// in `(fire_at, seq)` order.
    pub(crate) fn drain_due(&mut self, now: SimTime) -> Vec<Event> {
        let mut due = Vec::new();
        while self.peek_time().is_some_and(|t| t <= now) {
            if let Some(s) = self.queue.pop() {
                due.push(s.event);
            }
        }
        due
    }

    /// Pop the next notification (earliest time, lowest sequence).
    #[cfg(test)]
    pub(crate) fn pop_next(&mut self) -> Option<Scheduled> {
        self.queue.pop()
    }

    /// Returns `true` if nothing is queued.
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued notifications.
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Drop every queued notification.
    pub(crate) fn clear(&mut self) {
        self.queue.clear();
    }
}

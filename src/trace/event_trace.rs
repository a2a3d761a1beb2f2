//! Occurrence traces for events.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::KernelResult;
use crate::event::{Event, SubscriptionId};
use crate::event_loop::EventLoop;

use super::history::History;

struct Inner {
    history: History<()>,
    binding: Option<(Event, SubscriptionId)>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some((event, sub)) = self.binding.take() {
            event.unsubscribe_static(sub);
        }
    }
}

/// Records the times at which an event fired.
///
/// While bound to an event, a static subscriber appends the loop's
/// current time on every firing. Samples are append-only and must be
/// non-decreasing; re-running a loop after [`EventLoop::reset`] without
/// calling [`EventTrace::clear`] makes the next recording fail the run.
#[derive(Clone)]
pub struct EventTrace {
    name: Rc<str>,
    inner: Rc<RefCell<Inner>>,
}

impl EventTrace {
    /// Create an unbound trace, filled only through [`EventTrace::record`].
    pub fn new(name: impl Into<String>) -> Self {
        EventTrace {
            name: Rc::from(name.into()),
            inner: Rc::new(RefCell::new(Inner {
                history: History::new(),
                binding: None,
            })),
        }
    }

    /// Create a trace bound to `event`.
    pub fn bound(name: impl Into<String>, event: &Event) -> Self {
        let trace = EventTrace::new(name);
        trace.trace(Some(event));
        trace
    }

    /// Diagnostic name, used in error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event currently traced, if any.
    pub fn event(&self) -> Option<Event> {
        self.inner.borrow().binding.as_ref().map(|(e, _)| e.clone())
    }

    /// Start tracing `event`, stop tracing the previous one. Rebinding to
    /// the event already traced is a no-op.
    pub fn trace(&self, event: Option<&Event>) {
        let mut inner = self.inner.borrow_mut();
        let current = inner.binding.as_ref().map(|(e, _)| e);
        if current == event {
            return;
        }
        if let Some((old, sub)) = inner.binding.take() {
            old.unsubscribe_static(sub);
        }
        if let Some(event) = event {
            let sub = event.subscribe_static(recorder(
                Rc::downgrade(&self.inner),
                Rc::clone(&self.name),
                event.owner().clone(),
            ));
            inner.binding = Some((event.clone(), sub));
        }
    }

    /// Append an occurrence at `time`.
    pub fn record(&self, time: f64) -> KernelResult<()> {
        self.inner.borrow_mut().history.record(&self.name, time, ())
    }

    /// Drop every recorded occurrence. The binding is kept.
    pub fn clear(&self) {
        self.inner.borrow_mut().history.clear();
    }

    /// Recorded occurrence times, in order.
    pub fn times(&self) -> Vec<f64> {
        self.inner.borrow().history.times().to_vec()
    }

    /// Number of recorded occurrences.
    pub fn len(&self) -> usize {
        self.inner.borrow().history.len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Did an occurrence fall within `[t + tolerance, t + acausal_tolerance]`?
    ///
    /// A negative `tolerance` looks into the past, a positive
    /// `acausal_tolerance` into the future; `sample_at(t, 0.0, 0.0)` asks
    /// whether the event fired exactly at `t`.
    pub fn sample_at(&self, t: f64, tolerance: f64, acausal_tolerance: f64) -> bool {
        self.inner
            .borrow()
            .history
            .any_within(t + tolerance, t + acausal_tolerance)
    }

    /// Latest occurrence at or before `t`, or negative infinity.
    pub fn last_changed(&self, t: f64) -> f64 {
        self.inner
            .borrow()
            .history
            .last_at_or_before(t)
            .unwrap_or(f64::NEG_INFINITY)
    }
}

/// Static subscriber appending the loop time to a trace. Holds only weak
/// references so a binding never keeps the trace or the loop alive.
fn recorder(
    inner: Weak<RefCell<Inner>>,
    name: Rc<str>,
    owner: Weak<crate::event_loop::LoopCore>,
) -> impl FnMut() + 'static {
    move || {
        let (Some(inner), Ok(el)) = (inner.upgrade(), EventLoop::upgrade(&owner)) else {
            return;
        };
        let result = inner.borrow_mut().history.record(&name, el.now(), ());
        if let Err(e) = result {
            el.report_fault(e);
        }
    }
}

impl std::fmt::Debug for EventTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTrace")
            .field("name", &self.name)
            .field("times", &self.inner.borrow().history.times())
            .finish()
    }
}

//! Value traces for signals.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::KernelResult;
use crate::event::{Event, SubscriptionId};
use crate::event_loop::{EventLoop, LoopCore};
use crate::signal::{Signal, SignalCore};

use super::history::History;

// ── Options ───────────────────────────────────────────────────────────

/// Which signal event a bound trace listens to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum TraceMode {
    /// Record on `updated`: every committed write, including same-value ones.
    AllUpdates,
    /// Record on `changed`: only writes that changed the value.
    #[default]
    ChangesOnly,
}

/// Configuration of a [`SignalTrace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceOptions {
    pub mode: TraceMode,
    /// Record the committed value when binding, and `(0, initial)` after
    /// [`SignalTrace::clear`], so queries never fall before the history.
    pub seed_initial: bool,
}

impl Default for TraceOptions {
    fn default() -> Self {
        TraceOptions {
            mode: TraceMode::ChangesOnly,
            seed_initial: true,
        }
    }
}

impl TraceOptions {
    /// Default options in [`TraceMode::AllUpdates`] mode.
    pub fn all_updates() -> Self {
        TraceOptions::default().with_mode(TraceMode::AllUpdates)
    }

    pub fn with_mode(mut self, mode: TraceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_seed_initial(mut self, seed: bool) -> Self {
        self.seed_initial = seed;
        self
    }
}

// ── SignalTrace ───────────────────────────────────────────────────────

struct Binding<T> {
    signal: Signal<T>,
    event: Event,
    sub: SubscriptionId,
}

struct Inner<T> {
    history: History<T>,
    binding: Option<Binding<T>>,
    options: TraceOptions,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(b) = self.binding.take() {
            b.event.unsubscribe_static(b.sub);
        }
    }
}

/// Records the committed values of a signal over time.
///
/// Queries use step semantics: the value at `t` is the latest sample at or
/// before `t`. Several samples may share one instant; [`SignalTrace::sample_at`]
/// picks the last of them or the value in effect before them.
pub struct SignalTrace<T> {
    name: Rc<str>,
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for SignalTrace<T> {
    fn clone(&self) -> Self {
        SignalTrace {
            name: Rc::clone(&self.name),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: PartialEq + Clone + 'static> SignalTrace<T> {
    /// Create an unbound trace with the default options.
    pub fn new(name: impl Into<String>) -> Self {
        SignalTrace::with_options(name, TraceOptions::default())
    }

    /// Create an unbound trace.
    pub fn with_options(name: impl Into<String>, options: TraceOptions) -> Self {
        SignalTrace {
            name: Rc::from(name.into()),
            inner: Rc::new(RefCell::new(Inner {
                history: History::new(),
                binding: None,
                options,
            })),
        }
    }

    /// Create a trace bound to `signal`.
    pub fn bound(name: impl Into<String>, signal: &Signal<T>, options: TraceOptions) -> Self {
        let trace = SignalTrace::with_options(name, options);
        trace.trace(Some(signal));
        trace
    }

    /// Diagnostic name, used in error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options the trace was created with.
    pub fn options(&self) -> TraceOptions {
        self.inner.borrow().options
    }

    /// The signal currently traced, if any.
    pub fn signal(&self) -> Option<Signal<T>> {
        self.inner.borrow().binding.as_ref().map(|b| b.signal.clone())
    }

    /// Start tracing `signal`, stop tracing the previous one.
    ///
    /// With `seed_initial`, binding records the signal's committed value
    /// at the current loop time. Rebinding to the signal already traced
    /// is a no-op.
    pub fn trace(&self, signal: Option<&Signal<T>>) {
        let mut inner = self.inner.borrow_mut();
        let same = match (&inner.binding, signal) {
            (Some(b), Some(s)) => b.signal.ptr_eq(s),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }
        if let Some(b) = inner.binding.take() {
            b.event.unsubscribe_static(b.sub);
        }
        let Some(signal) = signal else { return };

        let event = match inner.options.mode {
            TraceMode::AllUpdates => signal.updated().clone(),
            TraceMode::ChangesOnly => signal.changed().clone(),
        };
        let sub = event.subscribe_static(recorder(
            Rc::downgrade(&self.inner),
            signal.downgrade(),
            Rc::clone(&self.name),
            signal.owner().clone(),
        ));
        if inner.options.seed_initial {
            let now = EventLoop::upgrade(signal.owner()).map_or(0.0, |el| el.now());
            if let Err(e) = inner.history.record(&self.name, now, signal.get()) {
                tracing::warn!(trace = %self.name, error = %e, "initial sample dropped");
            }
        }
        inner.binding = Some(Binding {
            signal: signal.clone(),
            event,
            sub,
        });
    }

    /// Append a sample.
    pub fn record(&self, time: f64, value: T) -> KernelResult<()> {
        self.inner.borrow_mut().history.record(&self.name, time, value)
    }

    /// Drop every sample. A bound trace with `seed_initial` is re-seeded
    /// with `(0, initial)`.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.history.clear();
        if !inner.options.seed_initial {
            return;
        }
        let initial = inner.binding.as_ref().map(|b| b.signal.initial().clone());
        if let Some(initial) = initial {
            // Empty history: the first record cannot fail.
            let _ = inner.history.record(&self.name, 0.0, initial);
        }
    }

    /// The value in effect at `t`.
    ///
    /// When samples exist at exactly `t`, `after` selects the last of them
    /// and `!after` the value in effect just before them. Fails with
    /// [`KernelError::UndefinedHistory`](crate::KernelError::UndefinedHistory)
    /// when no such sample exists.
    pub fn sample_at(&self, t: f64, after: bool) -> KernelResult<T> {
        self.inner
            .borrow()
            .history
            .sample_at(&self.name, t, after)
            .cloned()
    }

    /// Latest instant at or before `t` at which the value changed, or
    /// negative infinity.
    pub fn last_changed(&self, t: f64) -> f64 {
        self.inner.borrow().history.last_changed(t)
    }

    /// Recorded samples as `(time, value)` pairs, in order.
    pub fn samples(&self) -> Vec<(f64, T)> {
        let inner = self.inner.borrow();
        inner
            .history
            .times()
            .iter()
            .copied()
            .zip(inner.history.values().iter().cloned())
            .collect()
    }

    /// Recorded sample times, in order.
    pub fn times(&self) -> Vec<f64> {
        self.inner.borrow().history.times().to_vec()
    }

    /// Recorded values, in time order.
    pub fn values(&self) -> Vec<T> {
        self.inner.borrow().history.values().to_vec()
    }

    /// Number of recorded samples.
    pub fn len(&self) -> usize {
        self.inner.borrow().history.len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn recorder<T: PartialEq + Clone + 'static>(
    inner: Weak<RefCell<Inner<T>>>,
    signal: Weak<SignalCore<T>>,
    name: Rc<str>,
    owner: Weak<LoopCore>,
) -> impl FnMut() + 'static {
    move || {
        let (Some(inner), Some(signal), Ok(el)) = (
            inner.upgrade(),
            Signal::from_weak(&signal),
            EventLoop::upgrade(&owner),
        ) else {
            return;
        };
        let result = inner
            .borrow_mut()
            .history
            .record(&name, el.now(), signal.get());
        if let Err(e) = result {
            el.report_fault(e);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SignalTrace<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SignalTrace")
            .field("name", &self.name)
            .field("options", &inner.options)
            .field("times", &inner.history.times())
            .field("values", &inner.history.values())
            .finish()
    }
}

//! History traces.
//!
//! A trace is an append-only, time-ordered recorder. Bound to an [`Event`]
//! it records when the event fired; bound to a [`Signal`] it records the
//! committed value each time the signal changed (or was updated). Both
//! answer point and interval queries by binary search over the sample
//! times.
//!
//! [`Event`]: crate::Event
//! [`Signal`]: crate::Signal

mod event_trace;
mod history;
mod signal_trace;

pub use event_trace::EventTrace;
pub use signal_trace::{SignalTrace, TraceMode, TraceOptions};

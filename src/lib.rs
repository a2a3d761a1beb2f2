//! # Pulsar — Discrete-Event Simulation Kernel
//!
//! A single-threaded kernel for modelling concurrent processes that
//! exchange signals, with a deterministic global order of cause and
//! effect. Time is simulated: it advances only when the loop moves to
//! the next timed notification.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │               EventLoop                │
//! │  ┌──────────────┐  ┌────────────────┐  │
//! │  │  Scheduler   │  │ immediate set  │  │ ← timed / delta notifications
//! │  └──────────────┘  └────────────────┘  │
//! │  ┌──────────────┐  ┌────────────────┐  │
//! │  │ update set   │  │   processes    │  │ ← two-phase commits / async tasks
//! │  └──────────────┘  └────────────────┘  │
//! └───────────────▲────────────────────────┘
//!                 │ notify / request_update
//!   ┌─────────────┴──┐     ┌──────────────┐
//!   │     Event      │◄────│    Signal    │ ← changed / updated events
//!   └───────▲────────┘     └──────▲───────┘
//!           │ subscribe           │ subscribe
//!   ┌───────┴────────┐     ┌──────┴───────┐
//!   │   EventTrace   │     │ SignalTrace  │ ← time-ordered history
//!   └────────────────┘     └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use pulsar::{EventLoop, Signal, SignalTrace, TraceOptions};
//!
//! let el = EventLoop::new();
//! let level = Signal::new("level", 10, &el);
//! let trace = SignalTrace::bound("level", &level, TraceOptions::default());
//!
//! let (h, s) = (el.handle(), level.clone());
//! el.spawn("ramp", async move {
//!     for step in 1..=4 {
//!         h.delay(1.0)?.wait().await?;
//!         s.set(s.get() + step);
//!     }
//!     Ok(())
//! });
//!
//! el.run().unwrap();
//! assert_eq!(trace.values(), vec![10, 11, 13, 16, 20]);
//! assert_eq!(trace.sample_at(2.5, true).unwrap(), 13);
//! ```

pub mod error;
pub mod event;
pub mod event_loop;
pub mod process;
mod scheduler;
pub mod signal;
pub mod time;
pub mod trace;

// Re-exports for convenience.
pub use error::{KernelError, KernelResult};
pub use event::{Event, EventId, SubscriptionId};
pub use event_loop::{EventLoop, LoopHandle, LoopPhase, RunStats, Update};
pub use process::{EventWait, ProcessHandle, ProcessState};
pub use signal::Signal;
pub use time::SimTime;
pub use trace::{EventTrace, SignalTrace, TraceMode, TraceOptions};

//! Continuation bridge: suspending simulated processes on events.
//!
//! A process is an ordinary `Future` hosted by the [`EventLoop`]. Awaiting
//! [`Event::wait`] registers the process's resumption as a one-shot
//! dynamic subscriber of the event; when the event fires, the subscriber
//! wakes the process and the loop polls it in the same delta cycle.
//!
//! Cancellation is cooperative. [`EventLoop::reset`] resumes every
//! suspended process with [`KernelError::Cancelled`], and any wait armed
//! before the reset keeps resolving to `Cancelled`, so a process that
//! swallows the error still cannot get past its next wait.
//!
//! Processes should reach the loop through a [`LoopHandle`](crate::LoopHandle).
//! Dropping the [`EventLoop`] drops every process it still hosts; their
//! handles then report [`ProcessState::Cancelled`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::future::LocalBoxFuture;
use futures::task::{waker, ArcWake};
use parking_lot::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::event::Event;
use crate::event_loop::EventLoop;

pub(crate) type TaskId = u64;

/// Processes woken since the loop last polled.
pub(crate) type ReadyQueue = Arc<Mutex<VecDeque<TaskId>>>;

// ── Process state ─────────────────────────────────────────────────────

/// Lifecycle of a spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ProcessState {
    /// Spawned, not yet polled.
    Pending,
    /// Waiting on an event.
    Suspended,
    /// Returned `Ok(())`.
    Finished,
    /// Aborted by an event-loop reset.
    Cancelled,
    /// Returned an error other than cancellation.
    Failed(String),
}

impl ProcessState {
    /// Returns `true` once the process can no longer run.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            ProcessState::Finished | ProcessState::Cancelled | ProcessState::Failed(_)
        )
    }
}

// ── Task ──────────────────────────────────────────────────────────────

struct TaskWaker {
    id: TaskId,
    ready: ReadyQueue,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.ready.lock().push_back(arc_self.id);
    }
}

pub(crate) struct Task {
    id: TaskId,
    name: String,
    future: RefCell<Option<LocalBoxFuture<'static, KernelResult<()>>>>,
    state: RefCell<ProcessState>,
    waker: Waker,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: String,
        future: LocalBoxFuture<'static, KernelResult<()>>,
        ready: &ReadyQueue,
    ) -> Self {
        Task {
            id,
            name,
            future: RefCell::new(Some(future)),
            state: RefCell::new(ProcessState::Pending),
            waker: waker(Arc::new(TaskWaker {
                id,
                ready: Arc::clone(ready),
            })),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Poll the process once. Returns `true` when it has terminated.
    pub(crate) fn poll(&self, cancelling: bool) -> bool {
        // Taken out of the cell so a nested poll of the same task is a no-op.
        let Some(mut future) = self.future.borrow_mut().take() else {
            return false;
        };
        let mut cx = Context::from_waker(&self.waker);
        let outcome = match future.as_mut().poll(&mut cx) {
            Poll::Pending => {
                *self.future.borrow_mut() = Some(future);
                *self.state.borrow_mut() = ProcessState::Suspended;
                return false;
            }
            Poll::Ready(outcome) => outcome,
        };

        let state = match outcome {
            Ok(()) => {
                if cancelling {
                    tracing::warn!(
                        process = %self.name,
                        "process completed normally while the loop was cancelling"
                    );
                }
                ProcessState::Finished
            }
            Err(KernelError::Cancelled) => {
                tracing::debug!(process = %self.name, "process cancelled");
                ProcessState::Cancelled
            }
            Err(e) => {
                tracing::error!(process = %self.name, error = %e, "process failed");
                ProcessState::Failed(e.to_string())
            }
        };
        *self.state.borrow_mut() = state;
        true
    }

    /// Drop a process that never ran.
    pub(crate) fn abandon(&self) {
        self.future.borrow_mut().take();
        *self.state.borrow_mut() = ProcessState::Cancelled;
    }
}

// ── ProcessHandle ─────────────────────────────────────────────────────

/// Observer handle for a spawned process.
#[derive(Clone)]
pub struct ProcessHandle {
    task: Rc<Task>,
}

impl ProcessHandle {
    pub(crate) fn new(task: Rc<Task>) -> Self {
        ProcessHandle { task }
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.task.state()
    }

    /// Returns `true` once the process can no longer run.
    pub fn is_done(&self) -> bool {
        self.task.state().is_done()
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.task.name)
            .field("state", &*self.task.state.borrow())
            .finish()
    }
}

// ── EventWait ─────────────────────────────────────────────────────────

struct Armed {
    fired: Rc<Cell<bool>>,
    generation: u64,
}

/// Future returned by [`Event::wait`].
///
/// Resolves to `Ok(())` on the next firing of the event, or to
/// [`KernelError::Cancelled`] if that firing is a reset flush or happens
/// in a later generation than the one the wait was armed in. Never
/// resumes on its own: a process that wants to wait again must call
/// `wait` again.
#[must_use = "futures do nothing unless awaited"]
pub struct EventWait {
    event: Event,
    armed: Option<Armed>,
}

impl Future for EventWait {
    type Output = KernelResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let el = EventLoop::upgrade(this.event.owner())?;
        match &this.armed {
            None => {
                let fired = Rc::new(Cell::new(false));
                let flag = Rc::clone(&fired);
                let waker = cx.waker().clone();
                this.event.subscribe_dynamic_once(move || {
                    flag.set(true);
                    waker.wake_by_ref();
                });
                this.armed = Some(Armed {
                    fired,
                    generation: el.generation(),
                });
                Poll::Pending
            }
            Some(armed) if !armed.fired.get() => Poll::Pending,
            Some(armed) => {
                if el.is_cancelling() || armed.generation != el.generation() {
                    Poll::Ready(Err(KernelError::Cancelled))
                } else {
                    Poll::Ready(Ok(()))
                }
            }
        }
    }
}

impl Event {
    /// Suspend the calling process until this event next fires.
    pub fn wait(&self) -> EventWait {
        EventWait {
            event: self.clone(),
            armed: None,
        }
    }
}

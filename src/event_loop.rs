//! The event-loop kernel.
//!
//! Owns the simulation clock, the pending queue of timed notifications,
//! the immediate set of the current delta cycle, and the pending-update
//! set of two-phase objects. [`EventLoop::run`] repeats
//!
//! 1. **update phase**: commit every staged [`Update`];
//! 2. **timed-notification phase**: gather the immediate set, or advance
//!    to the earliest queued fire time and gather everything due then;
//! 3. **evaluation phase**: run the gathered subscribers, then keep running
//!    whatever they notified immediately (delta cycles) until no immediate
//!    work is left;
//!
//! until nothing is pending, then fires [`EventLoop::completed`] once.
//! The loop is strictly single-threaded: all apparent concurrency comes
//! from interleaving subscribers and suspended processes.
//!
//! [`EventLoop`] is the sole owner of the kernel and is not `Clone`.
//! Callbacks and processes reach the loop through a [`LoopHandle`], which
//! holds it weakly, so the loop is freed (and its processes dropped) as
//! soon as the owner goes away.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::event::{invoke, Action, Event, EventCore, EventId, EventIdGen};
use crate::process::{ProcessHandle, ProcessState, ReadyQueue, Task, TaskId};
use crate::scheduler::Scheduler;
use crate::time::SimTime;

// ── Update trait ──────────────────────────────────────────────────────

/// An object with deferred (two-phase) state.
///
/// Register it with [`EventLoop::request_update`] during evaluation; the
/// loop calls [`Update::apply_update`] exactly once at the next update
/// phase, no matter how many times it was requested.
pub trait Update {
    /// Commit the staged state.
    fn apply_update(&self);
}

// ── Run statistics ────────────────────────────────────────────────────

/// What a single call to [`EventLoop::run_until`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct RunStats {
    /// Timed-notification phases executed.
    pub notification_phases: u64,
    /// Delta cycles executed (at least one per notification phase).
    pub delta_cycles: u64,
    /// Subscriber callbacks invoked.
    pub actions: u64,
    /// Simulation time when the run returned.
    pub end_time: f64,
}

/// Coarse state of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// Not inside `run` or `reset`.
    Idle,
    /// Inside `run`.
    Running,
    /// Inside `reset`, flushing suspended processes.
    Resetting,
}

// ── Loop state ────────────────────────────────────────────────────────

struct LoopState {
    phase: LoopPhase,
    queue: Scheduler,
    immediate: Vec<Event>,
    immediate_ids: BTreeSet<EventId>,
    updates: Vec<Rc<dyn Update>>,
    update_keys: BTreeSet<usize>,
    events: Vec<Weak<EventCore>>,
    prune_at: usize,
    ids: EventIdGen,
    tasks: BTreeMap<TaskId, Rc<Task>>,
    next_task: TaskId,
    started_fired: bool,
    completed_fired: bool,
    completed_id: EventId,
    cancelling: bool,
    generation: u64,
    fault: Option<KernelError>,
}

const PRUNE_FLOOR: usize = 64;

impl LoopState {
    /// `completed` is refused once it has fired in the current run, so its
    /// own handlers cannot re-trigger it.
    fn admits(&self, event: &Event) -> bool {
        !(self.completed_fired && event.id() == self.completed_id)
    }

    fn mark_immediate(&mut self, event: &Event) {
        if !self.admits(event) {
            tracing::debug!(event = %event.name(), "completed already fired in this run");
            return;
        }
        if self.immediate_ids.insert(event.id()) {
            self.immediate.push(event.clone());
        }
    }

    fn take_immediate(&mut self) -> Vec<Event> {
        self.immediate_ids.clear();
        std::mem::take(&mut self.immediate)
    }
}

pub(crate) struct LoopCore {
    state: RefCell<LoopState>,
    clock: Rc<Cell<SimTime>>,
    ready: ReadyQueue,
    started: Event,
    completed: Event,
}

impl Drop for LoopCore {
    fn drop(&mut self) {
        let tasks = std::mem::take(&mut self.state.get_mut().tasks);
        for task in tasks.values() {
            tracing::debug!(process = %task.name(), "dropping process with its event loop");
            task.abandon();
        }
    }
}

// ── EventLoop ─────────────────────────────────────────────────────────

/// Owner of the simulation kernel.
///
/// Create one loop per simulation; [`EventLoop::reset`] reinitializes it
/// in place while leaving the static wiring intact. Hand
/// [`EventLoop::handle`] to callbacks and processes instead of the loop
/// itself. Dropping the loop drops every process still suspended on it.
pub struct EventLoop {
    core: Rc<LoopCore>,
}

impl EventLoop {
    /// Create an idle loop at time zero.
    pub fn new() -> Self {
        let core = Rc::new_cyclic(|weak: &Weak<LoopCore>| {
            let mut ids = EventIdGen::new();
            let started = Event::detached("started", ids.next_id(), weak.clone());
            let completed = Event::detached("completed", ids.next_id(), weak.clone());
            LoopCore {
                state: RefCell::new(LoopState {
                    phase: LoopPhase::Idle,
                    queue: Scheduler::new(),
                    immediate: Vec::new(),
                    immediate_ids: BTreeSet::new(),
                    updates: Vec::new(),
                    update_keys: BTreeSet::new(),
                    events: vec![started.downgrade(), completed.downgrade()],
                    prune_at: PRUNE_FLOOR,
                    ids,
                    tasks: BTreeMap::new(),
                    next_task: 0,
                    started_fired: false,
                    completed_fired: false,
                    completed_id: completed.id(),
                    cancelling: false,
                    generation: 0,
                    fault: None,
                }),
                clock: Rc::new(Cell::new(SimTime::ZERO)),
                ready: Arc::new(Mutex::new(VecDeque::new())),
                started,
                completed,
            }
        });
        EventLoop { core }
    }

    pub(crate) fn from_core(core: Rc<LoopCore>) -> Self {
        EventLoop { core }
    }

    pub(crate) fn upgrade(weak: &Weak<LoopCore>) -> KernelResult<Self> {
        weak.upgrade()
            .map(EventLoop::from_core)
            .ok_or(KernelError::LoopDropped)
    }

    pub(crate) fn downgrade(&self) -> Weak<LoopCore> {
        Rc::downgrade(&self.core)
    }

    /// A weak, clonable handle for callbacks and processes.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            core: self.downgrade(),
            clock: Rc::clone(&self.core.clock),
        }
    }

    // ── Introspection ─────────────────────────────────────────

    /// Current simulation time.
    pub fn now(&self) -> f64 {
        self.core.clock.get().value()
    }

    /// Current simulation time as a [`SimTime`].
    pub fn now_time(&self) -> SimTime {
        self.core.clock.get()
    }

    /// Number of queued timed notifications.
    pub fn pending_count(&self) -> usize {
        self.core.state.borrow().queue.len()
    }

    /// Returns `true` if nothing is queued, immediate, or awaiting update.
    pub fn is_idle(&self) -> bool {
        let st = self.core.state.borrow();
        st.queue.is_empty() && st.immediate.is_empty() && st.updates.is_empty()
    }

    /// Coarse state of the loop.
    pub fn phase(&self) -> LoopPhase {
        self.core.state.borrow().phase
    }

    /// Returns `true` while [`EventLoop::reset`] is flushing suspended
    /// processes. Callbacks resumed in that window must abort.
    pub fn is_cancelling(&self) -> bool {
        self.core.state.borrow().cancelling
    }

    /// Number of completed resets. Waits registered in an earlier
    /// generation resolve to [`KernelError::Cancelled`].
    pub fn generation(&self) -> u64 {
        self.core.state.borrow().generation
    }

    /// Number of live (not yet finished) processes.
    pub fn process_count(&self) -> usize {
        self.core.state.borrow().tasks.len()
    }

    /// Fires once, at the beginning of the first `run` after creation
    /// or reset.
    pub fn started(&self) -> &Event {
        &self.core.started
    }

    /// Fires once per `run`, when no work is left (or the time limit is
    /// reached). Its handlers may schedule more work; the loop keeps
    /// running it, but notifications of `completed` itself are ignored
    /// for the rest of the run.
    pub fn completed(&self) -> &Event {
        &self.core.completed
    }

    // ── Events ────────────────────────────────────────────────

    pub(crate) fn mint_event_id(&self) -> EventId {
        self.core.state.borrow_mut().ids.next_id()
    }

    pub(crate) fn register_event(&self, event: &Event) {
        let mut st = self.core.state.borrow_mut();
        st.events.push(event.downgrade());
        if st.events.len() >= st.prune_at {
            st.events.retain(|w| w.strong_count() > 0);
            st.prune_at = (st.events.len() * 2).max(PRUNE_FLOOR);
        }
    }

    /// A fresh one-shot event that fires `delay` from now.
    pub fn delay(&self, delay: f64) -> KernelResult<Event> {
        let event = Event::new(format!("delay({})", delay), self);
        self.notify_after(&event, delay)?;
        Ok(event)
    }

    // ── Notification ──────────────────────────────────────────

    /// Mark `event` to fire in the current instant.
    ///
    /// Set semantics: repeated calls before the next delta cycle collapse
    /// into one firing.
    pub fn notify(&self, event: &Event) {
        self.core.state.borrow_mut().mark_immediate(event);
    }

    /// Queue `event` to fire at `now + delay`.
    pub fn notify_after(&self, event: &Event, delay: f64) -> KernelResult<()> {
        let at = self.now_time().plus(delay)?;
        let mut st = self.core.state.borrow_mut();
        if st.admits(event) {
            st.queue.schedule(at, event.clone());
        } else {
            tracing::debug!(event = %event.name(), "completed already fired in this run");
        }
        Ok(())
    }

    /// Register `obj` for the next update phase. Idempotent per object.
    pub fn request_update(&self, obj: Rc<dyn Update>) {
        let key = Rc::as_ptr(&obj).cast::<()>() as usize;
        let mut st = self.core.state.borrow_mut();
        if st.update_keys.insert(key) {
            st.updates.push(obj);
        }
    }

    pub(crate) fn report_fault(&self, err: KernelError) {
        let mut st = self.core.state.borrow_mut();
        if st.fault.is_none() {
            st.fault = Some(err);
        }
    }

    // ── Processes ─────────────────────────────────────────────

    /// Host `future` as a simulated process.
    ///
    /// The process first runs at the start of the next `run`, or in the
    /// current delta cycle when spawned from a callback. It suspends at
    /// every [`Event::wait`] and is resumed when that event fires.
    /// Capture [`EventLoop::handle`] rather than the loop in `future`.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> ProcessHandle
    where
        F: Future<Output = KernelResult<()>> + 'static,
    {
        let task = {
            let mut st = self.core.state.borrow_mut();
            let id = st.next_task;
            st.next_task += 1;
            let task = Rc::new(Task::new(id, name.into(), Box::pin(future), &self.core.ready));
            st.tasks.insert(id, Rc::clone(&task));
            task
        };
        self.core.ready.lock().push_back(task.id());
        ProcessHandle::new(task)
    }

    /// Poll every woken process until none is left.
    fn poll_ready(&self) {
        loop {
            let next = self.core.ready.lock().pop_front();
            let Some(id) = next else { break };
            let task = self.core.state.borrow().tasks.get(&id).cloned();
            let Some(task) = task else { continue };
            if task.poll(self.is_cancelling()) {
                self.core.state.borrow_mut().tasks.remove(&id);
            }
        }
    }

    // ── Running ───────────────────────────────────────────────

    /// Run until no work is left.
    pub fn run(&self) -> KernelResult<RunStats> {
        self.run_until(f64::INFINITY)
    }

    /// Run every instant up to and including `max_duration`; later
    /// notifications stay queued for a subsequent run.
    ///
    /// Returns the first fault raised by a callback (for instance a bound
    /// trace recording out of order). The loop should be
    /// [`reset`](EventLoop::reset) before it is run again after a fault.
    pub fn run_until(&self, max_duration: f64) -> KernelResult<RunStats> {
        {
            let mut st = self.core.state.borrow_mut();
            st.phase = LoopPhase::Running;
            st.completed_fired = false;
            if !st.started_fired {
                st.started_fired = true;
                let started = self.core.started.clone();
                st.mark_immediate(&started);
            }
        }
        tracing::debug!(now = %self.now_time(), max_duration, "event loop running");

        let mut stats = RunStats::default();
        let result = self.drive(max_duration, &mut stats);
        {
            let mut st = self.core.state.borrow_mut();
            st.phase = LoopPhase::Idle;
            st.completed_fired = false;
        }
        stats.end_time = self.now();

        match &result {
            Ok(()) => tracing::debug!(
                end_time = stats.end_time,
                phases = stats.notification_phases,
                delta_cycles = stats.delta_cycles,
                actions = stats.actions,
                "event loop drained"
            ),
            Err(e) => tracing::warn!(error = %e, time = stats.end_time, "event loop aborted"),
        }
        result.map(|()| stats)
    }

    fn drive(&self, max_duration: f64, stats: &mut RunStats) -> KernelResult<()> {
        self.poll_ready();
        self.check_fault()?;

        loop {
            self.update_phase();
            let batch = match self.next_batch(max_duration) {
                Some(batch) => batch,
                None if self.core.state.borrow().completed_fired => return Ok(()),
                None => {
                    self.notify(&self.core.completed);
                    self.core.state.borrow_mut().completed_fired = true;
                    continue;
                }
            };
            stats.notification_phases += 1;
            self.evaluate(batch, stats)?;
        }
    }

    /// Commit every staged update, then clear the set.
    fn update_phase(&self) {
        let updates = {
            let mut st = self.core.state.borrow_mut();
            st.update_keys.clear();
            std::mem::take(&mut st.updates)
        };
        for obj in updates {
            obj.apply_update();
        }
    }

    /// Gather the events of the next timed-notification phase.
    ///
    /// Pending immediate work keeps the clock where it is; otherwise the
    /// clock advances to the earliest queued fire time. Either way, every
    /// queued notification due at the resulting time joins the batch, and
    /// each event appears at most once.
    fn next_batch(&self, max_duration: f64) -> Option<Vec<Event>> {
        let mut st = self.core.state.borrow_mut();
        let mut batch = st.take_immediate();
        if batch.is_empty() {
            let next = st.queue.peek_time()?;
            if next.exceeds(max_duration) {
                return None;
            }
            let now = self.core.clock.get();
            debug_assert!(!next.is_before(now), "time went backward");
            if next != now {
                tracing::trace!(from = %now, to = %next, "advancing simulation time");
            }
            self.core.clock.set(next);
        }

        let now = self.core.clock.get();
        let mut seen: BTreeSet<EventId> = batch.iter().map(Event::id).collect();
        for event in st.queue.drain_due(now) {
            if st.admits(&event) && seen.insert(event.id()) {
                batch.push(event);
            }
        }
        Some(batch)
    }

    /// Run a batch and every delta cycle it produces.
    fn evaluate(&self, batch: Vec<Event>, stats: &mut RunStats) -> KernelResult<()> {
        let mut events = batch;
        loop {
            stats.delta_cycles += 1;
            let actions: Vec<Action> = events.iter().flat_map(Event::take_actions).collect();
            tracing::trace!(
                time = %self.now_time(),
                events = events.len(),
                actions = actions.len(),
                "delta cycle"
            );

            for action in &actions {
                invoke(action);
                stats.actions += 1;
                self.poll_ready();
                self.check_fault()?;
            }

            events = self.core.state.borrow_mut().take_immediate();
            if events.is_empty() {
                return Ok(());
            }
        }
    }

    fn check_fault(&self) -> KernelResult<()> {
        match self.core.state.borrow_mut().fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ── Reset ─────────────────────────────────────────────────

    /// Cancel every suspended process and return to time zero.
    ///
    /// Sets the cancellation indicator, invokes every registered event's
    /// one-shot subscribers so suspended processes resume, observe
    /// [`KernelError::Cancelled`] and terminate, then clears the indicator
    /// and empties the queue, the immediate set and the pending-update
    /// set. Static subscriptions are left untouched so the same topology
    /// can be run again.
    pub fn reset(&self) {
        tracing::debug!(now = %self.now_time(), "resetting event loop");
        let (events, unstarted) = {
            let mut st = self.core.state.borrow_mut();
            st.phase = LoopPhase::Resetting;
            st.cancelling = true;
            st.events.retain(|w| w.strong_count() > 0);
            let events: Vec<Event> = st
                .events
                .iter()
                .filter_map(Weak::upgrade)
                .map(Event::from_core)
                .collect();
            let unstarted: Vec<TaskId> = st
                .tasks
                .iter()
                .filter(|(_, t)| t.state() == ProcessState::Pending)
                .map(|(id, _)| *id)
                .collect();
            let unstarted: Vec<Rc<Task>> = unstarted
                .into_iter()
                .filter_map(|id| st.tasks.remove(&id))
                .collect();
            (events, unstarted)
        };

        for task in unstarted {
            task.abandon();
        }

        for event in &events {
            for action in event.take_dynamic() {
                invoke(&action);
                self.poll_ready();
            }
        }

        let lingering: Vec<Rc<Task>> = self.core.state.borrow().tasks.values().cloned().collect();
        for task in lingering {
            tracing::warn!(
                process = %task.name(),
                "process ignored cancellation and is still suspended"
            );
        }

        self.core.ready.lock().clear();
        let mut st = self.core.state.borrow_mut();
        st.cancelling = false;
        st.generation += 1;
        self.core.clock.set(SimTime::ZERO);
        st.queue.clear();
        st.take_immediate();
        st.updates.clear();
        st.update_keys.clear();
        st.started_fired = false;
        st.completed_fired = false;
        st.fault = None;
        st.phase = LoopPhase::Idle;
    }
}

// ── LoopHandle ─────────────────────────────────────────────────────

/// Weak, clonable handle to an [`EventLoop`].
///
/// This is what callbacks and processes should capture: it does not keep
/// the loop alive, so capturing it in a subscriber or a spawned future
/// never forms a reference cycle with the loop's own tables. Operations
/// that need the loop return [`KernelError::LoopDropped`] once it is gone.
#[derive(Clone)]
pub struct LoopHandle {
    core: Weak<LoopCore>,
    clock: Rc<Cell<SimTime>>,
}

impl LoopHandle {
    pub(crate) fn upgrade(&self) -> KernelResult<EventLoop> {
        EventLoop::upgrade(&self.core)
    }

    /// Current simulation time. Still readable after the loop is dropped,
    /// where it reports the time the loop stopped at.
    pub fn now(&self) -> f64 {
        self.clock.get().value()
    }

    pub fn now_time(&self) -> SimTime {
        self.clock.get()
    }

    /// Returns `true` while the loop exists.
    pub fn is_alive(&self) -> bool {
        self.core.strong_count() > 0
    }

    /// See [`EventLoop::is_cancelling`]. A dropped loop counts as cancelling.
    pub fn is_cancelling(&self) -> bool {
        self.upgrade().map_or(true, |el| el.is_cancelling())
    }

    /// See [`EventLoop::generation`].
    pub fn generation(&self) -> KernelResult<u64> {
        self.upgrade().map(|el| el.generation())
    }

    /// See [`EventLoop::delay`].
    pub fn delay(&self, delay: f64) -> KernelResult<Event> {
        self.upgrade()?.delay(delay)
    }

    /// See [`EventLoop::notify`].
    pub fn notify(&self, event: &Event) -> KernelResult<()> {
        self.upgrade()?.notify(event);
        Ok(())
    }

    /// See [`EventLoop::notify_after`].
    pub fn notify_after(&self, event: &Event, delay: f64) -> KernelResult<()> {
        self.upgrade()?.notify_after(event, delay)
    }

    /// See [`EventLoop::spawn`].
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> KernelResult<ProcessHandle>
    where
        F: Future<Output = KernelResult<()>> + 'static,
    {
        Ok(self.upgrade()?.spawn(name, future))
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("now", &self.clock.get())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.core.state.borrow();
        f.debug_struct("EventLoop")
            .field("now", &self.core.clock.get())
            .field("phase", &st.phase)
            .field("pending", &st.queue.len())
            .field("immediate", &st.immediate.len())
            .field("updates", &st.updates.len())
            .field("processes", &st.tasks.len())
            .field("generation", &st.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counter() -> Rc<Cell<u32>> {
        Rc::new(Cell::new(0))
    }

    #[test]
    fn test_empty_loop_runs_and_completes() {
        let el = EventLoop::new();
        let done = counter();
        let d = done.clone();
        el.completed().subscribe_static(move || d.set(d.get() + 1));

        el.run().unwrap();
        assert_eq!(done.get(), 1);
        assert_eq!(el.now(), 0.0);
        assert!(el.is_idle());
    }

    #[test]
    fn test_time_monotonicity() {
        let el = EventLoop::new();
        let times = Rc::new(RefCell::new(Vec::new()));
        for (i, t) in [100.0, 50.0, 75.0, 10.0].into_iter().enumerate() {
            let ev = Event::new(format!("ev{}", i), &el);
            let (log, handle) = (times.clone(), el.handle());
            ev.subscribe_static(move || log.borrow_mut().push(handle.now()));
            ev.notify_after(t).unwrap();
        }

        el.run().unwrap();
        assert_eq!(*times.borrow(), vec![10.0, 50.0, 75.0, 100.0]);
        assert_eq!(el.now(), 100.0);
    }

    #[test]
    fn test_same_time_drained_in_one_phase() {
        let el = EventLoop::new();
        let a = Event::new("a", &el);
        let b = Event::new("b", &el);
        a.subscribe_static(|| {});
        b.subscribe_static(|| {});
        a.notify_after(2.0).unwrap();
        b.notify_after(2.0).unwrap();

        let stats = el.run().unwrap();
        // started, the t=2 batch, completed.
        assert_eq!(stats.notification_phases, 3);
        assert_eq!(stats.actions, 2);
    }

    #[test]
    fn test_immediate_notify_is_deduplicated() {
        let el = EventLoop::new();
        let trigger = Event::new("trigger", &el);
        let target = Event::new("target", &el);
        let fired = counter();

        let t = target.clone();
        trigger.subscribe_static(move || {
            t.notify();
            t.notify();
            t.notify();
        });
        let f = fired.clone();
        target.subscribe_static(move || f.set(f.get() + 1));

        trigger.notify_after(1.0).unwrap();
        el.run().unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_delta_cycles_stay_in_instant() {
        let el = EventLoop::new();
        let a = Event::new("a", &el);
        let b = Event::new("b", &el);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let (bb, h, s) = (b.clone(), el.handle(), seen.clone());
        a.subscribe_static(move || {
            s.borrow_mut().push(("a", h.now()));
            bb.notify();
        });
        let (h, s) = (el.handle(), seen.clone());
        b.subscribe_static(move || s.borrow_mut().push(("b", h.now())));

        a.notify_after(3.0).unwrap();
        let stats = el.run().unwrap();
        assert_eq!(*seen.borrow(), vec![("a", 3.0), ("b", 3.0)]);
        assert!(stats.delta_cycles >= 2);
    }

    #[test]
    fn test_negative_delay_rejected() {
        let el = EventLoop::new();
        let ev = Event::new("ev", &el);
        assert_eq!(
            ev.notify_after(-1.0),
            Err(KernelError::NegativeDelay { delay: -1.0 })
        );
        assert_eq!(el.pending_count(), 0);
    }

    #[test]
    fn test_started_fires_once_per_generation() {
        let el = EventLoop::new();
        let starts = counter();
        let s = starts.clone();
        el.started().subscribe_static(move || s.set(s.get() + 1));

        el.run().unwrap();
        el.run().unwrap();
        assert_eq!(starts.get(), 1);

        el.reset();
        el.run().unwrap();
        assert_eq!(starts.get(), 2);
    }

    #[test]
    fn test_completed_handlers_cannot_retrigger_completed() {
        let el = EventLoop::new();
        let done = counter();
        let later = Event::new("later", &el);
        later.subscribe_static(|| {});

        let (d, l) = (done.clone(), later.clone());
        el.completed().subscribe_static(move || {
            d.set(d.get() + 1);
            l.notify_after(1.0).unwrap();
        });

        el.run().unwrap();
        assert_eq!(done.get(), 1);
        // The tail work scheduled by `completed` still ran.
        assert_eq!(el.now(), 1.0);
    }

    #[test]
    fn test_run_until_leaves_later_work_queued() {
        let el = EventLoop::new();
        let ev = Event::new("ev", &el);
        let fired = counter();
        let f = fired.clone();
        ev.subscribe_static(move || f.set(f.get() + 1));
        ev.notify_after(1.0).unwrap();
        ev.notify_after(5.0).unwrap();

        el.run_until(2.0).unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(el.now(), 1.0);
        assert_eq!(el.pending_count(), 1);

        el.run().unwrap();
        assert_eq!(fired.get(), 2);
        assert_eq!(el.now(), 5.0);
    }

    #[test]
    fn test_run_until_includes_boundary() {
        let el = EventLoop::new();
        let ev = Event::new("ev", &el);
        ev.subscribe_static(|| {});
        ev.notify_after(2.0).unwrap();

        el.run_until(2.0).unwrap();
        assert_eq!(el.now(), 2.0);
        assert_eq!(el.pending_count(), 0);
    }

    #[test]
    fn test_reset_clears_queue_and_time() {
        let el = EventLoop::new();
        let ev = Event::new("ev", &el);
        let fired = counter();
        let f = fired.clone();
        ev.subscribe_static(move || f.set(f.get() + 1));
        ev.notify_after(1.0).unwrap();
        ev.notify_after(9.0).unwrap();
        el.run_until(1.0).unwrap();

        el.reset();
        assert_eq!(el.now(), 0.0);
        assert_eq!(el.pending_count(), 0);
        assert_eq!(el.generation(), 1);
        assert!(!el.is_cancelling());

        el.run().unwrap();
        assert_eq!(fired.get(), 1);
        // Static wiring survives.
        assert_eq!(ev.static_count(), 1);
    }

    #[test]
    fn test_reset_flushes_dynamic_subscribers() {
        let el = EventLoop::new();
        let ev = Event::new("ev", &el);
        let observed = Rc::new(Cell::new(false));

        let (o, h) = (observed.clone(), el.handle());
        ev.subscribe_dynamic_once(move || o.set(h.is_cancelling()));

        el.reset();
        assert!(observed.get());
        assert_eq!(ev.dynamic_count(), 0);
    }

    #[test]
    fn test_delay_helper() {
        let el = EventLoop::new();
        let d = el.delay(2.5).unwrap();
        assert!(d.name().starts_with("delay("));
        assert_eq!(el.pending_count(), 1);
        assert!(el.delay(-1.0).is_err());
    }

    #[test]
    fn test_fault_aborts_run() {
        let el = EventLoop::new();
        let ev = Event::new("ev", &el);
        let h = el.handle();
        ev.subscribe_static(move || h.upgrade().unwrap().report_fault(KernelError::Cancelled));
        ev.notify_after(1.0).unwrap();

        assert_eq!(el.run(), Err(KernelError::Cancelled));
        el.reset();
        assert!(el.run().is_ok());
    }

    #[test]
    fn test_completed_cannot_renotify_itself() {
        let el = EventLoop::new();
        let done = counter();
        let (d, completed) = (done.clone(), el.completed().clone());
        el.completed().subscribe_static(move || {
            d.set(d.get() + 1);
            if d.get() < 50 {
                completed.notify();
                completed.notify_after(1.0).unwrap();
            }
        });

        el.run().unwrap();
        assert_eq!(done.get(), 1);
        assert_eq!(el.now(), 0.0);

        // The guard is per run.
        el.run().unwrap();
        assert_eq!(done.get(), 2);
    }

    fn resubscribe(ev: &Event, log: Rc<RefCell<Vec<f64>>>, h: LoopHandle, left: u32) {
        let e = ev.clone();
        ev.subscribe_dynamic_once(move || {
            log.borrow_mut().push(h.now());
            if left > 1 {
                resubscribe(&e, log.clone(), h.clone(), left - 1);
                e.notify();
            }
        });
    }

    #[test]
    fn test_dynamic_resubscribe_lands_in_next_delta() {
        let el = EventLoop::new();
        let ev = Event::new("ev", &el);
        let log = Rc::new(RefCell::new(Vec::new()));
        resubscribe(&ev, log.clone(), el.handle(), 2);
        ev.notify_after(2.0).unwrap();

        let stats = el.run().unwrap();
        assert_eq!(*log.borrow(), vec![2.0, 2.0]);
        assert_eq!(ev.dynamic_count(), 0);
        // started, the two firings at t=2, completed.
        assert_eq!(stats.delta_cycles, 4);
        assert_eq!(stats.actions, 2);
    }

    #[test]
    fn test_loop_freed_with_suspended_process() {
        let ev_outer;
        let proc;
        let weak = {
            let el = EventLoop::new();
            let ev = Event::new("never", &el);
            let tick = Event::new("tick", &el);

            let (h, e) = (el.handle(), ev.clone());
            proc = el.spawn("stuck", async move {
                e.wait().await?;
                h.delay(1.0)?.wait().await
            });
            let h = el.handle();
            tick.subscribe_static(move || {
                let _ = h.now();
            });
            let h = el.handle();
            el.completed().subscribe_static(move || {
                let _ = h.now();
            });
            tick.notify_after(5.0).unwrap();

            el.run_until(1.0).unwrap();
            assert_eq!(proc.state(), ProcessState::Suspended);
            ev_outer = ev;
            el.downgrade()
        };

        assert!(weak.upgrade().is_none());
        assert_eq!(proc.state(), ProcessState::Cancelled);
        assert!(ev_outer.event_loop().is_none());
    }

    #[test]
    fn test_handle_after_loop_dropped() {
        let h = {
            let el = EventLoop::new();
            let ev = Event::new("ev", &el);
            ev.subscribe_static(|| {});
            ev.notify_after(3.0).unwrap();
            el.run().unwrap();
            el.handle()
        };
        assert!(!h.is_alive());
        assert_eq!(h.now(), 3.0);
        assert!(h.is_cancelling());
        assert_eq!(h.delay(1.0).unwrap_err(), KernelError::LoopDropped);
        assert!(h.spawn("late", async { Ok(()) }).is_err());
    }
}

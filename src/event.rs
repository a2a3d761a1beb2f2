//! Events and sensitivity lists.
//!
//! An [`Event`] is a named trigger. Notifying it (immediately or after a
//! delay) asks the owning [`EventLoop`] to fire it; firing runs every
//! subscriber in the event's two sensitivity lists:
//!
//! - **static** subscribers persist across firings (structural wiring),
//! - **dynamic** subscribers are one-shot: the list is swapped out and
//!   cleared *before* any of its callbacks runs, so a callback that
//!   re-subscribes lands on the next firing, never the current one.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::KernelResult;
use crate::event_loop::{EventLoop, LoopCore, LoopHandle};

// ── Event ID ──────────────────────────────────────────────────────────

/// Identity of an event within its loop, in creation order.
///
/// Deduplicates notifications within one delta cycle; names are cosmetic
/// and may repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EventId(u64);

impl EventId {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E#{}", self.0)
    }
}

/// Per-loop id counter. Building the same topology on a fresh loop
/// yields the same ids.
#[derive(Debug)]
pub(crate) struct EventIdGen {
    next: u64,
}

impl EventIdGen {
    pub(crate) fn new() -> Self {
        EventIdGen { next: 0 }
    }

    pub(crate) fn next_id(&mut self) -> EventId {
        let id = EventId(self.next);
        self.next += 1;
        id
    }
}

// ── Subscriptions ─────────────────────────────────────────────────────

/// Handle returned by [`Event::subscribe_static`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// A subscriber callback.
///
/// Reference-counted so the loop can snapshot a batch of callbacks while
/// handlers keep mutating the sensitivity lists underneath it.
pub(crate) type Action = Rc<RefCell<dyn FnMut()>>;

pub(crate) fn action<F>(f: F) -> Action
where
    F: FnMut() + 'static,
{
    Rc::new(RefCell::new(f))
}

// ── Event ─────────────────────────────────────────────────────────────

pub(crate) struct EventCore {
    id: EventId,
    name: String,
    owner: Weak<LoopCore>,
    static_subs: RefCell<Vec<(SubscriptionId, Action)>>,
    dynamic_subs: RefCell<Vec<Action>>,
    next_sub: Cell<u64>,
}

/// A named trigger bound to one [`EventLoop`].
///
/// `Event` is a cheap, clonable handle: clones refer to the same trigger
/// and compare equal. The event keeps only a weak reference to its loop,
/// so it is not destroyed by [`EventLoop::reset`] and does not keep the
/// loop alive on its own.
#[derive(Clone)]
pub struct Event {
    core: Rc<EventCore>,
}

impl Event {
    /// Create a new event on `event_loop`.
    ///
    /// The name is diagnostic only.
    pub fn new(name: impl Into<String>, event_loop: &EventLoop) -> Self {
        let event = Event::detached(name, event_loop.mint_event_id(), event_loop.downgrade());
        event_loop.register_event(&event);
        event
    }

    /// Build an event without registering it. The loop uses this for its
    /// own sentinel events while it is still being constructed.
    pub(crate) fn detached(name: impl Into<String>, id: EventId, owner: Weak<LoopCore>) -> Self {
        Event {
            core: Rc::new(EventCore {
                id,
                name: name.into(),
                owner,
                static_subs: RefCell::new(Vec::new()),
                dynamic_subs: RefCell::new(Vec::new()),
                next_sub: Cell::new(0),
            }),
        }
    }

    /// Build a derived event that fires whenever any of `events` fires.
    ///
    /// Installs a forwarding static subscriber on every source, each of
    /// which immediately notifies the derived event. Several sources
    /// firing in the same delta cycle therefore collapse into a single
    /// firing of the derived event in the next delta cycle.
    pub fn any(event_loop: &EventLoop, events: &[&Event]) -> Event {
        let label = events
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>()
            .join("|");
        let derived = Event::new(format!("any({})", label), event_loop);
        for source in events {
            let target = derived.clone();
            source.subscribe_static(move || target.notify());
        }
        derived
    }

    /// Loop-unique identifier.
    #[inline]
    pub fn id(&self) -> EventId {
        self.core.id
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// A handle to the owning loop, if it is still alive.
    pub fn loop_handle(&self) -> Option<LoopHandle> {
        self.event_loop().map(|el| el.handle())
    }

    pub(crate) fn event_loop(&self) -> Option<EventLoop> {
        self.core.owner.upgrade().map(EventLoop::from_core)
    }

    pub(crate) fn owner(&self) -> &Weak<LoopCore> {
        &self.core.owner
    }

    // ── Notification ──────────────────────────────────────────

    /// Fire this event in the current instant.
    ///
    /// Repeated calls before the event fires collapse into one firing.
    /// A no-op if the owning loop has been dropped.
    pub fn notify(&self) {
        match self.event_loop() {
            Some(el) => el.notify(self),
            None => tracing::debug!(event = %self.name(), "notify on an event whose loop was dropped"),
        }
    }

    /// Fire this event `delay` time units from now.
    ///
    /// Returns [`KernelError::NegativeDelay`](crate::KernelError::NegativeDelay)
    /// for a negative delay and
    /// [`KernelError::LoopDropped`](crate::KernelError::LoopDropped) if
    /// the owning loop no longer exists.
    pub fn notify_after(&self, delay: f64) -> KernelResult<()> {
        EventLoop::upgrade(&self.core.owner)?.notify_after(self, delay)
    }

    // ── Sensitivity ───────────────────────────────────────────

    /// Add a persistent subscriber, run on every firing.
    pub fn subscribe_static<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnMut() + 'static,
    {
        let id = SubscriptionId(self.core.next_sub.get());
        self.core.next_sub.set(id.0 + 1);
        self.core
            .static_subs
            .borrow_mut()
            .push((id, action(callback)));
        id
    }

    /// Remove a persistent subscriber. Returns `false` if `id` was not
    /// subscribed to this event.
    pub fn unsubscribe_static(&self, id: SubscriptionId) -> bool {
        let mut subs = self.core.static_subs.borrow_mut();
        let before = subs.len();
        subs.retain(|(sub, _)| *sub != id);
        subs.len() != before
    }

    /// Add a one-shot subscriber, consumed by the next firing.
    pub fn subscribe_dynamic_once<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.core.dynamic_subs.borrow_mut().push(action(callback));
    }

    /// Number of persistent subscribers.
    pub fn static_count(&self) -> usize {
        self.core.static_subs.borrow().len()
    }

    /// Number of one-shot subscribers waiting for the next firing.
    pub fn dynamic_count(&self) -> usize {
        self.core.dynamic_subs.borrow().len()
    }

    /// Snapshot the callbacks for one firing: the one-shot list is
    /// swapped out and cleared first, then the persistent list is cloned.
    pub(crate) fn take_actions(&self) -> Vec<Action> {
        let mut actions = self.take_dynamic();
        actions.extend(
            self.core
                .static_subs
                .borrow()
                .iter()
                .map(|(_, a)| Rc::clone(a)),
        );
        actions
    }

    /// Swap out and clear the one-shot list.
    pub(crate) fn take_dynamic(&self) -> Vec<Action> {
        std::mem::take(&mut *self.core.dynamic_subs.borrow_mut())
    }

    pub(crate) fn downgrade(&self) -> Weak<EventCore> {
        Rc::downgrade(&self.core)
    }

    pub(crate) fn from_core(core: Rc<EventCore>) -> Self {
        Event { core }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Event {}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("static", &self.static_count())
            .field("dynamic", &self.dynamic_count())
            .finish()
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.core.name, self.core.id)
    }
}

/// Invoke a batch of callbacks in order.
pub(crate) fn invoke(action: &Action) {
    (action.borrow_mut())();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_creation_order() {
        let el = EventLoop::new();
        let a = Event::new("a", &el);
        let b = Event::new("b", &el);
        // The loop's own sentinels take the first two ids.
        assert_eq!(el.started().id().raw(), 0);
        assert_eq!(el.completed().id().raw(), 1);
        assert_eq!(a.id().raw(), 2);
        assert!(a.id() < b.id());
        assert_eq!(format!("{}", b), "b(E#3)");

        // Same topology on a fresh loop, same ids.
        let other = EventLoop::new();
        assert_eq!(Event::new("a", &other).id(), a.id());
    }

    #[test]
    fn test_static_subscribers_persist() {
        let el = EventLoop::new();
        let ev = Event::new("ev", &el);
        ev.subscribe_static(|| {});
        ev.subscribe_static(|| {});

        assert_eq!(ev.take_actions().len(), 2);
        assert_eq!(ev.take_actions().len(), 2);
    }

    #[test]
    fn test_dynamic_subscribers_are_one_shot() {
        let el = EventLoop::new();
        let ev = Event::new("ev", &el);
        ev.subscribe_dynamic_once(|| {});

        assert_eq!(ev.dynamic_count(), 1);
        assert_eq!(ev.take_actions().len(), 1);
        assert_eq!(ev.dynamic_count(), 0);
        assert!(ev.take_actions().is_empty());
    }

    #[test]
    fn test_dynamic_runs_before_static() {
        let el = EventLoop::new();
        let ev = Event::new("ev", &el);
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        ev.subscribe_static(move || o.borrow_mut().push("static"));
        let o = order.clone();
        ev.subscribe_dynamic_once(move || o.borrow_mut().push("dynamic"));

        for a in ev.take_actions() {
            invoke(&a);
        }
        assert_eq!(*order.borrow(), vec!["dynamic", "static"]);
    }

    #[test]
    fn test_unsubscribe_static() {
        let el = EventLoop::new();
        let ev = Event::new("ev", &el);
        let keep = ev.subscribe_static(|| {});
        let drop_me = ev.subscribe_static(|| {});

        assert!(ev.unsubscribe_static(drop_me));
        assert!(!ev.unsubscribe_static(drop_me));
        assert_eq!(ev.static_count(), 1);
        assert!(ev.unsubscribe_static(keep));
        assert_eq!(ev.static_count(), 0);
    }

    #[test]
    fn test_clones_are_equal() {
        let el = EventLoop::new();
        let a = Event::new("a", &el);
        let b = Event::new("a", &el);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_any_installs_forwarders() {
        let el = EventLoop::new();
        let a = Event::new("a", &el);
        let b = Event::new("b", &el);
        let either = Event::any(&el, &[&a, &b]);

        assert_eq!(either.name(), "any(a|b)");
        assert_eq!(a.static_count(), 1);
        assert_eq!(b.static_count(), 1);
    }

    #[test]
    fn test_notify_after_dropped_loop() {
        let ev = {
            let el = EventLoop::new();
            Event::new("orphan", &el)
        };
        assert!(ev.event_loop().is_none());
        assert!(ev.loop_handle().is_none());
        assert_eq!(
            ev.notify_after(1.0),
            Err(crate::error::KernelError::LoopDropped)
        );
        // Immediate notification is a silent no-op.
        ev.notify();
    }
}

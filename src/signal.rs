//! Two-phase signals.
//!
//! A [`Signal`] holds a committed value that every reader sees and a staged
//! value that writers overwrite. Writes register the signal with the loop's
//! pending-update set; at the next update phase the staged value is
//! committed and the `changed`/`updated` events are notified. Readers in
//! the same instant therefore all observe the pre-update value, whatever
//! order the writing handlers ran in.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::event::Event;
use crate::event_loop::{EventLoop, LoopCore, Update};

pub(crate) struct SignalCore<T> {
    name: String,
    initial: T,
    committed: RefCell<T>,
    staged: RefCell<T>,
    changed: Event,
    updated: Event,
    was_changed: Cell<bool>,
    was_updated: Cell<bool>,
    /// A write is staged and not yet committed.
    pending: Cell<bool>,
    owner: Weak<LoopCore>,
}

impl<T: PartialEq + Clone> Update for SignalCore<T> {
    fn apply_update(&self) {
        if !self.pending.replace(false) {
            return;
        }
        let staged = self.staged.borrow().clone();
        if *self.committed.borrow() != staged {
            self.was_changed.set(true);
            self.changed.notify();
        }
        self.was_updated.set(true);
        self.updated.notify();
        *self.committed.borrow_mut() = staged;
    }
}

/// A shared value with deferred (two-phase) write semantics.
///
/// `Signal` is a clonable handle; clones share the same value. Change
/// detection uses value equality, so `T` must implement `PartialEq`.
pub struct Signal<T> {
    core: Rc<SignalCore<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: PartialEq + Clone + 'static> Signal<T> {
    /// Create a signal holding `initial` on `event_loop`.
    ///
    /// Its events are named `<name>.changed` and `<name>.updated`.
    pub fn new(name: impl Into<String>, initial: T, event_loop: &EventLoop) -> Self {
        let name = name.into();
        Signal {
            core: Rc::new(SignalCore {
                changed: Event::new(format!("{}.changed", name), event_loop),
                updated: Event::new(format!("{}.updated", name), event_loop),
                committed: RefCell::new(initial.clone()),
                staged: RefCell::new(initial.clone()),
                initial,
                was_changed: Cell::new(false),
                was_updated: Cell::new(false),
                pending: Cell::new(false),
                owner: event_loop.downgrade(),
                name,
            }),
        }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The last committed value.
    pub fn get(&self) -> T {
        self.core.committed.borrow().clone()
    }

    /// Borrow the last committed value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.core.committed.borrow())
    }

    /// Stage `value` for the next update phase.
    ///
    /// Invisible to readers until then; later writes in the same delta
    /// cycle overwrite earlier ones. If the owning loop has been dropped
    /// the value stays staged and is never committed.
    pub fn set(&self, value: T) {
        *self.core.staged.borrow_mut() = value;
        self.core.pending.set(true);
        if let Some(el) = self.core.owner.upgrade().map(EventLoop::from_core) {
            el.request_update(self.core.clone());
        }
    }

    /// The value the signal reverts to on [`Signal::reset`].
    pub fn initial(&self) -> &T {
        &self.core.initial
    }

    /// Revert both the committed and the staged value to the initial
    /// value, and clear the sticky flags.
    ///
    /// A write staged before the reset is discarded: the next update phase
    /// neither commits it nor fires `updated`.
    pub fn reset(&self) {
        self.core.pending.set(false);
        *self.core.committed.borrow_mut() = self.core.initial.clone();
        *self.core.staged.borrow_mut() = self.core.initial.clone();
        self.core.was_changed.set(false);
        self.core.was_updated.set(false);
    }
}

impl<T> Signal<T> {
    /// Notified at every update phase that changed the value.
    pub fn changed(&self) -> &Event {
        &self.core.changed
    }

    /// Notified at every update phase that committed a write, changed or not.
    pub fn updated(&self) -> &Event {
        &self.core.updated
    }

    /// Sticky: set by the first committed write that changed the value.
    pub fn was_changed(&self) -> bool {
        self.core.was_changed.get()
    }

    /// Sticky: set by the first committed write.
    pub fn was_updated(&self) -> bool {
        self.core.was_updated.get()
    }

    /// Overwrite the sticky `was_changed` flag.
    pub fn set_was_changed(&self, flag: bool) {
        self.core.was_changed.set(flag);
    }

    /// Overwrite the sticky `was_updated` flag.
    pub fn set_was_updated(&self, flag: bool) {
        self.core.was_updated.set(flag);
    }

    pub(crate) fn owner(&self) -> &Weak<LoopCore> {
        &self.core.owner
    }

    pub(crate) fn ptr_eq(&self, other: &Signal<T>) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    pub(crate) fn downgrade(&self) -> Weak<SignalCore<T>> {
        Rc::downgrade(&self.core)
    }

    pub(crate) fn from_weak(weak: &Weak<SignalCore<T>>) -> Option<Signal<T>> {
        weak.upgrade().map(|core| Signal { core })
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.core.name)
            .field("value", &*self.core.committed.borrow())
            .field("staged", &*self.core.staged.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(event: &Event) -> Rc<Cell<u32>> {
        let n = Rc::new(Cell::new(0));
        let c = n.clone();
        event.subscribe_static(move || c.set(c.get() + 1));
        n
    }

    #[test]
    fn test_write_is_invisible_until_update_phase() {
        let el = EventLoop::new();
        let sig = Signal::new("s", 1, &el);
        sig.set(5);
        assert_eq!(sig.get(), 1);

        el.run().unwrap();
        assert_eq!(sig.get(), 5);
    }

    #[test]
    fn test_writes_in_one_delta_collapse() {
        let el = EventLoop::new();
        let sig = Signal::new("s", 0, &el);
        let changed = count(sig.changed());
        let updated = count(sig.updated());

        let ev = Event::new("writer", &el);
        let s = sig.clone();
        ev.subscribe_static(move || {
            s.set(1);
            s.set(2);
        });
        ev.notify_after(1.0).unwrap();

        el.run().unwrap();
        assert_eq!(sig.get(), 2);
        assert_eq!(changed.get(), 1);
        assert_eq!(updated.get(), 1);
    }

    #[test]
    fn test_same_value_updates_but_does_not_change() {
        let el = EventLoop::new();
        let sig = Signal::new("s", String::from("x"), &el);
        let changed = count(sig.changed());
        let updated = count(sig.updated());

        sig.set("x".to_string());
        el.run().unwrap();

        assert_eq!(changed.get(), 0);
        assert_eq!(updated.get(), 1);
        assert!(sig.was_updated());
        assert!(!sig.was_changed());
    }

    #[test]
    fn test_readers_see_pre_update_value() {
        let el = EventLoop::new();
        let sig = Signal::new("s", 10, &el);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let ev = Event::new("tick", &el);

        // The writer runs first, the reader second; both in the same batch.
        let s = sig.clone();
        ev.subscribe_static(move || s.set(99));
        let (s, log) = (sig.clone(), seen.clone());
        ev.subscribe_static(move || log.borrow_mut().push(s.get()));
        ev.notify_after(1.0).unwrap();

        el.run().unwrap();
        assert_eq!(*seen.borrow(), vec![10]);
        assert_eq!(sig.get(), 99);
    }

    #[test]
    fn test_changed_handlers_see_committed_value() {
        let el = EventLoop::new();
        let sig = Signal::new("s", 0, &el);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let (s, log, h) = (sig.clone(), seen.clone(), el.handle());
        sig.changed()
            .subscribe_static(move || log.borrow_mut().push((h.now(), s.get())));

        let ev = Event::new("w", &el);
        let s = sig.clone();
        ev.subscribe_static(move || s.set(s.get() + 3));
        ev.notify_after(2.0).unwrap();

        el.run().unwrap();
        assert_eq!(*seen.borrow(), vec![(2.0, 3)]);
    }

    #[test]
    fn test_flags_are_sticky_and_clearable() {
        let el = EventLoop::new();
        let sig = Signal::new("s", 0, &el);
        sig.set(1);
        el.run().unwrap();
        sig.set(1);
        el.run().unwrap();
        assert!(sig.was_changed());

        sig.set_was_changed(false);
        sig.set_was_updated(false);
        assert!(!sig.was_changed());
        assert!(!sig.was_updated());
    }

    #[test]
    fn test_reset_restores_initial() {
        let el = EventLoop::new();
        let sig = Signal::new("s", 7, &el);
        sig.set(8);
        el.run().unwrap();
        sig.set(9);

        sig.reset();
        assert_eq!(sig.get(), 7);
        assert_eq!(*sig.initial(), 7);
        el.run().unwrap();
        // The staged slot was reverted too.
        assert_eq!(sig.get(), 7);
    }

    #[test]
    fn test_reset_discards_staged_write() {
        let el = EventLoop::new();
        let sig = Signal::new("s", 7, &el);
        let updated = count(sig.updated());
        sig.set(8);
        sig.reset();

        el.run().unwrap();
        assert_eq!(sig.get(), 7);
        assert_eq!(updated.get(), 0);
        assert!(!sig.was_updated());

        // A write after the reset in the same delta still commits.
        sig.set(9);
        sig.reset();
        sig.set(10);
        el.run().unwrap();
        assert_eq!(sig.get(), 10);
        assert_eq!(updated.get(), 1);
    }

    #[test]
    fn test_event_names() {
        let el = EventLoop::new();
        let sig = Signal::new("bus", 0u8, &el);
        assert_eq!(sig.changed().name(), "bus.changed");
        assert_eq!(sig.updated().name(), "bus.updated");
    }
}

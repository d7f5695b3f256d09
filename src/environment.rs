use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Key for an environment signal subscription.
    pub struct SignalListenerKey;
}

/// A subscribable boolean signal.
///
/// Defaults to `true` on non-browser hosts; tests and embedders override it
/// to simulate focus loss or going offline.
#[derive(Clone)]
struct BoolSignal {
    value: Rc<Cell<bool>>,
    listeners: Rc<RefCell<SlotMap<SignalListenerKey, Box<dyn Fn(bool)>>>>,
}

impl BoolSignal {
    fn new(initial: bool) -> Self {
        Self {
            value: Rc::new(Cell::new(initial)),
            listeners: Rc::new(RefCell::new(SlotMap::with_key())),
        }
    }

    fn get(&self) -> bool {
        self.value.get()
    }

    fn set(&self, value: bool) {
        if self.value.get() == value {
            return;
        }
        self.value.set(value);
        let listeners = self.listeners.borrow();
        for listener in listeners.values() {
            listener(value);
        }
    }

    fn subscribe(&self, listener: impl Fn(bool) + 'static) -> SignalListenerKey {
        self.listeners.borrow_mut().insert(Box::new(listener))
    }

    fn unsubscribe(&self, key: SignalListenerKey) -> bool {
        self.listeners.borrow_mut().remove(key).is_some()
    }
}

/// Tracks whether the host application is focused.
///
/// Paused retries resume and focus-refetch policies re-evaluate when focus
/// returns. Platform detection lives outside this crate; embedders feed the
/// signal through [`set_focused`](Self::set_focused).
#[derive(Clone)]
pub struct FocusManager {
    signal: BoolSignal,
}

impl Default for FocusManager {
    fn default() -> Self {
        Self {
            signal: BoolSignal::new(true),
        }
    }
}

impl FocusManager {
    /// Creates a manager reporting the given initial focus state.
    pub fn new(focused: bool) -> Self {
        Self {
            signal: BoolSignal::new(focused),
        }
    }

    /// Current focus state.
    pub fn is_focused(&self) -> bool {
        self.signal.get()
    }

    /// Updates the focus state, notifying subscribers on change.
    pub fn set_focused(&self, focused: bool) {
        self.signal.set(focused);
    }

    /// Subscribes to focus changes.
    pub fn subscribe(&self, listener: impl Fn(bool) + 'static) -> SignalListenerKey {
        self.signal.subscribe(listener)
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, key: SignalListenerKey) -> bool {
        self.signal.unsubscribe(key)
    }
}

/// Tracks network reachability.
///
/// `Online` network mode refuses to start fetches while offline, and paused
/// retries resume when connectivity returns. Fully overridable for offline
/// simulation.
#[derive(Clone)]
pub struct OnlineManager {
    signal: BoolSignal,
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self {
            signal: BoolSignal::new(true),
        }
    }
}

impl OnlineManager {
    /// Creates a manager reporting the given initial connectivity.
    pub fn new(online: bool) -> Self {
        Self {
            signal: BoolSignal::new(online),
        }
    }

    /// Current connectivity state.
    pub fn is_online(&self) -> bool {
        self.signal.get()
    }

    /// Updates the connectivity state, notifying subscribers on change.
    pub fn set_online(&self, online: bool) {
        self.signal.set(online);
    }

    /// Subscribes to connectivity changes.
    pub fn subscribe(&self, listener: impl Fn(bool) + 'static) -> SignalListenerKey {
        self.signal.subscribe(listener)
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, key: SignalListenerKey) -> bool {
        self.signal.unsubscribe(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_focused_and_online() {
        assert!(FocusManager::default().is_focused());
        assert!(OnlineManager::default().is_online());
    }

    #[test]
    fn notifies_only_on_change() {
        let online = OnlineManager::default();
        let notifications = Rc::new(RefCell::new(Vec::new()));
        let log = notifications.clone();
        online.subscribe(move |value| log.borrow_mut().push(value));

        online.set_online(true); // no change
        online.set_online(false);
        online.set_online(false); // no change
        online.set_online(true);

        assert_eq!(*notifications.borrow(), vec![false, true]);
    }

    #[test]
    fn unsubscribed_listeners_stop_firing() {
        let focus = FocusManager::default();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let key = focus.subscribe(move |_| counter.set(counter.get() + 1));

        focus.set_focused(false);
        assert_eq!(count.get(), 1);

        assert!(focus.unsubscribe(key));
        focus.set_focused(true);
        assert_eq!(count.get(), 1);
    }
}

use crate::{FocusManager, NotifyManager, OnlineManager, TimeoutManager};

/// The ambient services every cache entity depends on: notification
/// batching, timers, and the focus/online environment signals.
///
/// Explicitly constructed and injected into the caches and client rather
/// than living in globals, so tests and embedders can substitute any of
/// them. `Services::default()` is the convenience wiring for production use.
#[derive(Clone, Default)]
pub struct Services {
    /// Batches listener callbacks into a single flush.
    pub notify: NotifyManager,
    /// Injectable timer provider.
    pub timers: TimeoutManager,
    /// "Is the host focused" signal.
    pub focus: FocusManager,
    /// "Is the network reachable" signal.
    pub online: OnlineManager,
}

impl Services {
    /// Default service wiring: tokio timers, focused and online.
    pub fn new() -> Self {
        Self::default()
    }
}

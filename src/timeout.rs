use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tracing::warn;

/// Cancellation handle for a scheduled timeout or interval.
///
/// Clearing is idempotent: a second `clear` is a no-op, as is clearing a
/// timer that has already fired.
pub struct TimeoutHandle {
    clear: Cell<Option<Box<dyn FnOnce()>>>,
}

impl TimeoutHandle {
    /// Wraps a cancel action provided by a timer backend.
    pub fn new(clear: impl FnOnce() + 'static) -> Self {
        Self {
            clear: Cell::new(Some(Box::new(clear))),
        }
    }

    /// Cancels the underlying timer if it is still armed.
    pub fn clear(&self) {
        if let Some(clear) = self.clear.take() {
            clear();
        }
    }
}

impl std::fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutHandle").finish_non_exhaustive()
    }
}

/// Timer primitives backing the cache, swappable at runtime.
pub trait TimerBackend {
    /// Runs `callback` once after `delay`.
    fn set_timeout(&self, callback: Box<dyn FnOnce()>, delay: Duration) -> TimeoutHandle;
    /// Runs `callback` every `period` until the handle is cleared.
    fn set_interval(&self, callback: Box<dyn Fn()>, period: Duration) -> TimeoutHandle;
    /// Awaitable sleep for the same clock the timeouts fire on.
    fn sleep(&self, delay: Duration) -> LocalBoxFuture<'static, ()>;
}

/// Default backend driven by the tokio timer wheel.
///
/// Timers are spawned as local tasks, so the cache must run inside a
/// [`tokio::task::LocalSet`]. Respects `tokio::time::pause` in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimers;

impl TimerBackend for TokioTimers {
    fn set_timeout(&self, callback: Box<dyn FnOnce()>, delay: Duration) -> TimeoutHandle {
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimeoutHandle::new(move || task.abort())
    }

    fn set_interval(&self, callback: Box<dyn Fn()>, period: Duration) -> TimeoutHandle {
        let task = tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(period).await;
                callback();
            }
        });
        TimeoutHandle::new(move || task.abort())
    }

    fn sleep(&self, delay: Duration) -> LocalBoxFuture<'static, ()> {
        tokio::time::sleep(delay).boxed_local()
    }
}

/// Indirection over timer primitives so backends can be swapped wholesale
/// (e.g. a virtual clock in tests, or a host-provided scheduler).
#[derive(Clone)]
pub struct TimeoutManager {
    backend: Rc<RefCell<Rc<dyn TimerBackend>>>,
    used: Cell<bool>,
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new(TokioTimers)
    }
}

impl TimeoutManager {
    /// Creates a manager over the given backend.
    pub fn new(backend: impl TimerBackend + 'static) -> Self {
        Self {
            backend: Rc::new(RefCell::new(Rc::new(backend))),
            used: Cell::new(false),
        }
    }

    /// Replaces the timer backend. Switching after timers have already been
    /// scheduled through the previous backend is a detectable misuse: those
    /// timers keep running on the old backend and cannot be reasoned about
    /// here, so the switch is logged but not fatal.
    pub fn set_backend(&self, backend: impl TimerBackend + 'static) {
        if self.used.get() {
            warn!("timer backend replaced after timers were scheduled on the previous backend");
        }
        *self.backend.borrow_mut() = Rc::new(backend);
    }

    /// Schedules `callback` to run once after `delay`.
    pub fn set_timeout(&self, callback: impl FnOnce() + 'static, delay: Duration) -> TimeoutHandle {
        self.used.set(true);
        self.backend
            .borrow()
            .set_timeout(Box::new(callback), delay)
    }

    /// Schedules `callback` to run every `period`.
    pub fn set_interval(&self, callback: impl Fn() + 'static, period: Duration) -> TimeoutHandle {
        self.used.set(true);
        self.backend
            .borrow()
            .set_interval(Box::new(callback), period)
    }

    /// Awaitable sleep on the managed clock.
    pub fn sleep(&self, delay: Duration) -> LocalBoxFuture<'static, ()> {
        self.used.set(true);
        self.backend.borrow().sleep(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_after_delay() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let timers = TimeoutManager::default();
                let fired = Rc::new(Cell::new(false));
                let flag = fired.clone();
                let _handle =
                    timers.set_timeout(move || flag.set(true), Duration::from_millis(100));

                tokio::time::sleep(Duration::from_millis(50)).await;
                assert!(!fired.get());
                tokio::time::sleep(Duration::from_millis(60)).await;
                assert!(fired.get());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_timeout_never_fires_and_double_clear_is_a_noop() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let timers = TimeoutManager::default();
                let fired = Rc::new(Cell::new(false));
                let flag = fired.clone();
                let handle = timers.set_timeout(move || flag.set(true), Duration::from_millis(10));

                handle.clear();
                handle.clear();

                tokio::time::sleep(Duration::from_millis(50)).await;
                assert!(!fired.get());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticks_until_cleared() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let timers = TimeoutManager::default();
                let ticks = Rc::new(Cell::new(0u32));
                let counter = ticks.clone();
                let handle = timers
                    .set_interval(move || counter.set(counter.get() + 1), Duration::from_millis(10));

                tokio::time::sleep(Duration::from_millis(35)).await;
                handle.clear();
                let seen = ticks.get();
                assert_eq!(seen, 3);

                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(ticks.get(), seen);
            })
            .await;
    }
}

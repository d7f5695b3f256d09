use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use crate::{timeout::TimeoutHandle, TimeoutManager};

/// Quiescence window before an unreferenced cache entry is evicted.
pub const DEFAULT_GC_TIME: Duration = Duration::from_millis(300_000);

/// Schedules deferred self-removal for a cache entry.
///
/// Armed when the last observer detaches, cancelled whenever one attaches.
/// The effective gc time only ever grows for a given entry: the longest
/// consumer wins.
pub(crate) struct GarbageCollector {
    gc_time: Cell<Duration>,
    handle: Cell<Option<TimeoutHandle>>,
    timers: TimeoutManager,
    on_elapsed: Rc<RefCell<Option<Box<dyn Fn()>>>>,
}

impl GarbageCollector {
    pub(crate) fn new(timers: TimeoutManager) -> Self {
        Self {
            gc_time: Cell::new(DEFAULT_GC_TIME),
            handle: Cell::new(None),
            timers,
            on_elapsed: Rc::new(RefCell::new(None)),
        }
    }

    /// Sets the removal callback. Called once by the owning cache at build
    /// time; the callback must check the entry is still unreferenced.
    pub(crate) fn set_on_elapsed(&self, on_elapsed: impl Fn() + 'static) {
        *self.on_elapsed.borrow_mut() = Some(Box::new(on_elapsed));
    }

    /// Keep max gc time.
    pub(crate) fn update_gc_time(&self, gc_time: Option<Duration>) {
        let gc_time = gc_time.unwrap_or(DEFAULT_GC_TIME);
        if gc_time > self.gc_time.get() {
            self.gc_time.set(gc_time);
        }
    }

    pub(crate) fn gc_time(&self) -> Duration {
        self.gc_time.get()
    }

    /// Arms the removal timer. A no-op while a timer is already pending.
    pub(crate) fn schedule(&self) {
        let current = self.handle.take();
        if current.is_some() {
            self.handle.set(current);
            return;
        }

        let on_elapsed = self.on_elapsed.clone();
        let callback = move || {
            if let Some(on_elapsed) = on_elapsed.borrow().as_ref() {
                on_elapsed();
            }
        };
        let handle = self.timers.set_timeout(callback, self.gc_time.get());
        self.handle.set(Some(handle));
    }

    /// Cancels a pending removal timer.
    pub(crate) fn cancel(&self) {
        if let Some(handle) = self.handle.take() {
            handle.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_time_defaults_to_five_minutes() {
        let gc = GarbageCollector::new(TimeoutManager::default());
        assert_eq!(gc.gc_time(), Duration::from_millis(300_000));
    }

    #[test]
    fn gc_time_only_grows() {
        let gc = GarbageCollector::new(TimeoutManager::default());
        gc.update_gc_time(Some(Duration::from_secs(60)));
        assert_eq!(gc.gc_time(), DEFAULT_GC_TIME);

        gc.update_gc_time(Some(Duration::from_secs(600)));
        assert_eq!(gc.gc_time(), Duration::from_secs(600));

        gc.update_gc_time(None);
        assert_eq!(gc.gc_time(), Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_fires_once_after_the_window() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let gc = GarbageCollector::new(TimeoutManager::default());
                let fired = Rc::new(Cell::new(0u32));
                let counter = fired.clone();
                gc.set_on_elapsed(move || counter.set(counter.get() + 1));

                gc.schedule();
                gc.schedule(); // second call does not double-arm

                tokio::time::sleep(DEFAULT_GC_TIME + Duration::from_secs(1)).await;
                assert_eq!(fired.get(), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_disarms_the_timer() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let gc = GarbageCollector::new(TimeoutManager::default());
                let fired = Rc::new(Cell::new(false));
                let flag = fired.clone();
                gc.set_on_elapsed(move || flag.set(true));

                gc.schedule();
                gc.cancel();

                tokio::time::sleep(DEFAULT_GC_TIME + Duration::from_secs(1)).await;
                assert!(!fired.get());
            })
            .await;
    }
}

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

/// Transactional batching of listener callbacks.
///
/// Nested [`batch`](NotifyManager::batch) calls share one flush: callbacks
/// scheduled while any batch is open are queued and run once when the
/// outermost batch exits, so a single logical event fans out to cache
/// listeners and observer listeners exactly once. Outside a batch, callbacks
/// run immediately.
#[derive(Clone, Default)]
pub struct NotifyManager {
    inner: Rc<NotifyInner>,
}

#[derive(Default)]
struct NotifyInner {
    depth: Cell<usize>,
    queue: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl NotifyManager {
    /// Creates a new manager with no pending callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` inside a batch. Callbacks scheduled during `f` (directly or
    /// through nested batches) are flushed once when the outermost batch
    /// exits, after every participating state transition has been applied.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        let inner = &self.inner;
        inner.depth.set(inner.depth.get() + 1);
        let result = f();
        inner.depth.set(inner.depth.get() - 1);
        if inner.depth.get() == 0 {
            self.flush();
        }
        result
    }

    /// Schedules `callback`: queued if a batch is open, run immediately
    /// otherwise.
    pub fn schedule(&self, callback: impl FnOnce() + 'static) {
        if self.inner.depth.get() > 0 {
            self.inner.queue.borrow_mut().push(Box::new(callback));
        } else {
            callback();
        }
    }

    /// Wraps a callback so every later invocation is scheduled through this
    /// manager.
    pub fn batch_calls<A: 'static>(&self, callback: impl Fn(A) + 'static) -> impl Fn(A) {
        let manager = self.clone();
        let callback = Rc::new(callback);
        move |arg| {
            let callback = callback.clone();
            manager.schedule(move || callback(arg));
        }
    }

    fn flush(&self) {
        // Callbacks may schedule further callbacks; drain until quiescent.
        loop {
            let drained: Vec<_> = self.inner.queue.borrow_mut().drain(..).collect();
            if drained.is_empty() {
                break;
            }
            for callback in drained {
                callback();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_run_immediately_outside_a_batch() {
        let manager = NotifyManager::new();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        manager.schedule(move || flag.set(true));
        assert!(fired.get());
    }

    #[test]
    fn nested_batches_share_one_flush() {
        let manager = NotifyManager::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        manager.batch(|| {
            let log = order.clone();
            manager.schedule(move || log.borrow_mut().push("outer"));
            manager.batch(|| {
                let log = order.clone();
                manager.schedule(move || log.borrow_mut().push("inner"));
            });
            // Nothing has flushed while the outer batch is still open.
            assert!(order.borrow().is_empty());
        });

        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn callbacks_scheduled_during_flush_also_run() {
        let manager = NotifyManager::new();
        let count = Rc::new(Cell::new(0));

        manager.batch(|| {
            let inner_manager = manager.clone();
            let counter = count.clone();
            manager.schedule(move || {
                counter.set(counter.get() + 1);
                let counter = counter.clone();
                inner_manager.schedule(move || counter.set(counter.get() + 1));
            });
        });

        assert_eq!(count.get(), 2);
    }

    #[test]
    fn batched_callbacks_defer_until_the_batch_exits() {
        let manager = NotifyManager::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let listener = manager.batch_calls(move |value: u32| log.borrow_mut().push(value));

        manager.batch(|| {
            listener(1);
            listener(2);
            assert!(seen.borrow().is_empty());
        });
        assert_eq!(*seen.borrow(), vec![1, 2]);

        listener(3);
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn batch_returns_the_closure_result() {
        let manager = NotifyManager::new();
        assert_eq!(manager.batch(|| 42), 42);
    }
}

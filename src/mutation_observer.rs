use std::{
    cell::RefCell,
    rc::Rc,
    sync::atomic::{AtomicU32, Ordering},
};

use futures::future::LocalBoxFuture;
use serde_json::Value;
use slotmap::{new_key_type, SlotMap};

use crate::{
    mutation::{Mutation, MutationOptions},
    Instant, MutationCache, MutationStatus, QueryError,
};

static NEXT_MUTATION_OBSERVER_ID: AtomicU32 = AtomicU32::new(0);

new_key_type! {
    /// Key identifying one mutation result listener.
    pub struct MutationObserverListenerKey;
}

/// The listener-facing view of a mutation observer.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationObserverResult {
    /// Result of the last successful execution.
    pub data: Option<Rc<Value>>,
    /// Error of the last failed execution.
    pub error: Option<QueryError>,
    /// Result status.
    pub status: MutationStatus,
    /// Suspended on the environment or on scope exclusion.
    pub is_paused: bool,
    /// The variables of the latest submission.
    pub variables: Option<Value>,
    /// Failed attempts of the current execution.
    pub failure_count: u32,
    /// Reason for the most recent failed attempt.
    pub failure_reason: Option<QueryError>,
    /// When the latest submission happened.
    pub submitted_at: Option<Instant>,
}

impl MutationObserverResult {
    /// Not yet executed.
    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    /// Executing, possibly paused.
    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    /// The last execution succeeded.
    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    /// The last execution failed.
    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

fn idle_result() -> MutationObserverResult {
    MutationObserverResult {
        data: None,
        error: None,
        status: MutationStatus::Idle,
        is_paused: false,
        variables: None,
        failure_count: 0,
        failure_reason: None,
        submitted_at: None,
    }
}

type ResultListener = Rc<dyn Fn(&MutationObserverResult)>;

/// A handle for submitting mutations and observing the latest one.
///
/// Each [`mutate`](Self::mutate) call creates a fresh [`Mutation`] in the
/// cache and repoints the observer at it; listeners always see the newest
/// submission.
#[derive(Clone)]
pub struct MutationObserver {
    inner: Rc<MutationObserverInner>,
}

struct MutationObserverInner {
    id: u32,
    cache: MutationCache,
    options: RefCell<MutationOptions>,
    mutation: RefCell<Option<Mutation>>,
    listeners: RefCell<SlotMap<MutationObserverListenerKey, ResultListener>>,
}

impl MutationObserver {
    /// Creates an idle observer.
    pub fn new(cache: MutationCache, options: MutationOptions) -> Self {
        Self {
            inner: Rc::new(MutationObserverInner {
                id: NEXT_MUTATION_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
                cache,
                options: RefCell::new(options),
                mutation: RefCell::new(None),
                listeners: RefCell::new(SlotMap::with_key()),
            }),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.inner.id
    }

    /// Replaces the observer's options. Applies to the next submission; the
    /// current mutation keeps the options it started with.
    pub fn set_options(&self, options: MutationOptions) {
        *self.inner.options.borrow_mut() = options;
    }

    /// Submits a new mutation with `variables`.
    pub fn mutate(&self, variables: Value) -> LocalBoxFuture<'static, Result<Rc<Value>, QueryError>> {
        if let Some(previous) = self.inner.mutation.borrow_mut().take() {
            previous.remove_observer(self);
        }
        let mutation = self.inner.cache.build(self.inner.options.borrow().clone());
        mutation.add_observer(self);
        *self.inner.mutation.borrow_mut() = Some(mutation.clone());
        self.notify();
        mutation.execute(variables)
    }

    /// Detaches from the current mutation and returns to idle.
    pub fn reset(&self) {
        if let Some(mutation) = self.inner.mutation.borrow_mut().take() {
            mutation.remove_observer(self);
        }
        self.notify();
    }

    /// The latest submission's state, or an idle result before the first.
    pub fn current_result(&self) -> MutationObserverResult {
        match self.inner.mutation.borrow().as_ref() {
            Some(mutation) => {
                let state = mutation.state();
                MutationObserverResult {
                    data: state.data,
                    error: state.error,
                    status: state.status,
                    is_paused: state.is_paused,
                    variables: state.variables,
                    failure_count: state.failure_count,
                    failure_reason: state.failure_reason,
                    submitted_at: state.submitted_at,
                }
            }
            None => idle_result(),
        }
    }

    /// Registers a result listener.
    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationObserverResult) + 'static,
    ) -> MutationObserverListenerKey {
        self.inner.listeners.borrow_mut().insert(Rc::new(listener))
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, key: MutationObserverListenerKey) {
        self.inner.listeners.borrow_mut().remove(key);
    }

    pub(crate) fn on_mutation_update(&self) {
        self.notify();
    }

    fn notify(&self) {
        let listeners: Vec<ResultListener> =
            self.inner.listeners.borrow().values().cloned().collect();
        if listeners.is_empty() {
            return;
        }
        let result = self.current_result();
        let services = self.inner.cache.services().clone();
        services.notify.batch(|| {
            for listener in listeners {
                let result = result.clone();
                services.notify.schedule(move || listener(&result));
            }
        });
    }
}

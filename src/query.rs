use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    time::Duration,
};

use futures::{
    future::{LocalBoxFuture, Shared},
    FutureExt,
};
use serde_json::Value;
use tracing::{debug, error};

use crate::{
    garbage_collector::GarbageCollector,
    query_cache::{QueryCache, QueryCacheEvent, QueryCacheInner},
    query_observer::QueryObserver,
    query_state::{reduce, QueryAction},
    retryer::{can_fetch, Retryer, RetryerConfig},
    util::time_until_stale,
    CancelledError, FetchDirection, FetchOptions, FetchStatus, Instant, QueryError, QueryHash,
    QueryKey, QueryOptions, QueryState, Services,
};

/// Successful fetch payload: `None` models a fetch function that completed
/// without producing a value, which is an error condition, not a cache write.
pub type QueryFnResult = Result<Option<Value>, QueryError>;

/// A caller-supplied fetch function.
pub type QueryFn = Rc<dyn Fn(QueryFnContext) -> LocalBoxFuture<'static, QueryFnResult>>;

pub(crate) type QueryPromise = Shared<LocalBoxFuture<'static, Result<Rc<Value>, QueryError>>>;

/// Cooperative cancellation flag handed to fetch functions.
///
/// Reading the signal through [`QueryFnContext::signal`] marks the fetch as
/// abort-aware, which changes what happens when every observer detaches
/// mid-flight: consumed signals get a hard cancel, unconsumed ones let the
/// attempt finish and cache its result.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Rc<AbortFlags>,
}

#[derive(Default)]
struct AbortFlags {
    aborted: Cell<bool>,
    consumed: Cell<bool>,
}

impl AbortSignal {
    /// Whether the fetch has been cancelled.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.get()
    }

    pub(crate) fn set_aborted(&self) {
        self.inner.aborted.set(true);
    }

    pub(crate) fn is_consumed(&self) -> bool {
        self.inner.consumed.get()
    }

    fn mark_consumed(&self) {
        self.inner.consumed.set(true);
    }
}

/// Context passed to every fetch function invocation.
#[derive(Clone)]
pub struct QueryFnContext {
    /// The key being fetched.
    pub query_key: QueryKey,
    /// Metadata from the query options.
    pub meta: Option<Value>,
    /// Page parameter, set by the infinite-query behavior.
    pub page_param: Option<Value>,
    /// Page direction, set by the infinite-query behavior.
    pub direction: Option<FetchDirection>,
    signal: AbortSignal,
}

impl QueryFnContext {
    pub(crate) fn new(
        query_key: QueryKey,
        meta: Option<Value>,
        page_param: Option<Value>,
        direction: Option<FetchDirection>,
        signal: AbortSignal,
    ) -> Self {
        Self {
            query_key,
            meta,
            page_param,
            direction,
            signal,
        }
    }

    /// The cancellation signal for this fetch. Reading it marks the fetch as
    /// abort-aware.
    pub fn signal(&self) -> AbortSignal {
        self.signal.mark_consumed();
        self.signal.clone()
    }
}

/// The effective fetch for one execution, as seen by a [`FetchBehavior`].
pub struct FetchContext {
    /// The function the retryer will drive. Behaviors may replace it.
    pub fetch_fn: Rc<dyn Fn() -> LocalBoxFuture<'static, QueryFnResult>>,
    /// The raw fetch function from the options.
    pub query_fn: QueryFn,
    /// The key being fetched.
    pub query_key: QueryKey,
    /// Metadata from the query options.
    pub meta: Option<Value>,
    /// State snapshot taken before the fetch starts.
    pub state: QueryState,
    /// Page direction, when the caller asked for one.
    pub direction: Option<FetchDirection>,
    /// The cancellation signal for this fetch.
    pub signal: AbortSignal,
}

/// Hook that may rewrite the effective fetch function before it runs; the
/// infinite-pages variant uses this to sequence multiple underlying calls.
pub trait FetchBehavior {
    /// Inspect and optionally replace `context.fetch_fn`.
    fn on_fetch(&self, context: &mut FetchContext);
}

/// One cached unit of fetch state, keyed by its canonical hash.
#[derive(Clone)]
pub struct Query {
    inner: Rc<QueryInner>,
}

pub(crate) struct QueryInner {
    key: QueryKey,
    hash: QueryHash,
    options: RefCell<QueryOptions>,
    state: RefCell<QueryState>,
    revert_state: RefCell<Option<QueryState>>,
    retryer: RefCell<Option<Retryer<Option<Rc<Value>>>>>,
    promise: RefCell<Option<QueryPromise>>,
    abort_signal: RefCell<Option<AbortSignal>>,
    observers: RefCell<Vec<QueryObserver>>,
    cache: RefCell<Weak<QueryCacheInner>>,
    gc: GarbageCollector,
    services: Services,
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.inner.hash == other.inner.hash
    }
}

impl Eq for Query {}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Query").field(&self.inner.hash.0).finish()
    }
}

impl Query {
    pub(crate) fn new(key: QueryKey, hash: QueryHash, services: Services) -> Self {
        let gc = GarbageCollector::new(services.timers.clone());
        Query {
            inner: Rc::new(QueryInner {
                key,
                hash,
                options: RefCell::new(QueryOptions::default()),
                state: RefCell::new(QueryState::default()),
                revert_state: RefCell::new(None),
                retryer: RefCell::new(None),
                promise: RefCell::new(None),
                abort_signal: RefCell::new(None),
                observers: RefCell::new(Vec::new()),
                cache: RefCell::new(Weak::new()),
                gc,
                services,
            }),
        }
    }

    pub(crate) fn set_cache(&self, cache: Weak<QueryCacheInner>) {
        *self.inner.cache.borrow_mut() = cache;
    }

    pub(crate) fn gc(&self) -> &GarbageCollector {
        &self.inner.gc
    }

    /// The query key.
    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// The canonical hash identifying this query in the cache.
    pub fn query_hash(&self) -> &QueryHash {
        &self.inner.hash
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState {
        self.inner.state.borrow().clone()
    }

    /// Metadata from the current options.
    pub fn meta(&self) -> Option<Value> {
        self.inner.options.borrow().meta.clone()
    }

    /// Effective gc time for this entry.
    pub fn gc_time(&self) -> Duration {
        self.inner.gc.gc_time()
    }

    /// Merges new options in: the fetch function and hooks are replaced,
    /// while gc time only ever grows.
    pub(crate) fn set_options(&self, options: QueryOptions) {
        self.inner.gc.update_gc_time(options.gc_time);
        *self.inner.options.borrow_mut() = options;
    }

    pub(crate) fn options(&self) -> QueryOptions {
        self.inner.options.borrow().clone()
    }

    /// Whether the data is stale under the given freshness window: stale if
    /// invalidated, never loaded, or older than the window.
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        let state = self.inner.state.borrow();
        if state.is_invalidated {
            return true;
        }
        match state.data_updated_at {
            Some(updated_at) => time_until_stale(updated_at, stale_time).is_zero(),
            None => true,
        }
    }

    /// Whether the entry is currently stale. Defers to attached observers'
    /// freshness windows; an unobserved entry is stale when invalidated or
    /// empty.
    pub fn is_stale(&self) -> bool {
        let observers = self.inner.observers.borrow();
        if !observers.is_empty() {
            return observers.iter().any(|observer| observer.is_stale());
        }
        let state = self.inner.state.borrow();
        state.is_invalidated || state.data_updated_at.is_none()
    }

    /// Number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.borrow().len()
    }

    pub(crate) fn observers(&self) -> Vec<QueryObserver> {
        self.inner.observers.borrow().clone()
    }

    pub(crate) fn add_observer(&self, observer: &QueryObserver) {
        let mut observers = self.inner.observers.borrow_mut();
        if observers.iter().any(|o| o.id() == observer.id()) {
            return;
        }
        observers.push(observer.clone());
        drop(observers);

        self.inner.gc.cancel();
        self.notify_cache(QueryCacheEvent::ObserverAdded(self.clone()));
    }

    pub(crate) fn remove_observer(&self, observer: &QueryObserver) {
        let mut observers = self.inner.observers.borrow_mut();
        let before = observers.len();
        observers.retain(|o| o.id() != observer.id());
        let removed = observers.len() < before;
        let empty = observers.is_empty();
        drop(observers);

        if !removed {
            return;
        }
        self.notify_cache(QueryCacheEvent::ObserverRemoved(self.clone()));

        if empty {
            let retryer = self.inner.retryer.borrow().clone();
            if let Some(retryer) = retryer {
                let consumed = self
                    .inner
                    .abort_signal
                    .borrow()
                    .as_ref()
                    .map(|signal| signal.is_consumed())
                    .unwrap_or(false);
                if consumed {
                    // The fetcher can stop early; cancel and restore.
                    retryer.cancel(CancelledError {
                        revert: true,
                        silent: false,
                    });
                } else {
                    // Best effort: stop future retries, let the in-flight
                    // attempt land in cache.
                    retryer.cancel_retry();
                }
            }
            self.maybe_schedule_gc();
        }
    }

    /// Marks the entry invalid. Does not itself trigger a refetch.
    pub fn invalidate(&self) {
        if !self.inner.state.borrow().is_invalidated {
            self.dispatch(QueryAction::Invalidate);
        }
    }

    /// Authoritative external state override, used by hydration and tooling.
    pub fn set_state(&self, state: QueryState) {
        self.dispatch(QueryAction::SetState {
            state: Box::new(state),
        });
    }

    /// Cancels the in-flight fetch, if any, and resolves once it settles.
    pub fn cancel(&self, options: CancelledError) -> LocalBoxFuture<'static, ()> {
        let retryer = self.inner.retryer.borrow().clone();
        let promise = self.inner.promise.borrow().clone();
        match retryer {
            Some(retryer) => {
                retryer.cancel(options);
                async move {
                    if let Some(promise) = promise {
                        let _ = promise.await;
                    }
                }
                .boxed_local()
            }
            None => futures::future::ready(()).boxed_local(),
        }
    }

    /// Resumes a paused fetch when focus or connectivity returns.
    pub(crate) fn on_environment_change(&self) {
        let retryer = self.inner.retryer.borrow().clone();
        if let Some(retryer) = retryer {
            if retryer.is_paused() {
                retryer.resume();
            }
        }
    }

    /// Starts a fetch, or coalesces onto the in-flight one.
    ///
    /// Concurrent callers without `cancel_refetch` share a single execution;
    /// with `cancel_refetch` the current attempt is cancelled silently before
    /// a new one starts.
    pub fn fetch(
        &self,
        fetch_options: FetchOptions,
    ) -> LocalBoxFuture<'static, Result<Rc<Value>, QueryError>> {
        if self.inner.state.borrow().fetch_status != FetchStatus::Idle {
            let retryer = self.inner.retryer.borrow().clone();
            if let Some(retryer) = retryer {
                if fetch_options.cancel_refetch {
                    retryer.cancel(CancelledError {
                        revert: false,
                        silent: true,
                    });
                } else if let Some(promise) = self.inner.promise.borrow().clone() {
                    return promise.boxed_local();
                }
            }
        }

        let options = self.options();
        let Some(query_fn) = options.query_fn.clone() else {
            let hash = self.inner.hash.clone();
            error!(query = %hash, "missing query function");
            return async move {
                Err(QueryError::Configuration(format!(
                    "no query function found for {hash}"
                )))
            }
            .boxed_local();
        };

        // Snapshot for reverting cancellations.
        *self.inner.revert_state.borrow_mut() = Some(self.state());

        let signal = AbortSignal::default();
        *self.inner.abort_signal.borrow_mut() = Some(signal.clone());

        let context = QueryFnContext {
            query_key: self.inner.key.clone(),
            meta: options.meta.clone(),
            page_param: None,
            direction: fetch_options.direction,
            signal: signal.clone(),
        };
        let base_query_fn = query_fn.clone();
        let base_context = context.clone();
        let mut fetch_context = FetchContext {
            fetch_fn: Rc::new(move || base_query_fn(base_context.clone())),
            query_fn,
            query_key: self.inner.key.clone(),
            meta: options.meta.clone(),
            state: self.state(),
            direction: fetch_options.direction,
            signal: signal.clone(),
        };
        if let Some(behavior) = options.behavior.clone() {
            behavior.on_fetch(&mut fetch_context);
        }

        let initial_status = if can_fetch(options.network_mode, &self.inner.services) {
            FetchStatus::Fetching
        } else {
            FetchStatus::Paused
        };
        self.dispatch(QueryAction::Fetch {
            meta: fetch_options.meta.clone(),
            fetch_status: initial_status,
        });

        let fetch_fn = fetch_context.fetch_fn.clone();
        let on_fail = {
            let query = self.clone();
            Box::new(move |failure_count: u32, failure: &QueryError| {
                query.dispatch(QueryAction::Failed {
                    failure_count,
                    error: failure.clone(),
                });
            })
        };
        let on_pause = {
            let query = self.clone();
            Box::new(move || {
                if query.inner.state.borrow().fetch_status != FetchStatus::Paused {
                    query.dispatch(QueryAction::Pause);
                }
            })
        };
        let on_continue = {
            let query = self.clone();
            Box::new(move || query.dispatch(QueryAction::Continue))
        };

        let retryer = Retryer::new(
            RetryerConfig {
                attempt: Box::new(move || {
                    let attempt = fetch_fn();
                    async move { attempt.await.map(|value| value.map(Rc::new)) }.boxed_local()
                }),
                retry: options.retry.clone(),
                retry_delay: options.retry_delay.clone(),
                network_mode: options.network_mode,
                can_run: Box::new(|| true),
                on_fail,
                on_pause,
                on_continue,
                services: self.inner.services.clone(),
            },
            {
                let signal = signal.clone();
                move || signal.set_aborted()
            },
        );

        *self.inner.retryer.borrow_mut() = Some(retryer.clone());

        // Settling happens inside the shared future, so every caller that
        // awaits the fetch observes the state update on resume.
        let query = self.clone();
        let raw = retryer.promise();
        let promise: QueryPromise = async move {
            match raw.await {
                Ok(Some(data)) => {
                    query.on_fetch_success(data.clone());
                    Ok(data)
                }
                Ok(None) => {
                    let error = QueryError::UndefinedData {
                        query_hash: query.inner.hash.0.clone(),
                    };
                    query.on_fetch_error(error.clone(), &retryer);
                    Err(error)
                }
                Err(fetch_error) => {
                    query.on_fetch_error(fetch_error.clone(), &retryer);
                    Err(fetch_error)
                }
            }
        }
        .boxed_local()
        .shared();
        *self.inner.promise.borrow_mut() = Some(promise.clone());

        // Drive to completion even when no caller awaits the fetch.
        tokio::task::spawn_local({
            let promise = promise.clone();
            async move {
                let _ = promise.await;
            }
        });

        promise.boxed_local()
    }

    fn on_fetch_success(&self, data: Rc<Value>) {
        self.dispatch(QueryAction::Success {
            data: data.clone(),
            updated_at: None,
            manual: false,
        });
        self.clear_fetch_handles();

        if let Some(cache) = self.cache() {
            cache.config().run_on_success(&data, self);
            cache.config().run_on_settled(self);
        }
        self.maybe_schedule_gc();
    }

    fn on_fetch_error(&self, fetch_error: QueryError, retryer: &Retryer<Option<Rc<Value>>>) {
        match fetch_error.as_cancelled() {
            Some(cancelled) if cancelled.revert => {
                debug!(query = %self.inner.hash, "fetch cancelled, reverting");
                if let Some(revert_state) = self.inner.revert_state.borrow_mut().take() {
                    self.set_state(revert_state);
                }
            }
            Some(cancelled) if cancelled.silent => {
                // Replaced by a newer fetch; nothing to record.
            }
            _ => {
                self.dispatch(QueryAction::Error {
                    error: fetch_error.clone(),
                });
            }
        }

        // The retryer this driver belongs to may already have been replaced
        // by a cancel_refetch; only clear our own handles.
        let is_current = self
            .inner
            .retryer
            .borrow()
            .as_ref()
            .map(|current| Rc::ptr_eq(&current.state_rc(), &retryer.state_rc()))
            .unwrap_or(false);
        if is_current {
            self.clear_fetch_handles();
        }

        if !fetch_error.is_cancelled() {
            if let Some(cache) = self.cache() {
                cache.config().run_on_error(&fetch_error, self);
                cache.config().run_on_settled(self);
            }
        }
        self.maybe_schedule_gc();
    }

    fn clear_fetch_handles(&self) {
        *self.inner.retryer.borrow_mut() = None;
        *self.inner.promise.borrow_mut() = None;
        *self.inner.abort_signal.borrow_mut() = None;
        *self.inner.revert_state.borrow_mut() = None;
    }

    fn maybe_schedule_gc(&self) {
        let idle = self.inner.state.borrow().fetch_status == FetchStatus::Idle;
        if self.inner.observers.borrow().is_empty() && idle {
            self.inner.gc.schedule();
        }
    }

    pub(crate) fn dispatch(&self, action: QueryAction) {
        let next = {
            let state = self.inner.state.borrow();
            reduce(&state, action)
        };
        *self.inner.state.borrow_mut() = next;

        let observers = self.observers();
        self.inner.services.notify.batch(|| {
            for observer in &observers {
                observer.on_query_update();
            }
            self.notify_cache(QueryCacheEvent::Updated(self.clone()));
        });
    }

    /// Applies a successful value directly, as a manual cache write: fetch
    /// bookkeeping of any in-flight execution is left untouched.
    pub fn set_data(&self, data: Value, updated_at: Option<Instant>) -> Rc<Value> {
        let data = Rc::new(data);
        self.dispatch(QueryAction::Success {
            data: data.clone(),
            updated_at,
            manual: true,
        });
        data
    }

    fn cache(&self) -> Option<QueryCache> {
        self.inner.cache.borrow().upgrade().map(QueryCache::from_inner)
    }

    fn notify_cache(&self, event: QueryCacheEvent) {
        if let Some(cache) = self.cache() {
            cache.notify(event);
        }
    }
}

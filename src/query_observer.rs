use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    rc::Rc,
    sync::atomic::{AtomicU32, Ordering},
};

use futures::future::LocalBoxFuture;
use serde_json::Value;
use slotmap::{new_key_type, SlotMap};
use tracing::debug;

use crate::{
    query::Query,
    query_result::{changed_fields, default_result, ResultField},
    timeout::TimeoutHandle,
    util::{replace_equal_deep, time_until_stale},
    FetchOptions, NotifyOnChangeProps, QueryCache, QueryError, QueryKey, QueryObserverOptions,
    QueryObserverResult, QueryStatus, Services, TrackedResult,
};

static NEXT_OBSERVER_ID: AtomicU32 = AtomicU32::new(0);

/// Identity of one observer, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u32);

new_key_type! {
    /// Key identifying one observer result listener.
    pub struct ObserverListenerKey;
}

type ObserverListener = Rc<dyn Fn(&TrackedResult)>;

/// A subscription to one query.
///
/// The observer derives a per-subscriber [`QueryObserverResult`] from the
/// shared cache entry (placeholder data, select projection, freshness
/// window) and notifies its listeners when properties they use change. The
/// first listener attaches the observer to the query and may trigger a
/// fetch; the last listener detaching releases the query toward gc.
///
/// ```
/// # use async_query::*;
/// # use serde_json::json;
/// # use futures::FutureExt;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
/// #     .block_on(tokio::task::LocalSet::new().run_until(async {
/// let client = QueryClient::new(Services::new(), Default::default());
/// let options = QueryObserverOptions::default()
///     .set_query_fn(std::rc::Rc::new(|_cx| async { Ok(Some(json!(42))) }.boxed_local()));
/// let observer = QueryObserver::new(client.cache().clone(), QueryKey::new(("answer",)), options);
/// let key = observer.subscribe(|_result| {});
/// let result = observer.refetch().await.unwrap();
/// assert_eq!(*result, json!(42));
/// observer.unsubscribe(key);
/// # }));
/// ```
#[derive(Clone)]
pub struct QueryObserver {
    inner: Rc<ObserverInner>,
}

struct ObserverInner {
    id: ObserverId,
    cache: QueryCache,
    options: RefCell<QueryObserverOptions>,
    query: RefCell<Query>,
    result: RefCell<QueryObserverResult>,
    select_memo: RefCell<Option<SelectMemo>>,
    tracked: Rc<RefCell<HashSet<ResultField>>>,
    listeners: RefCell<SlotMap<ObserverListenerKey, ObserverListener>>,
    stale_timeout: Cell<Option<TimeoutHandle>>,
    refetch_timer: Cell<Option<TimeoutHandle>>,
    services: Services,
}

/// Select projections rerun only when the raw data allocation changes.
struct SelectMemo {
    input: Rc<Value>,
    output: Rc<Value>,
}

impl QueryObserver {
    /// Creates an observer for `key`. Builds the cache entry immediately but
    /// attaches to it only once the first listener subscribes.
    pub fn new(cache: QueryCache, key: QueryKey, options: QueryObserverOptions) -> Self {
        let services = cache.services().clone();
        let query = cache.build_query(key, options.query.clone());
        let observer = Self {
            inner: Rc::new(ObserverInner {
                id: ObserverId(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed)),
                cache,
                options: RefCell::new(options),
                query: RefCell::new(query),
                result: RefCell::new(default_result()),
                select_memo: RefCell::new(None),
                tracked: Rc::new(RefCell::new(HashSet::new())),
                listeners: RefCell::new(SlotMap::with_key()),
                stale_timeout: Cell::new(None),
                refetch_timer: Cell::new(None),
                services,
            }),
        };
        observer.update_result(false);
        observer
    }

    /// The observer's unique id.
    pub fn id(&self) -> ObserverId {
        self.inner.id
    }

    /// The query this observer currently watches.
    pub fn query(&self) -> Query {
        self.inner.query.borrow().clone()
    }

    /// The current derived result, with access tracking.
    pub fn current_result(&self) -> TrackedResult {
        TrackedResult::new(
            self.inner.result.borrow().clone(),
            self.inner.tracked.clone(),
        )
    }

    /// Registers a result listener. The first listener attaches the observer
    /// to the query and applies the subscribe-refetch policy.
    pub fn subscribe(&self, listener: impl Fn(&TrackedResult) + 'static) -> ObserverListenerKey {
        let first = self.inner.listeners.borrow().is_empty();
        let key = self.inner.listeners.borrow_mut().insert(Rc::new(listener));
        if first {
            self.attach();
        }
        key
    }

    /// Removes a listener. The last listener detaches the observer from the
    /// query.
    pub fn unsubscribe(&self, key: ObserverListenerKey) {
        let mut listeners = self.inner.listeners.borrow_mut();
        if listeners.remove(key).is_none() {
            return;
        }
        let empty = listeners.is_empty();
        drop(listeners);
        if empty {
            self.detach();
        }
    }

    /// Replaces the observer's options, retargeting it if the key changed.
    pub fn set_options(&self, key: QueryKey, options: QueryObserverOptions) {
        let attached = !self.inner.listeners.borrow().is_empty();
        let query = self.inner.cache.build_query(key, options.query.clone());
        let previous = self.inner.query.borrow().clone();
        *self.inner.options.borrow_mut() = options;
        // The memoized projection may have come from a different select
        // function; recompute from scratch.
        *self.inner.select_memo.borrow_mut() = None;

        if query != previous {
            debug!(
                from = %previous.query_hash(),
                to = %query.query_hash(),
                "observer retargeted"
            );
            *self.inner.query.borrow_mut() = query.clone();
            if attached {
                previous.remove_observer(self);
                query.add_observer(self);
                if self.should_fetch_on_subscribe(&query) {
                    self.execute_fetch();
                }
            }
        }
        self.update_result(true);
        if attached {
            self.update_timers();
        }
    }

    /// Fetches the watched query, coalescing with any in-flight fetch.
    pub fn refetch(&self) -> LocalBoxFuture<'static, Result<Rc<Value>, QueryError>> {
        self.query().fetch(FetchOptions::default())
    }

    /// Whether the watched data is stale under this observer's freshness
    /// window.
    pub fn is_stale(&self) -> bool {
        let stale_time = self.inner.options.borrow().stale_time;
        self.query().is_stale_by_time(stale_time)
    }

    /// Focus regained: refetch per policy.
    pub(crate) fn on_focus(&self) {
        let options = self.inner.options.borrow();
        let policy = options.refetch_on_focus;
        let enabled = options.enabled;
        drop(options);
        if enabled && policy.should_refetch(self.is_stale()) {
            self.execute_fetch();
        }
    }

    /// Connectivity regained: refetch per policy.
    pub(crate) fn on_reconnect(&self) {
        let options = self.inner.options.borrow();
        let policy = options.refetch_on_reconnect;
        let enabled = options.enabled;
        drop(options);
        if enabled && policy.should_refetch(self.is_stale()) {
            self.execute_fetch();
        }
    }

    fn attach(&self) {
        let query = self.query();
        query.add_observer(self);
        if self.should_fetch_on_subscribe(&query) {
            self.execute_fetch();
        } else {
            self.update_result(false);
        }
        self.update_timers();
    }

    fn detach(&self) {
        self.clear_timers();
        self.query().remove_observer(self);
    }

    fn should_fetch_on_subscribe(&self, query: &Query) -> bool {
        let options = self.inner.options.borrow();
        if !options.enabled || options.query.query_fn.is_none() {
            return false;
        }
        if !query.state().has_data() {
            return true;
        }
        options
            .refetch_on_subscribe
            .should_refetch(query.is_stale_by_time(options.stale_time))
    }

    fn execute_fetch(&self) {
        let fetch = self.query().fetch(FetchOptions::default());
        tokio::task::spawn_local(async move {
            let _ = fetch.await;
        });
    }

    /// Recomputes the derived result; state changes reach us here via
    /// [`Query::dispatch`](crate::Query).
    pub(crate) fn on_query_update(&self) {
        self.update_result(true);
        self.update_timers();
    }

    fn update_result(&self, notify: bool) {
        let next = self.compute_result();
        let previous = self.inner.result.replace(next.clone());
        if !notify {
            return;
        }
        let changed = changed_fields(&previous, &next);
        if changed.is_empty() || !self.should_notify(&changed) {
            return;
        }

        let listeners: Vec<ObserverListener> =
            self.inner.listeners.borrow().values().cloned().collect();
        let tracked = self.inner.tracked.clone();
        self.inner.services.notify.batch(|| {
            for listener in listeners {
                let result = TrackedResult::new(next.clone(), tracked.clone());
                self.inner
                    .services
                    .notify
                    .schedule(move || listener(&result));
            }
        });
    }

    fn should_notify(&self, changed: &HashSet<ResultField>) -> bool {
        match &self.inner.options.borrow().notify_on_change_props {
            NotifyOnChangeProps::All => true,
            NotifyOnChangeProps::List(fields) => fields.iter().any(|field| changed.contains(field)),
            NotifyOnChangeProps::Tracked => {
                let tracked = self.inner.tracked.borrow();
                // Nothing read yet means the listener's interests are
                // unknown; notify rather than starve it.
                tracked.is_empty() || changed.iter().any(|field| tracked.contains(field))
            }
        }
    }

    fn compute_result(&self) -> QueryObserverResult {
        let query = self.query();
        let state = query.state();
        let options = self.inner.options.borrow();

        let mut data = state.data.clone();
        let mut status = state.status;
        let mut is_placeholder_data = false;

        if let Some(raw) = data.clone() {
            if let Some(select) = &options.select {
                let mut memo = self.inner.select_memo.borrow_mut();
                let reused = memo
                    .as_ref()
                    .filter(|memo| Rc::ptr_eq(&memo.input, &raw))
                    .map(|memo| memo.output.clone());
                let selected = match reused {
                    Some(output) => output,
                    None => {
                        let output = Rc::new(select(&raw));
                        *memo = Some(SelectMemo {
                            input: raw.clone(),
                            output: output.clone(),
                        });
                        output
                    }
                };
                data = Some(selected);
            }
        } else if status == QueryStatus::Pending {
            if let Some(placeholder) = options.placeholder_data.clone() {
                data = Some(placeholder);
                status = QueryStatus::Success;
                is_placeholder_data = true;
            }
        }

        // Keep the previous allocation when the value is unchanged, so
        // downstream pointer comparisons stay cheap.
        if let (Some(previous), Some(next)) = (self.inner.result.borrow().data.clone(), data.clone())
        {
            data = Some(replace_equal_deep(&previous, next));
        }

        QueryObserverResult {
            data,
            error: state.error.clone(),
            status,
            fetch_status: state.fetch_status,
            data_updated_at: state.data_updated_at,
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
            failure_reason: state.fetch_failure_reason.clone(),
            is_stale: is_placeholder_data || query.is_stale_by_time(options.stale_time),
            is_placeholder_data,
        }
    }

    fn update_timers(&self) {
        self.clear_timers();
        let options = self.inner.options.borrow().clone();

        // Re-derive the result when fresh data crosses into staleness, so
        // listeners tracking `is_stale` see the flip.
        if !options.stale_time.is_zero() {
            let state = self.query().state();
            if let Some(updated_at) = state.data_updated_at {
                let remaining = time_until_stale(updated_at, options.stale_time);
                if !remaining.is_zero() {
                    let observer = self.clone();
                    let handle = self.inner.services.timers.set_timeout(
                        move || observer.update_result(true),
                        remaining + std::time::Duration::from_millis(1),
                    );
                    self.inner.stale_timeout.set(Some(handle));
                }
            }
        }

        if let Some(interval) = options.refetch_interval {
            if options.enabled {
                let observer = self.clone();
                let handle = self.inner.services.timers.set_interval(
                    move || {
                        let focused = observer.inner.services.focus.is_focused();
                        if focused || observer.inner.options.borrow().refetch_interval_in_background
                        {
                            observer.execute_fetch();
                        }
                    },
                    interval,
                );
                self.inner.refetch_timer.set(Some(handle));
            }
        }
    }

    fn clear_timers(&self) {
        if let Some(handle) = self.inner.stale_timeout.take() {
            handle.clear();
        }
        if let Some(handle) = self.inner.refetch_timer.take() {
            handle.clear();
        }
    }
}

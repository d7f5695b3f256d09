use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use futures::{future::LocalBoxFuture, FutureExt};
use serde_json::Value;
use tracing::debug;

use crate::{
    environment::SignalListenerKey, CancelledError, DefaultOptions, FetchOptions, FetchStatus,
    Instant, MutationCache, MutationCacheConfig, MutationFilters, MutationOptions, MutationStatus,
    QueryCache, QueryCacheConfig, QueryError, QueryFilters, QueryKey, QueryOptions, QueryState,
    Services,
};

/// The top-level handle tying the caches, environment signals and defaults
/// together.
///
/// Cheap to clone; all clones share the same caches.
///
/// ```
/// # use async_query::*;
/// # use serde_json::json;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
/// #     .block_on(tokio::task::LocalSet::new().run_until(async {
/// let client = QueryClient::new(Services::new(), Default::default());
/// client.set_query_data(QueryKey::new(("todos", 1)), json!({"title": "write docs"}), None);
/// let data = client.get_query_data(&QueryKey::new(("todos", 1))).unwrap();
/// assert_eq!(data["title"], "write docs");
/// # }));
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Rc<ClientInner>,
}

struct ClientInner {
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    default_options: RefCell<DefaultOptions>,
    mutation_defaults: RefCell<Vec<(QueryKey, MutationOptions)>>,
    services: Services,
    mount_count: Cell<u32>,
    focus_key: Cell<Option<SignalListenerKey>>,
    online_key: Cell<Option<SignalListenerKey>>,
}

impl QueryClient {
    /// Creates a client with fresh, empty caches.
    pub fn new(services: Services, default_options: DefaultOptions) -> Self {
        Self::with_caches(
            QueryCache::new(QueryCacheConfig::default(), services.clone()),
            MutationCache::new(MutationCacheConfig::default(), services.clone()),
            services,
            default_options,
        )
    }

    /// Creates a client over caches built elsewhere, e.g. with cache-level
    /// lifecycle hooks.
    pub fn with_caches(
        query_cache: QueryCache,
        mutation_cache: MutationCache,
        services: Services,
        default_options: DefaultOptions,
    ) -> Self {
        Self {
            inner: Rc::new(ClientInner {
                query_cache,
                mutation_cache,
                default_options: RefCell::new(default_options),
                mutation_defaults: RefCell::new(Vec::new()),
                services,
                mount_count: Cell::new(0),
                focus_key: Cell::new(None),
                online_key: Cell::new(None),
            }),
        }
    }

    /// The query cache.
    pub fn cache(&self) -> &QueryCache {
        &self.inner.query_cache
    }

    /// The mutation cache.
    pub fn mutation_cache(&self) -> &MutationCache {
        &self.inner.mutation_cache
    }

    /// The ambient services this client was built with.
    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    /// Seed options for new query observers, from the client defaults.
    pub fn observer_options(&self) -> crate::QueryObserverOptions {
        self.inner.default_options.borrow().query.clone()
    }

    /// Seed options for new mutations, from the client defaults.
    pub fn mutation_options(&self) -> MutationOptions {
        let defaults = self.inner.default_options.borrow();
        MutationOptions {
            retry: defaults.mutation_retry.clone(),
            retry_delay: defaults.mutation_retry_delay.clone(),
            network_mode: defaults.mutation_network_mode,
            ..MutationOptions::default()
        }
    }

    /// Replaces the client defaults.
    pub fn set_default_options(&self, default_options: DefaultOptions) {
        *self.inner.default_options.borrow_mut() = default_options;
    }

    /// Registers default options for mutations whose key starts with `key`.
    /// Hydrated mutations find their function through these defaults.
    pub fn set_mutation_defaults(&self, key: QueryKey, options: MutationOptions) {
        let mut defaults = self.inner.mutation_defaults.borrow_mut();
        if let Some(entry) = defaults.iter_mut().find(|(existing, _)| existing == &key) {
            entry.1 = options;
        } else {
            defaults.push((key, options));
        }
    }

    /// The registered defaults matching `key`, if any.
    pub fn mutation_defaults(&self, key: Option<&QueryKey>) -> Option<MutationOptions> {
        let key = key?;
        self.inner
            .mutation_defaults
            .borrow()
            .iter()
            .find(|(prefix, _)| prefix.is_prefix_of(key))
            .map(|(_, options)| options.clone())
    }

    /// Connects the client to the focus and online signals. Reference
    /// counted; pair every `mount` with an [`unmount`](Self::unmount).
    pub fn mount(&self) {
        let count = self.inner.mount_count.get();
        self.inner.mount_count.set(count + 1);
        if count > 0 {
            return;
        }

        let focus_client = self.clone();
        let focus_key = self.inner.services.focus.subscribe(move |focused| {
            if focused {
                focus_client.on_focus();
            }
        });
        self.inner.focus_key.set(Some(focus_key));

        let online_client = self.clone();
        let online_key = self.inner.services.online.subscribe(move |online| {
            if online {
                online_client.on_reconnect();
            }
        });
        self.inner.online_key.set(Some(online_key));
    }

    /// Releases one mount. The last unmount detaches the signal listeners.
    pub fn unmount(&self) {
        let count = self.inner.mount_count.get();
        if count == 0 {
            return;
        }
        self.inner.mount_count.set(count - 1);
        if count > 1 {
            return;
        }
        if let Some(key) = self.inner.focus_key.take() {
            self.inner.services.focus.unsubscribe(key);
        }
        if let Some(key) = self.inner.online_key.take() {
            self.inner.services.online.unsubscribe(key);
        }
    }

    fn on_focus(&self) {
        debug!("focus regained");
        self.inner.services.notify.batch(|| {
            self.inner.query_cache.on_environment_change();
            self.inner.mutation_cache.on_environment_change();
            for query in self.inner.query_cache.get_all() {
                for observer in query.observers() {
                    observer.on_focus();
                }
            }
        });
    }

    fn on_reconnect(&self) {
        debug!("connectivity regained");
        self.inner.services.notify.batch(|| {
            self.inner.query_cache.on_environment_change();
            self.inner.mutation_cache.on_environment_change();
            for query in self.inner.query_cache.get_all() {
                for observer in query.observers() {
                    observer.on_reconnect();
                }
            }
        });
    }

    /// Fetches `key`, returning cached data outright when it is fresh under
    /// `stale_time`.
    pub fn fetch_query(
        &self,
        key: QueryKey,
        options: QueryOptions,
        stale_time: Duration,
    ) -> LocalBoxFuture<'static, Result<Rc<Value>, QueryError>> {
        let query = self.inner.query_cache.build_query(key, options);
        if !query.is_stale_by_time(stale_time) {
            if let Some(data) = query.state().data {
                return futures::future::ready(Ok(data)).boxed_local();
            }
        }
        query.fetch(FetchOptions::default())
    }

    /// Like [`fetch_query`](Self::fetch_query) but swallows the outcome;
    /// failures surface only through the cache entry.
    pub fn prefetch_query(
        &self,
        key: QueryKey,
        options: QueryOptions,
        stale_time: Duration,
    ) -> LocalBoxFuture<'static, ()> {
        let fetch = self.fetch_query(key, options, stale_time);
        async move {
            let _ = fetch.await;
        }
        .boxed_local()
    }

    /// Cached data for `key`, if present.
    pub fn get_query_data(&self, key: &QueryKey) -> Option<Rc<Value>> {
        self.inner.query_cache.find(key)?.state().data
    }

    /// Full cached state for `key`, if present.
    pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState> {
        Some(self.inner.query_cache.find(key)?.state())
    }

    /// Writes `data` for `key` directly, creating the entry if needed.
    pub fn set_query_data(
        &self,
        key: QueryKey,
        data: Value,
        updated_at: Option<Instant>,
    ) -> Rc<Value> {
        let query = self
            .inner
            .query_cache
            .build_query(key, QueryOptions::default());
        query.set_data(data, updated_at)
    }

    /// Marks matching queries stale and refetches the observed ones.
    /// Resolves when the refetches settle.
    pub fn invalidate_queries(&self, filters: &QueryFilters) -> LocalBoxFuture<'static, ()> {
        let queries = self.inner.query_cache.find_all(filters);
        self.inner.services.notify.batch(|| {
            for query in &queries {
                query.invalidate();
            }
        });

        let refetches: Vec<_> = queries
            .iter()
            .filter(|query| query.observer_count() > 0)
            .map(|query| {
                query.fetch(FetchOptions {
                    cancel_refetch: true,
                    ..FetchOptions::default()
                })
            })
            .collect();
        async move {
            let _ = futures::future::join_all(refetches).await;
        }
        .boxed_local()
    }

    /// Refetches every matching query, replacing in-flight fetches.
    pub fn refetch_queries(&self, filters: &QueryFilters) -> LocalBoxFuture<'static, ()> {
        let refetches: Vec<_> = self
            .inner
            .query_cache
            .find_all(filters)
            .iter()
            .map(|query| {
                query.fetch(FetchOptions {
                    cancel_refetch: true,
                    ..FetchOptions::default()
                })
            })
            .collect();
        async move {
            let _ = futures::future::join_all(refetches).await;
        }
        .boxed_local()
    }

    /// Cancels in-flight fetches of matching queries, reverting their state
    /// to the pre-fetch snapshot.
    pub fn cancel_queries(&self, filters: &QueryFilters) -> LocalBoxFuture<'static, ()> {
        let cancellations: Vec<_> = self
            .inner
            .query_cache
            .find_all(filters)
            .iter()
            .map(|query| {
                query.cancel(CancelledError {
                    revert: true,
                    silent: false,
                })
            })
            .collect();
        async move {
            futures::future::join_all(cancellations).await;
        }
        .boxed_local()
    }

    /// Drops matching queries from the cache immediately.
    pub fn remove_queries(&self, filters: &QueryFilters) {
        let queries = self.inner.query_cache.find_all(filters);
        self.inner.services.notify.batch(|| {
            for query in queries {
                self.inner.query_cache.remove(&query);
            }
        });
    }

    /// Number of matching queries with a fetch in flight.
    pub fn is_fetching(&self, filters: &QueryFilters) -> usize {
        let filters = QueryFilters {
            fetch_status: Some(FetchStatus::Fetching),
            ..filters.clone()
        };
        self.inner.query_cache.find_all(&filters).len()
    }

    /// Number of mutations currently executing or queued.
    pub fn is_mutating(&self) -> usize {
        self.inner
            .mutation_cache
            .find_all(&MutationFilters {
                status: Some(MutationStatus::Pending),
                ..MutationFilters::default()
            })
            .len()
    }

    /// Resumes every paused mutation, oldest first.
    pub fn resume_paused_mutations(&self) -> LocalBoxFuture<'static, ()> {
        self.inner.mutation_cache.resume_paused_mutations()
    }

    /// Empties both caches.
    pub fn clear(&self) {
        self.inner.services.notify.batch(|| {
            self.inner.query_cache.clear();
            self.inner.mutation_cache.clear();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::cell::Cell;

    fn client() -> QueryClient {
        QueryClient::new(Services::new(), DefaultOptions::default())
    }

    fn counting_options(counter: Rc<Cell<u32>>, value: Value) -> QueryOptions {
        QueryOptions {
            query_fn: Some(Rc::new(move |_context| {
                counter.set(counter.get() + 1);
                let value = value.clone();
                async move { Ok(Some(value)) }.boxed_local()
            })),
            ..QueryOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_query_returns_fresh_data_without_fetching() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = client();
                let calls = Rc::new(Cell::new(0u32));
                let key = QueryKey::new(("user", 1));
                client.set_query_data(key.clone(), json!({"name": "ada"}), None);

                let data = client
                    .fetch_query(
                        key.clone(),
                        counting_options(calls.clone(), json!({"name": "fetched"})),
                        Duration::from_secs(60),
                    )
                    .await
                    .unwrap();

                assert_eq!(*data, json!({"name": "ada"}));
                assert_eq!(calls.get(), 0);

                // Zero stale time means the cached copy never satisfies.
                let data = client
                    .fetch_query(
                        key,
                        counting_options(calls.clone(), json!({"name": "fetched"})),
                        Duration::ZERO,
                    )
                    .await
                    .unwrap();
                assert_eq!(*data, json!({"name": "fetched"}));
                assert_eq!(calls.get(), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_swallows_errors() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = client();
                let options = QueryOptions {
                    query_fn: Some(Rc::new(|_context| {
                        async { Err(QueryError::fetch("down")) }.boxed_local()
                    })),
                    retry: crate::RetryPolicy::Never,
                    ..QueryOptions::default()
                };
                let key = QueryKey::new(("broken",));
                client
                    .prefetch_query(key.clone(), options, Duration::ZERO)
                    .await;

                let state = client.get_query_state(&key).unwrap();
                assert_eq!(state.error, Some(QueryError::fetch("down")));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_refetches_observed_queries() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = client();
                let calls = Rc::new(Cell::new(0u32));
                let key = QueryKey::new(("watched",));

                let observer_options = crate::QueryObserverOptions {
                    query: counting_options(calls.clone(), json!("v1")),
                    ..crate::QueryObserverOptions::default()
                };
                let observer = crate::QueryObserver::new(
                    client.cache().clone(),
                    key.clone(),
                    observer_options,
                );
                let sub = observer.subscribe(|_| {});
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                assert_eq!(calls.get(), 1);

                client
                    .invalidate_queries(&QueryFilters::exact(key.clone()))
                    .await;
                assert_eq!(calls.get(), 2);
                assert!(!client.get_query_state(&key).unwrap().is_invalidated);

                observer.unsubscribe(sub);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_queries_reverts_to_the_snapshot() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = client();
                let key = QueryKey::new(("slow",));
                client.set_query_data(key.clone(), json!("old"), None);

                let options = QueryOptions {
                    query_fn: Some(Rc::new(|_context| {
                        async {
                            futures::future::pending::<()>().await;
                            unreachable!()
                        }
                        .boxed_local()
                    })),
                    ..QueryOptions::default()
                };
                let query = client.cache().build_query(key.clone(), options);
                let fetch = query.fetch(FetchOptions::default());
                tokio::task::spawn_local(async move {
                    let _ = fetch.await;
                });
                tokio::task::yield_now().await;
                assert_eq!(client.is_fetching(&QueryFilters::default()), 1);

                client.cancel_queries(&QueryFilters::exact(key.clone())).await;

                let state = client.get_query_state(&key).unwrap();
                assert_eq!(state.fetch_status, FetchStatus::Idle);
                assert_eq!(*state.data.unwrap(), json!("old"));
                assert_eq!(client.is_fetching(&QueryFilters::default()), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn focus_triggers_stale_refetch_for_subscribed_observers() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let services = Services::new();
                let client = QueryClient::new(services.clone(), DefaultOptions::default());
                client.mount();

                let calls = Rc::new(Cell::new(0u32));
                let observer_options = crate::QueryObserverOptions {
                    query: counting_options(calls.clone(), json!(1)),
                    ..crate::QueryObserverOptions::default()
                };
                let observer = crate::QueryObserver::new(
                    client.cache().clone(),
                    QueryKey::new(("focusable",)),
                    observer_options,
                );
                let sub = observer.subscribe(|_| {});
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                assert_eq!(calls.get(), 1);

                services.focus.set_focused(false);
                services.focus.set_focused(true);
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                // Default stale time is zero, so the data counts as stale.
                assert_eq!(calls.get(), 2);

                observer.unsubscribe(sub);
                client.unmount();
            })
            .await;
    }

    #[test]
    fn remove_queries_and_clear() {
        let client = client();
        client.set_query_data(QueryKey::new(("a",)), json!(1), None);
        client.set_query_data(QueryKey::new(("b",)), json!(2), None);
        assert_eq!(client.cache().len(), 2);

        client.remove_queries(&QueryFilters::exact(QueryKey::new(("a",))));
        assert_eq!(client.cache().len(), 1);

        client.clear();
        assert!(client.cache().is_empty());
    }
}

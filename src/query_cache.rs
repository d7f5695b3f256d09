use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use serde_json::Value;
use slotmap::{new_key_type, SlotMap};
use tracing::debug;

use crate::{
    query::Query, FetchStatus, QueryError, QueryHash, QueryKey, QueryOptions, Services,
};

new_key_type! {
    /// Key identifying one cache event listener.
    pub struct CacheListenerKey;
}

/// Events emitted by a [`QueryCache`] to its subscribers.
#[derive(Clone)]
pub enum QueryCacheEvent {
    /// A query was inserted into the cache.
    Added(Query),
    /// A query was removed from the cache.
    Removed(Query),
    /// A query's state changed.
    Updated(Query),
    /// An observer attached to a query.
    ObserverAdded(Query),
    /// An observer detached from a query.
    ObserverRemoved(Query),
}

impl QueryCacheEvent {
    /// The query the event concerns.
    pub fn query(&self) -> &Query {
        match self {
            QueryCacheEvent::Added(query)
            | QueryCacheEvent::Removed(query)
            | QueryCacheEvent::Updated(query)
            | QueryCacheEvent::ObserverAdded(query)
            | QueryCacheEvent::ObserverRemoved(query) => query,
        }
    }
}

type CacheListener = Rc<dyn Fn(&QueryCacheEvent)>;

/// Cache-wide lifecycle hooks, fired for every query in the cache.
#[derive(Clone, Default)]
pub struct QueryCacheConfig {
    /// Called after any query fetch succeeds.
    pub on_success: Option<Rc<dyn Fn(&Value, &Query)>>,
    /// Called after any query fetch fails (cancellations excluded).
    pub on_error: Option<Rc<dyn Fn(&QueryError, &Query)>>,
    /// Called after any query fetch settles, following the specific hook.
    pub on_settled: Option<Rc<dyn Fn(&Query)>>,
}

impl QueryCacheConfig {
    pub(crate) fn run_on_success(&self, data: &Value, query: &Query) {
        if let Some(on_success) = &self.on_success {
            on_success(data, query);
        }
    }

    pub(crate) fn run_on_error(&self, error: &QueryError, query: &Query) {
        if let Some(on_error) = &self.on_error {
            on_error(error, query);
        }
    }

    pub(crate) fn run_on_settled(&self, query: &Query) {
        if let Some(on_settled) = &self.on_settled {
            on_settled(query);
        }
    }
}

/// Criteria for matching queries in bulk operations.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Match by key. A prefix matches unless `exact` is set.
    pub query_key: Option<QueryKey>,
    /// Require the full key to match, not just a prefix.
    pub exact: bool,
    /// Match by current fetch status.
    pub fetch_status: Option<FetchStatus>,
    /// Match by staleness.
    pub stale: Option<bool>,
    /// Arbitrary predicate, combined with the other criteria.
    pub predicate: Option<Rc<dyn Fn(&Query) -> bool>>,
}

impl QueryFilters {
    /// Filter on an exact key.
    pub fn exact(query_key: QueryKey) -> Self {
        Self {
            query_key: Some(query_key),
            exact: true,
            ..Self::default()
        }
    }

    /// Filter on a key prefix.
    pub fn prefix(query_key: QueryKey) -> Self {
        Self {
            query_key: Some(query_key),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, query: &Query) -> bool {
        if let Some(key) = &self.query_key {
            if self.exact {
                if query.query_hash() != &key.hash() {
                    return false;
                }
            } else if !key.is_prefix_of(query.key()) {
                return false;
            }
        }
        if let Some(fetch_status) = self.fetch_status {
            if query.state().fetch_status != fetch_status {
                return false;
            }
        }
        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(query) {
                return false;
            }
        }
        true
    }
}

/// Holds every active [`Query`], keyed by canonical hash.
///
/// One logical key maps to at most one entry; all consumers of the same key
/// share it. The cache owns entry lifecycle (insert, update events, gc
/// eviction) and fans out [`QueryCacheEvent`]s to subscribers.
#[derive(Clone)]
pub struct QueryCache {
    inner: Rc<QueryCacheInner>,
}

pub(crate) struct QueryCacheInner {
    queries: RefCell<HashMap<QueryHash, Query>>,
    listeners: RefCell<SlotMap<CacheListenerKey, CacheListener>>,
    config: QueryCacheConfig,
    services: Services,
}

impl QueryCache {
    /// Creates an empty cache.
    pub fn new(config: QueryCacheConfig, services: Services) -> Self {
        Self {
            inner: Rc::new(QueryCacheInner {
                queries: RefCell::new(HashMap::new()),
                listeners: RefCell::new(SlotMap::with_key()),
                config,
                services,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<QueryCacheInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn config(&self) -> &QueryCacheConfig {
        &self.inner.config
    }

    pub(crate) fn services(&self) -> &Services {
        &self.inner.services
    }

    /// Returns the entry for `key`, creating it if absent, and applies
    /// `options` to it.
    pub fn build_query(&self, key: QueryKey, options: QueryOptions) -> Query {
        let hash = key.hash();
        if let Some(existing) = self.get(&hash) {
            existing.set_options(options);
            return existing;
        }

        let query = Query::new(key, hash.clone(), self.inner.services.clone());
        query.set_options(options);
        query.set_cache(Rc::downgrade(&self.inner));

        // Eviction re-checks liveness: an observer may have re-attached
        // between scheduling and firing.
        let cache = Rc::downgrade(&self.inner);
        let gc_hash = hash.clone();
        query.gc().set_on_elapsed(move || {
            if let Some(cache) = cache.upgrade() {
                QueryCache::from_inner(cache).remove_if_unused(&gc_hash);
            }
        });

        debug!(query = %hash, "query added");
        self.inner
            .queries
            .borrow_mut()
            .insert(hash, query.clone());
        self.notify(QueryCacheEvent::Added(query.clone()));
        query
    }

    /// Looks up an entry by hash.
    pub fn get(&self, hash: &QueryHash) -> Option<Query> {
        self.inner.queries.borrow().get(hash).cloned()
    }

    /// Looks up an entry by key.
    pub fn find(&self, key: &QueryKey) -> Option<Query> {
        self.get(&key.hash())
    }

    /// All entries matching `filters`.
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Query> {
        self.inner
            .queries
            .borrow()
            .values()
            .filter(|query| filters.matches(query))
            .cloned()
            .collect()
    }

    /// Every entry in the cache.
    pub fn get_all(&self) -> Vec<Query> {
        self.inner.queries.borrow().values().cloned().collect()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.queries.borrow().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.queries.borrow().is_empty()
    }

    /// Removes an entry outright, cancelling any in-flight fetch silently.
    pub fn remove(&self, query: &Query) {
        let removed = self
            .inner
            .queries
            .borrow_mut()
            .remove(query.query_hash())
            .is_some();
        if removed {
            query.gc().cancel();
            let _ = query.cancel(crate::CancelledError {
                revert: false,
                silent: true,
            });
            debug!(query = %query.query_hash(), "query removed");
            self.notify(QueryCacheEvent::Removed(query.clone()));
        }
    }

    /// Gc eviction target: removes only if still unobserved and idle.
    pub(crate) fn remove_if_unused(&self, hash: &QueryHash) {
        if let Some(query) = self.get(hash) {
            if query.observer_count() == 0 && query.state().fetch_status == FetchStatus::Idle {
                self.remove(&query);
            }
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let queries = self.get_all();
        self.inner.services.notify.batch(|| {
            for query in queries {
                self.remove(&query);
            }
        });
    }

    /// Registers a cache event listener.
    pub fn subscribe(&self, listener: impl Fn(&QueryCacheEvent) + 'static) -> CacheListenerKey {
        self.inner.listeners.borrow_mut().insert(Rc::new(listener))
    }

    /// Removes a previously registered listener.
    pub fn unsubscribe(&self, key: CacheListenerKey) {
        self.inner.listeners.borrow_mut().remove(key);
    }

    pub(crate) fn notify(&self, event: QueryCacheEvent) {
        let listeners: Vec<CacheListener> =
            self.inner.listeners.borrow().values().cloned().collect();
        let notify = self.inner.services.notify.clone();
        notify.batch(|| {
            for listener in listeners {
                let event = event.clone();
                self.inner
                    .services
                    .notify
                    .schedule(move || listener(&event));
            }
        });
    }

    /// Resumes paused fetches when focus or connectivity returns.
    pub(crate) fn on_environment_change(&self) {
        for query in self.get_all() {
            query.on_environment_change();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn cache() -> QueryCache {
        QueryCache::new(QueryCacheConfig::default(), Services::new())
    }

    #[test]
    fn build_query_dedupes_on_hash() {
        let cache = cache();
        let a = cache.build_query(QueryKey::new(("todos", 1)), QueryOptions::default());
        let b = cache.build_query(QueryKey::new(("todos", 1)), QueryOptions::default());
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);

        cache.build_query(QueryKey::new(("todos", 2)), QueryOptions::default());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn find_all_matches_prefixes_and_exact() {
        let cache = cache();
        cache.build_query(QueryKey::new(("todos", 1)), QueryOptions::default());
        cache.build_query(QueryKey::new(("todos", 2)), QueryOptions::default());
        cache.build_query(QueryKey::new(("users",)), QueryOptions::default());

        let prefix = cache.find_all(&QueryFilters::prefix(QueryKey::new(("todos",))));
        assert_eq!(prefix.len(), 2);

        let exact = cache.find_all(&QueryFilters::exact(QueryKey::new(("todos", 1))));
        assert_eq!(exact.len(), 1);

        let none = cache.find_all(&QueryFilters::exact(QueryKey::new(("todos",))));
        assert!(none.is_empty());
    }

    #[test]
    fn stale_filter() {
        let cache = cache();
        let fresh = cache.build_query(QueryKey::new(("fresh",)), QueryOptions::default());
        fresh.set_data(json!(1), None);
        let stale = cache.build_query(QueryKey::new(("stale",)), QueryOptions::default());
        stale.set_data(json!(2), None);
        stale.invalidate();

        let filters = QueryFilters {
            stale: Some(true),
            ..QueryFilters::default()
        };
        let matched = cache.find_all(&filters);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].query_hash(), stale.query_hash());
    }

    #[test]
    fn subscribers_hear_add_update_remove() {
        let cache = cache();
        let added = Rc::new(Cell::new(0u32));
        let updated = Rc::new(Cell::new(0u32));
        let removed = Rc::new(Cell::new(0u32));
        let (a, u, r) = (added.clone(), updated.clone(), removed.clone());
        let key = cache.subscribe(move |event| match event {
            QueryCacheEvent::Added(_) => a.set(a.get() + 1),
            QueryCacheEvent::Updated(_) => u.set(u.get() + 1),
            QueryCacheEvent::Removed(_) => r.set(r.get() + 1),
            _ => {}
        });

        let query = cache.build_query(QueryKey::new(("events",)), QueryOptions::default());
        query.set_data(json!("x"), None);
        cache.remove(&query);

        assert_eq!(added.get(), 1);
        assert_eq!(updated.get(), 1);
        assert_eq!(removed.get(), 1);

        cache.unsubscribe(key);
        cache.build_query(QueryKey::new(("more",)), QueryOptions::default());
        assert_eq!(added.get(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let cache = cache();
        let query = cache.build_query(QueryKey::new(("gone",)), QueryOptions::default());
        cache.remove(&query);
        cache.remove(&query);
        assert!(cache.is_empty());
    }
}

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use futures::{future::LocalBoxFuture, FutureExt};
use serde_json::Value;
use slotmap::{new_key_type, SlotMap};
use tracing::debug;

use crate::{
    mutation::{Mutation, MutationOptions},
    MutationStatus, QueryError, QueryKey, Services,
};

new_key_type! {
    /// Key identifying one mutation cache event listener.
    pub struct MutationListenerKey;
}

/// Events emitted by a [`MutationCache`] to its subscribers.
#[derive(Clone)]
pub enum MutationCacheEvent {
    /// A mutation was inserted into the cache.
    Added(Mutation),
    /// A mutation was removed from the cache.
    Removed(Mutation),
    /// A mutation's state changed.
    Updated(Mutation),
}

impl MutationCacheEvent {
    /// The mutation the event concerns.
    pub fn mutation(&self) -> &Mutation {
        match self {
            MutationCacheEvent::Added(mutation)
            | MutationCacheEvent::Removed(mutation)
            | MutationCacheEvent::Updated(mutation) => mutation,
        }
    }
}

type MutationListener = Rc<dyn Fn(&MutationCacheEvent)>;

/// Cache-wide lifecycle hooks, fired for every mutation before the
/// mutation's own hooks.
#[derive(Clone, Default)]
pub struct MutationCacheConfig {
    /// Called before any mutation's first attempt.
    pub on_mutate: Option<Rc<dyn Fn(&Value, &Mutation)>>,
    /// Called after any mutation succeeds: (data, variables, context).
    pub on_success: Option<Rc<dyn Fn(&Value, &Value, Option<&Value>, &Mutation)>>,
    /// Called after any mutation fails: (error, variables, context).
    pub on_error: Option<Rc<dyn Fn(&QueryError, &Value, Option<&Value>, &Mutation)>>,
    /// Called after any mutation settles.
    #[allow(clippy::type_complexity)]
    pub on_settled: Option<
        Rc<dyn Fn(Option<&Value>, Option<&QueryError>, &Value, Option<&Value>, &Mutation)>,
    >,
}

impl MutationCacheConfig {
    pub(crate) fn run_on_mutate(&self, variables: &Value, mutation: &Mutation) {
        if let Some(on_mutate) = &self.on_mutate {
            on_mutate(variables, mutation);
        }
    }

    pub(crate) fn run_on_success(
        &self,
        data: &Value,
        variables: &Value,
        context: Option<&Value>,
        mutation: &Mutation,
    ) {
        if let Some(on_success) = &self.on_success {
            on_success(data, variables, context, mutation);
        }
    }

    pub(crate) fn run_on_error(
        &self,
        error: &QueryError,
        variables: &Value,
        context: Option<&Value>,
        mutation: &Mutation,
    ) {
        if let Some(on_error) = &self.on_error {
            on_error(error, variables, context, mutation);
        }
    }

    pub(crate) fn run_on_settled(
        &self,
        data: Option<&Value>,
        error: Option<&QueryError>,
        variables: &Value,
        context: Option<&Value>,
        mutation: &Mutation,
    ) {
        if let Some(on_settled) = &self.on_settled {
            on_settled(data, error, variables, context, mutation);
        }
    }
}

/// Criteria for matching mutations in bulk operations.
#[derive(Clone, Default)]
pub struct MutationFilters {
    /// Match by mutation key. A prefix matches unless `exact` is set.
    pub mutation_key: Option<QueryKey>,
    /// Require the full key to match.
    pub exact: bool,
    /// Match by status.
    pub status: Option<MutationStatus>,
    /// Arbitrary predicate, combined with the other criteria.
    pub predicate: Option<Rc<dyn Fn(&Mutation) -> bool>>,
}

impl MutationFilters {
    pub(crate) fn matches(&self, mutation: &Mutation) -> bool {
        if let Some(key) = &self.mutation_key {
            let Some(mutation_key) = mutation.mutation_key() else {
                return false;
            };
            if self.exact {
                if mutation_key.hash() != key.hash() {
                    return false;
                }
            } else if !key.is_prefix_of(&mutation_key) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if mutation.state().status != status {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(mutation) {
                return false;
            }
        }
        true
    }
}

/// Holds every tracked [`Mutation`] in submission order.
///
/// Also enforces scope serialization: mutations sharing a scope name run one
/// at a time, later ones queueing paused until the running one settles.
#[derive(Clone)]
pub struct MutationCache {
    inner: Rc<MutationCacheInner>,
}

pub(crate) struct MutationCacheInner {
    mutations: RefCell<Vec<Mutation>>,
    scopes: RefCell<HashMap<String, Vec<Mutation>>>,
    listeners: RefCell<SlotMap<MutationListenerKey, MutationListener>>,
    next_id: Cell<u32>,
    config: MutationCacheConfig,
    services: Services,
}

impl MutationCache {
    /// Creates an empty cache.
    pub fn new(config: MutationCacheConfig, services: Services) -> Self {
        Self {
            inner: Rc::new(MutationCacheInner {
                mutations: RefCell::new(Vec::new()),
                scopes: RefCell::new(HashMap::new()),
                listeners: RefCell::new(SlotMap::with_key()),
                next_id: Cell::new(0),
                config,
                services,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<MutationCacheInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn config(&self) -> &MutationCacheConfig {
        &self.inner.config
    }

    pub(crate) fn services(&self) -> &Services {
        &self.inner.services
    }

    /// Creates and registers a new mutation. Every call creates a new entry.
    pub fn build(&self, options: MutationOptions) -> Mutation {
        let id = self.inner.next_id.get() + 1;
        self.inner.next_id.set(id);

        let mutation = Mutation::new(id, options, self.inner.services.clone());
        mutation.set_cache(Rc::downgrade(&self.inner));

        let cache = Rc::downgrade(&self.inner);
        mutation.gc().set_on_elapsed(move || {
            if let Some(cache) = cache.upgrade() {
                MutationCache::from_inner(cache).remove_if_unused(id);
            }
        });

        if let Some(scope) = mutation.scope() {
            self.inner
                .scopes
                .borrow_mut()
                .entry(scope)
                .or_default()
                .push(mutation.clone());
        }
        debug!(mutation = id, "mutation added");
        self.inner.mutations.borrow_mut().push(mutation.clone());
        self.notify(MutationCacheEvent::Added(mutation.clone()));
        mutation
    }

    /// Removes a mutation outright.
    pub fn remove(&self, mutation: &Mutation) {
        let mut mutations = self.inner.mutations.borrow_mut();
        let before = mutations.len();
        mutations.retain(|m| m != mutation);
        let removed = mutations.len() < before;
        drop(mutations);

        if removed {
            mutation.gc().cancel();
            if let Some(scope) = mutation.scope() {
                let mut scopes = self.inner.scopes.borrow_mut();
                if let Some(queue) = scopes.get_mut(&scope) {
                    queue.retain(|m| m != mutation);
                    if queue.is_empty() {
                        scopes.remove(&scope);
                    }
                }
            }
            debug!(mutation = mutation.mutation_id(), "mutation removed");
            self.notify(MutationCacheEvent::Removed(mutation.clone()));
        }
    }

    fn remove_if_unused(&self, id: u32) {
        let mutation = self
            .inner
            .mutations
            .borrow()
            .iter()
            .find(|m| m.mutation_id() == id)
            .cloned();
        if let Some(mutation) = mutation {
            if mutation.observer_count() == 0 {
                self.remove(&mutation);
            }
        }
    }

    /// Removes every mutation.
    pub fn clear(&self) {
        let mutations = self.get_all();
        self.inner.services.notify.batch(|| {
            for mutation in mutations {
                self.remove(&mutation);
            }
        });
    }

    /// Every tracked mutation, in submission order.
    pub fn get_all(&self) -> Vec<Mutation> {
        self.inner.mutations.borrow().clone()
    }

    /// All mutations matching `filters`.
    pub fn find_all(&self, filters: &MutationFilters) -> Vec<Mutation> {
        self.inner
            .mutations
            .borrow()
            .iter()
            .filter(|mutation| filters.matches(mutation))
            .cloned()
            .collect()
    }

    /// Whether `mutation` may run right now: unscoped mutations always may,
    /// scoped ones only as the oldest pending entry of their scope.
    pub(crate) fn can_run(&self, mutation: &Mutation) -> bool {
        let Some(scope) = mutation.scope() else {
            return true;
        };
        let scopes = self.inner.scopes.borrow();
        let first_pending = scopes.get(&scope).and_then(|queue| {
            queue
                .iter()
                .find(|m| m.state().status == MutationStatus::Pending)
                .cloned()
        });
        match first_pending {
            Some(first) => &first == mutation,
            None => true,
        }
    }

    /// Wakes the oldest paused mutation in `mutation`'s scope, if any.
    pub(crate) fn run_next(&self, mutation: &Mutation) {
        let Some(scope) = mutation.scope() else {
            return;
        };
        let next = {
            let scopes = self.inner.scopes.borrow();
            scopes.get(&scope).and_then(|queue| {
                queue
                    .iter()
                    .find(|m| *m != mutation && m.state().is_paused)
                    .cloned()
            })
        };
        if let Some(next) = next {
            debug!(
                scope = %scope,
                mutation = next.mutation_id(),
                "resuming next scoped mutation"
            );
            let resumed = next.continue_execution();
            tokio::task::spawn_local(async move {
                let _ = resumed.await;
            });
        }
    }

    /// Resumes every paused mutation, in submission order. Resolves when all
    /// of them settle.
    pub fn resume_paused_mutations(&self) -> LocalBoxFuture<'static, ()> {
        let paused: Vec<Mutation> = self
            .inner
            .mutations
            .borrow()
            .iter()
            .filter(|mutation| mutation.state().is_paused)
            .cloned()
            .collect();
        async move {
            let executions = paused
                .iter()
                .map(|mutation| mutation.continue_execution());
            let _ = futures::future::join_all(executions).await;
        }
        .boxed_local()
    }

    /// Registers a cache event listener.
    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationCacheEvent) + 'static,
    ) -> MutationListenerKey {
        self.inner.listeners.borrow_mut().insert(Rc::new(listener))
    }

    /// Removes a previously registered listener.
    pub fn unsubscribe(&self, key: MutationListenerKey) {
        self.inner.listeners.borrow_mut().remove(key);
    }

    pub(crate) fn notify(&self, event: MutationCacheEvent) {
        let listeners: Vec<MutationListener> =
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

    /// Resumes paused executions when focus or connectivity returns.
    pub(crate) fn on_environment_change(&self) {
        let resume = self.resume_paused_mutations();
        tokio::task::spawn_local(resume);
    }
}

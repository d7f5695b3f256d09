use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    time::Duration,
};

use futures::{future::LocalBoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    garbage_collector::GarbageCollector,
    mutation_cache::{MutationCache, MutationCacheEvent, MutationCacheInner},
    mutation_observer::MutationObserver,
    retryer::{can_fetch, Retryer, RetryerConfig},
    Instant, NetworkMode, QueryError, QueryKey, RetryDelay, RetryPolicy, Services,
};

/// A caller-supplied side-effect function, from variables to result data.
pub type MutationFn = Rc<dyn Fn(Value) -> LocalBoxFuture<'static, Result<Value, QueryError>>>;

/// Result status of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Not yet executed.
    #[default]
    Idle,
    /// Executing, possibly paused.
    Pending,
    /// The execution failed.
    Error,
    /// The execution succeeded.
    Success,
}

/// The complete observable state of one mutation.
///
/// Field names are load-bearing: this shape crosses the dehydrate/hydrate
/// boundary verbatim.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationState {
    /// Rollback context produced by the `on_mutate` hook.
    pub context: Option<Value>,
    /// Result of a successful execution.
    pub data: Option<Rc<Value>>,
    /// Error of a failed execution.
    pub error: Option<QueryError>,
    /// Failed attempts of the current execution.
    pub failure_count: u32,
    /// Reason for the most recent failed attempt.
    pub failure_reason: Option<QueryError>,
    /// Suspended on the environment or on scope exclusion.
    pub is_paused: bool,
    /// Result status.
    pub status: MutationStatus,
    /// The variables the execution was submitted with.
    pub variables: Option<Value>,
    /// When the execution was submitted.
    pub submitted_at: Option<Instant>,
}

#[derive(Clone)]
pub(crate) enum MutationAction {
    Pending {
        variables: Value,
        context: Option<Value>,
        is_paused: bool,
    },
    Success {
        data: Rc<Value>,
    },
    Error {
        error: QueryError,
    },
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Pause,
    Continue,
}

pub(crate) fn reduce_mutation(state: &MutationState, action: MutationAction) -> MutationState {
    match action {
        MutationAction::Pending {
            variables,
            context,
            is_paused,
        } => MutationState {
            context,
            data: None,
            error: None,
            failure_count: 0,
            failure_reason: None,
            is_paused,
            status: MutationStatus::Pending,
            variables: Some(variables),
            submitted_at: Some(Instant::now()),
        },
        MutationAction::Success { data } => {
            let mut next = state.clone();
            next.data = Some(data);
            next.error = None;
            next.status = MutationStatus::Success;
            next.is_paused = false;
            next
        }
        MutationAction::Error { error } => {
            let mut next = state.clone();
            next.failure_count = state.failure_count + 1;
            next.failure_reason = Some(error.clone());
            next.error = Some(error);
            next.status = MutationStatus::Error;
            next.is_paused = false;
            next
        }
        MutationAction::Failed {
            failure_count,
            error,
        } => {
            let mut next = state.clone();
            next.failure_count = failure_count;
            next.failure_reason = Some(error);
            next
        }
        MutationAction::Pause => {
            let mut next = state.clone();
            next.is_paused = true;
            next
        }
        MutationAction::Continue => {
            let mut next = state.clone();
            next.is_paused = false;
            next
        }
    }
}

/// Lifecycle hooks and execution settings for one mutation.
#[derive(Clone, Default)]
pub struct MutationOptions {
    /// The side-effect function. Required before execution.
    pub mutation_fn: Option<MutationFn>,
    /// Key for bulk matching and defaults. Never used for deduplication.
    pub mutation_key: Option<QueryKey>,
    /// Runs before the first attempt; its return value becomes the rollback
    /// context handed to the other hooks.
    pub on_mutate: Option<Rc<dyn Fn(&Value) -> Option<Value>>>,
    /// Runs after a successful execution: (data, variables, context).
    pub on_success: Option<Rc<dyn Fn(&Value, &Value, Option<&Value>)>>,
    /// Runs after a failed execution: (error, variables, context).
    pub on_error: Option<Rc<dyn Fn(&QueryError, &Value, Option<&Value>)>>,
    /// Runs after any settled execution: (data, error, variables, context).
    pub on_settled:
        Option<Rc<dyn Fn(Option<&Value>, Option<&QueryError>, &Value, Option<&Value>)>>,
    /// Retry policy. Mutations default to no retries.
    pub retry: RetryPolicy,
    /// Backoff between retries.
    pub retry_delay: RetryDelay,
    /// Interaction with the online signal.
    pub network_mode: NetworkMode,
    /// Quiescence window before the settled mutation is evicted.
    pub gc_time: Option<Duration>,
    /// Mutations sharing a scope run serially in submission order.
    pub scope: Option<String>,
    /// Opaque metadata passed through to cache hooks.
    pub meta: Option<Value>,
}

impl MutationOptions {
    /// Options with just a side-effect function.
    pub fn new(mutation_fn: MutationFn) -> Self {
        Self {
            mutation_fn: Some(mutation_fn),
            retry: RetryPolicy::Never,
            ..Self::default()
        }
    }
}

/// One tracked side effect.
///
/// Unlike queries, mutations are never deduplicated: every submission is its
/// own entry with its own id, state and retryer.
#[derive(Clone)]
pub struct Mutation {
    inner: Rc<MutationInner>,
}

pub(crate) struct MutationInner {
    id: u32,
    options: RefCell<MutationOptions>,
    state: RefCell<MutationState>,
    retryer: RefCell<Option<Retryer<Rc<Value>>>>,
    observers: RefCell<Vec<MutationObserver>>,
    cache: RefCell<Weak<MutationCacheInner>>,
    gc: GarbageCollector,
    services: Services,
}

impl PartialEq for Mutation {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Mutation {}

impl Mutation {
    pub(crate) fn new(id: u32, options: MutationOptions, services: Services) -> Self {
        let gc = GarbageCollector::new(services.timers.clone());
        gc.update_gc_time(options.gc_time);
        Self {
            inner: Rc::new(MutationInner {
                id,
                options: RefCell::new(options),
                state: RefCell::new(MutationState::default()),
                retryer: RefCell::new(None),
                observers: RefCell::new(Vec::new()),
                cache: RefCell::new(Weak::new()),
                gc,
                services,
            }),
        }
    }

    pub(crate) fn set_cache(&self, cache: Weak<MutationCacheInner>) {
        *self.inner.cache.borrow_mut() = cache;
    }

    pub(crate) fn gc(&self) -> &GarbageCollector {
        &self.inner.gc
    }

    /// Unique id within the owning cache.
    pub fn mutation_id(&self) -> u32 {
        self.inner.id
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> MutationState {
        self.inner.state.borrow().clone()
    }

    /// The mutation key, if one was set.
    pub fn mutation_key(&self) -> Option<QueryKey> {
        self.inner.options.borrow().mutation_key.clone()
    }

    /// The scope name, if the mutation runs serialized.
    pub fn scope(&self) -> Option<String> {
        self.inner.options.borrow().scope.clone()
    }

    /// Metadata from the options.
    pub fn meta(&self) -> Option<Value> {
        self.inner.options.borrow().meta.clone()
    }

    pub(crate) fn options(&self) -> MutationOptions {
        self.inner.options.borrow().clone()
    }

    pub(crate) fn set_options(&self, options: MutationOptions) {
        self.inner.gc.update_gc_time(options.gc_time);
        *self.inner.options.borrow_mut() = options;
    }

    /// Authoritative external state override, used by hydration.
    pub fn set_state(&self, state: MutationState) {
        *self.inner.state.borrow_mut() = state;
        self.notify_observers();
    }

    /// Number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.borrow().len()
    }

    pub(crate) fn add_observer(&self, observer: &MutationObserver) {
        let mut observers = self.inner.observers.borrow_mut();
        if observers.iter().any(|o| o.id() == observer.id()) {
            return;
        }
        observers.push(observer.clone());
        drop(observers);
        self.inner.gc.cancel();
    }

    pub(crate) fn remove_observer(&self, observer: &MutationObserver) {
        self.inner
            .observers
            .borrow_mut()
            .retain(|o| o.id() != observer.id());
        self.maybe_schedule_gc();
    }

    fn maybe_schedule_gc(&self) {
        let settled = matches!(
            self.inner.state.borrow().status,
            MutationStatus::Success | MutationStatus::Error | MutationStatus::Idle
        );
        if self.inner.observers.borrow().is_empty() && settled {
            self.inner.gc.schedule();
        }
    }

    /// Runs the mutation with `variables`.
    ///
    /// Cache-level hooks fire before the mutation's own hooks at every
    /// phase. Scoped mutations queue behind the oldest pending mutation in
    /// their scope and start paused until it settles.
    pub fn execute(&self, variables: Value) -> LocalBoxFuture<'static, Result<Rc<Value>, QueryError>> {
        let mutation = self.clone();
        async move { mutation.run(variables).await }.boxed_local()
    }

    /// Resumes a paused execution, or replays the stored variables when the
    /// pause predates this process (hydrated mutations).
    pub fn continue_execution(&self) -> LocalBoxFuture<'static, Result<Rc<Value>, QueryError>> {
        let retryer = self.inner.retryer.borrow().clone();
        match retryer {
            Some(retryer) => {
                retryer.resume();
                retryer.promise().boxed_local()
            }
            None => {
                let variables = self.state().variables.unwrap_or(Value::Null);
                self.execute(variables)
            }
        }
    }

    async fn run(&self, variables: Value) -> Result<Rc<Value>, QueryError> {
        let options = self.options();
        let Some(mutation_fn) = options.mutation_fn.clone() else {
            return Err(QueryError::Configuration(
                "no mutation function found".into(),
            ));
        };

        let cache = self.cache();
        let on_fail = {
            let mutation = self.clone();
            Box::new(move |failure_count: u32, failure: &QueryError| {
                mutation.dispatch(MutationAction::Failed {
                    failure_count,
                    error: failure.clone(),
                });
            })
        };
        let on_pause = {
            let mutation = self.clone();
            Box::new(move || {
                if !mutation.inner.state.borrow().is_paused {
                    mutation.dispatch(MutationAction::Pause);
                }
            })
        };
        let on_continue = {
            let mutation = self.clone();
            Box::new(move || mutation.dispatch(MutationAction::Continue))
        };
        let can_run = {
            let mutation = self.clone();
            Box::new(move || match mutation.cache() {
                Some(cache) => cache.can_run(&mutation),
                None => true,
            })
        };

        let retryer = Retryer::new(
            RetryerConfig {
                attempt: Box::new({
                    let variables = variables.clone();
                    move || {
                        let attempt = mutation_fn(variables.clone());
                        async move { attempt.await.map(Rc::new) }.boxed_local()
                    }
                }),
                retry: options.retry.clone(),
                retry_delay: options.retry_delay.clone(),
                network_mode: options.network_mode,
                can_run,
                on_fail,
                on_pause,
                on_continue,
                services: self.inner.services.clone(),
            },
            || {},
        );
        *self.inner.retryer.borrow_mut() = Some(retryer.clone());

        let resuming = self.inner.state.borrow().status == MutationStatus::Pending;
        if !resuming {
            if let Some(cache) = &cache {
                cache.config().run_on_mutate(&variables, self);
            }
            let context = options.on_mutate.as_ref().and_then(|hook| hook(&variables));
            let blocked = cache
                .as_ref()
                .map(|cache| !cache.can_run(self))
                .unwrap_or(false);
            let paused = blocked || !can_fetch(options.network_mode, &self.inner.services);
            if paused {
                debug!(mutation = self.inner.id, "mutation queued paused");
            }
            self.dispatch(MutationAction::Pending {
                variables: variables.clone(),
                context,
                is_paused: paused,
            });
        } else if self.inner.state.borrow().is_paused {
            // Replaying a hydrated pause; the retryer gate re-pauses if the
            // environment still disallows the run.
            self.dispatch(MutationAction::Continue);
        }

        let result = retryer.promise().await;
        let state = self.state();
        let context = state.context.clone();
        match &result {
            Ok(data) => {
                if let Some(cache) = &cache {
                    cache
                        .config()
                        .run_on_success(data.as_ref(), &variables, context.as_ref(), self);
                }
                if let Some(on_success) = &options.on_success {
                    on_success(data.as_ref(), &variables, context.as_ref());
                }
                if let Some(cache) = &cache {
                    cache.config().run_on_settled(
                        Some(data.as_ref()),
                        None,
                        &variables,
                        context.as_ref(),
                        self,
                    );
                }
                if let Some(on_settled) = &options.on_settled {
                    on_settled(Some(data.as_ref()), None, &variables, context.as_ref());
                }
                self.dispatch(MutationAction::Success { data: data.clone() });
            }
            Err(error) => {
                if let Some(cache) = &cache {
                    cache
                        .config()
                        .run_on_error(error, &variables, context.as_ref(), self);
                }
                if let Some(on_error) = &options.on_error {
                    on_error(error, &variables, context.as_ref());
                }
                if let Some(cache) = &cache {
                    cache.config().run_on_settled(
                        None,
                        Some(error),
                        &variables,
                        context.as_ref(),
                        self,
                    );
                }
                if let Some(on_settled) = &options.on_settled {
                    on_settled(None, Some(error), &variables, context.as_ref());
                }
                self.dispatch(MutationAction::Error {
                    error: error.clone(),
                });
            }
        }

        *self.inner.retryer.borrow_mut() = None;
        self.maybe_schedule_gc();
        if let Some(cache) = &cache {
            cache.run_next(self);
        }
        result
    }

    pub(crate) fn dispatch(&self, action: MutationAction) {
        let next = {
            let state = self.inner.state.borrow();
            reduce_mutation(&state, action)
        };
        *self.inner.state.borrow_mut() = next;
        self.notify_observers();
    }

    fn notify_observers(&self) {
        let observers = self.inner.observers.borrow().clone();
        self.inner.services.notify.batch(|| {
            for observer in &observers {
                observer.on_mutation_update();
            }
            if let Some(cache) = self.cache() {
                cache.notify(MutationCacheEvent::Updated(self.clone()));
            }
        });
    }

    fn cache(&self) -> Option<MutationCache> {
        self.inner
            .cache
            .borrow()
            .upgrade()
            .map(MutationCache::from_inner)
    }
}

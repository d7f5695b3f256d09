use std::{rc::Rc, time::Duration};

use serde_json::Value;

use crate::{
    query::{FetchBehavior, QueryFn},
    query_result::NotifyOnChangeProps,
    NetworkMode, RetryDelay, RetryPolicy,
};

/// Options owned by a cached [`Query`](crate::Query) entity.
///
/// Observer-level concerns (staleness, refetch policies, projections) live in
/// [`QueryObserverOptions`]; these are the options every consumer of the same
/// cache entry shares.
#[derive(Clone, Default)]
pub struct QueryOptions {
    /// The fetch function. Required before the first fetch.
    pub query_fn: Option<QueryFn>,
    /// Retry policy for failed fetches. Defaults to three retries.
    pub retry: RetryPolicy,
    /// Backoff between retries.
    pub retry_delay: RetryDelay,
    /// Interaction with the online signal.
    pub network_mode: NetworkMode,
    /// Quiescence window before the unobserved entry is evicted.
    /// `None` uses the 5 minute default. Per entry, the longest wins.
    pub gc_time: Option<Duration>,
    /// Opaque metadata passed through to the fetch function.
    pub meta: Option<Value>,
    /// Hook that may rewrite the effective fetch function before execution.
    pub behavior: Option<Rc<dyn FetchBehavior>>,
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("network_mode", &self.network_mode)
            .field("gc_time", &self.gc_time)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// When a policy-triggered refetch (subscribe, focus, reconnect) fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefetchPolicy {
    /// Refetch every time the trigger fires.
    Always,
    /// Refetch only when the data is stale.
    #[default]
    IfStale,
    /// Never refetch on this trigger.
    Never,
}

impl RefetchPolicy {
    /// The shared evaluation rule: `Always`, or stale data with the policy
    /// not disabled.
    pub(crate) fn should_refetch(&self, is_stale: bool) -> bool {
        match self {
            RefetchPolicy::Always => true,
            RefetchPolicy::IfStale => is_stale,
            RefetchPolicy::Never => false,
        }
    }
}

/// Per-subscriber options for a [`QueryObserver`](crate::QueryObserver).
#[derive(Clone)]
pub struct QueryObserverOptions {
    /// Options for the underlying cache entry.
    pub query: QueryOptions,
    /// Disabled observers never trigger fetches.
    pub enabled: bool,
    /// How long data stays fresh. Zero means immediately stale.
    pub stale_time: Duration,
    /// Background refetch cadence, if any.
    pub refetch_interval: Option<Duration>,
    /// Keep the refetch interval ticking while unfocused.
    pub refetch_interval_in_background: bool,
    /// Refetch policy applied when the observer subscribes to a query that
    /// already has data.
    pub refetch_on_subscribe: RefetchPolicy,
    /// Refetch policy applied when the host regains focus.
    pub refetch_on_focus: RefetchPolicy,
    /// Refetch policy applied when connectivity returns.
    pub refetch_on_reconnect: RefetchPolicy,
    /// Substituted for missing data while the query is pending.
    pub placeholder_data: Option<Rc<Value>>,
    /// Projection applied to data before it reaches listeners.
    pub select: Option<Rc<dyn Fn(&Value) -> Value>>,
    /// Which result properties trigger listener notification.
    pub notify_on_change_props: NotifyOnChangeProps,
}

impl Default for QueryObserverOptions {
    fn default() -> Self {
        Self {
            query: QueryOptions::default(),
            enabled: true,
            stale_time: Duration::ZERO,
            refetch_interval: None,
            refetch_interval_in_background: false,
            refetch_on_subscribe: RefetchPolicy::IfStale,
            refetch_on_focus: RefetchPolicy::IfStale,
            refetch_on_reconnect: RefetchPolicy::IfStale,
            placeholder_data: None,
            select: None,
            notify_on_change_props: NotifyOnChangeProps::Tracked,
        }
    }
}

impl QueryObserverOptions {
    /// Set the fetch function.
    pub fn set_query_fn(mut self, query_fn: QueryFn) -> Self {
        self.query.query_fn = Some(query_fn);
        self
    }

    /// Set the stale time.
    pub fn set_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Set the gc time.
    pub fn set_gc_time(mut self, gc_time: Duration) -> Self {
        self.query.gc_time = Some(gc_time);
        self
    }

    /// Set the refetch interval.
    pub fn set_refetch_interval(mut self, refetch_interval: Duration) -> Self {
        self.refetch_interval = Some(refetch_interval);
        self
    }

    /// Set the retry policy.
    pub fn set_retry(mut self, retry: RetryPolicy) -> Self {
        self.query.retry = retry;
        self
    }

    /// Set the select projection.
    pub fn set_select(mut self, select: impl Fn(&Value) -> Value + 'static) -> Self {
        self.select = Some(Rc::new(select));
        self
    }

    /// Set the placeholder data.
    pub fn set_placeholder_data(mut self, placeholder: Value) -> Self {
        self.placeholder_data = Some(Rc::new(placeholder));
        self
    }

    /// Enable or disable the observer.
    pub fn set_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Client-wide defaults applied wherever a call site does not override them.
#[derive(Clone)]
pub struct DefaultOptions {
    /// Seed for [`QueryObserverOptions`].
    pub query: QueryObserverOptions,
    /// Default retry policy for mutations. Mutations do not retry unless
    /// asked to.
    pub mutation_retry: RetryPolicy,
    /// Default backoff for mutation retries.
    pub mutation_retry_delay: RetryDelay,
    /// Default network mode for mutations.
    pub mutation_network_mode: NetworkMode,
}

impl Default for DefaultOptions {
    fn default() -> Self {
        Self {
            query: QueryObserverOptions::default(),
            mutation_retry: RetryPolicy::Never,
            mutation_retry_delay: RetryDelay::default(),
            mutation_network_mode: NetworkMode::default(),
        }
    }
}

/// Direction of an infinite-query page fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    /// Fetch the page after the last one.
    Forward,
    /// Fetch the page before the first one.
    Backward,
}

/// Per-call options for [`Query::fetch`](crate::Query).
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Silently cancel an in-flight fetch and start a new one instead of
    /// coalescing onto it.
    pub cancel_refetch: bool,
    /// Metadata recorded as `fetch_meta` for the duration of the fetch.
    pub meta: Option<Value>,
    /// Page direction for infinite queries.
    pub direction: Option<FetchDirection>,
}

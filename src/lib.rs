//! An asynchronous result cache with subscriptions, retries and offline
//! support.
//!
//! The crate keeps the latest result of keyed asynchronous operations in a
//! client-side cache. Consumers subscribe through observers and get notified
//! when the slice of state they use changes; the cache handles deduplication
//! of concurrent fetches, retry with backoff, pausing while offline or
//! unfocused, staleness tracking, garbage collection of unobserved entries,
//! and serializing snapshots across process boundaries.
//!
//! Everything is single-threaded and cooperative: the cache runs inside a
//! [`tokio::task::LocalSet`] and shares state with `Rc` and interior
//! mutability, never locks.
//!
//! # Example
//!
//! ```
//! use async_query::*;
//! use futures::FutureExt;
//! use serde_json::json;
//! use std::rc::Rc;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
//! #     .block_on(tokio::task::LocalSet::new().run_until(async {
//! let client = QueryClient::new(Services::new(), Default::default());
//!
//! let options = QueryObserverOptions::default()
//!     .set_query_fn(Rc::new(|context| {
//!         let key = context.query_key.clone();
//!         async move { Ok(Some(json!({ "fetched": key }))) }.boxed_local()
//!     }));
//! let observer = QueryObserver::new(client.cache().clone(), QueryKey::new(("todos", 1)), options);
//!
//! let subscription = observer.subscribe(|result| {
//!     if result.is_success() {
//!         println!("data: {:?}", result.data());
//!     }
//! });
//!
//! let data = observer.refetch().await.unwrap();
//! assert_eq!(data["fetched"][0], "todos");
//! observer.unsubscribe(subscription);
//! # }));
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod environment;
mod error;
mod garbage_collector;
mod hydration;
mod infinite_query;
mod instant;
mod key;
mod mutation;
mod mutation_cache;
mod mutation_observer;
mod notify;
mod query;
mod query_cache;
mod query_client;
mod query_observer;
mod query_options;
mod query_result;
mod query_state;
mod retryer;
mod services;
mod timeout;
mod util;

pub use environment::{FocusManager, OnlineManager, SignalListenerKey};
pub use error::{CancelledError, QueryError};
pub use garbage_collector::DEFAULT_GC_TIME;
pub use hydration::{
    dehydrate, hydrate, DehydrateOptions, DehydratedMutation, DehydratedQuery, DehydratedState,
    HydrateOptions,
};
pub use infinite_query::{InfiniteQueryBehavior, PageParamFn};
pub use instant::Instant;
pub use key::{hash_query_key, IntoQueryKey, QueryHash, QueryKey};
pub use mutation::{Mutation, MutationFn, MutationOptions, MutationState, MutationStatus};
pub use mutation_cache::{
    MutationCache, MutationCacheConfig, MutationCacheEvent, MutationFilters, MutationListenerKey,
};
pub use mutation_observer::{
    MutationObserver, MutationObserverListenerKey, MutationObserverResult,
};
pub use notify::NotifyManager;
pub use query::{
    AbortSignal, FetchBehavior, FetchContext, Query, QueryFn, QueryFnContext, QueryFnResult,
};
pub use query_cache::{
    CacheListenerKey, QueryCache, QueryCacheConfig, QueryCacheEvent, QueryFilters,
};
pub use query_client::QueryClient;
pub use query_observer::{ObserverId, ObserverListenerKey, QueryObserver};
pub use query_options::{
    DefaultOptions, FetchDirection, FetchOptions, QueryObserverOptions, QueryOptions,
    RefetchPolicy,
};
pub use query_result::{
    NotifyOnChangeProps, QueryObserverResult, ResultField, TrackedResult,
};
pub use query_state::{FetchStatus, QueryState, QueryStatus};
pub use retryer::{NetworkMode, RetryDelay, RetryPolicy};
pub use services::Services;
pub use timeout::{TimeoutHandle, TimeoutManager, TimerBackend, TokioTimers};

pub(crate) use mutation::MutationAction;

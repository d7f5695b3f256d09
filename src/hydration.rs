use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    mutation::{Mutation, MutationOptions},
    query::Query,
    FetchStatus, MutationState, QueryClient, QueryError, QueryKey, QueryOptions, QueryState,
    QueryStatus,
};

/// One query, flattened for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQuery {
    /// The structural key.
    pub query_key: QueryKey,
    /// The canonical hash of the key.
    pub query_hash: String,
    /// The state snapshot.
    pub state: QueryState,
    /// Metadata from the query options, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<Value>,
}

/// One mutation, flattened for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedMutation {
    /// The mutation key, if one was set.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mutation_key: Option<QueryKey>,
    /// The state snapshot.
    pub state: MutationState,
    /// The serialization scope, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<String>,
    /// Metadata from the mutation options, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<Value>,
}

/// A serializable snapshot of cache contents, produced by [`dehydrate`] and
/// consumed by [`hydrate`]. The JSON shape is a stable wire format.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedState {
    /// Snapshotted queries.
    pub queries: Vec<DehydratedQuery>,
    /// Snapshotted mutations.
    pub mutations: Vec<DehydratedMutation>,
}

/// Controls what [`dehydrate`] includes and how it encodes data.
#[derive(Clone)]
pub struct DehydrateOptions {
    /// Which queries to include. Defaults to successful ones.
    pub should_dehydrate_query: Option<Rc<dyn Fn(&Query) -> bool>>,
    /// Which mutations to include. Defaults to paused ones.
    pub should_dehydrate_mutation: Option<Rc<dyn Fn(&Mutation) -> bool>>,
    /// Applied to each query's `data` before it enters the snapshot. Pair it
    /// with [`HydrateOptions::deserialize_data`] on the receiving side.
    pub serialize_data: Option<Rc<dyn Fn(&Value) -> Value>>,
    /// Replace errors with a redaction marker. On by default; disable only
    /// when snapshots never leave a trusted boundary.
    pub redact_errors: bool,
}

impl Default for DehydrateOptions {
    fn default() -> Self {
        Self {
            should_dehydrate_query: None,
            should_dehydrate_mutation: None,
            serialize_data: None,
            redact_errors: true,
        }
    }
}

/// Controls how [`hydrate`] decodes a snapshot.
#[derive(Clone, Default)]
pub struct HydrateOptions {
    /// Applied to each query's `data` as it leaves the snapshot, reversing
    /// [`DehydrateOptions::serialize_data`].
    pub deserialize_data: Option<Rc<dyn Fn(&Value) -> Value>>,
}

fn default_dehydrate_query(query: &Query) -> bool {
    query.state().status == QueryStatus::Success
}

fn default_dehydrate_mutation(mutation: &Mutation) -> bool {
    mutation.state().is_paused
}

/// Snapshots the client's caches into a transportable value.
///
/// Unless [`redact_errors`](DehydrateOptions::redact_errors) is turned off,
/// an included errored entry has its error replaced by a redaction marker,
/// since error internals may leak server-side details.
pub fn dehydrate(client: &QueryClient, options: &DehydrateOptions) -> DehydratedState {
    let include_query = |query: &Query| match &options.should_dehydrate_query {
        Some(predicate) => predicate(query),
        None => default_dehydrate_query(query),
    };
    let include_mutation = |mutation: &Mutation| match &options.should_dehydrate_mutation {
        Some(predicate) => predicate(mutation),
        None => default_dehydrate_mutation(mutation),
    };

    let queries = client
        .cache()
        .get_all()
        .iter()
        .filter(|query| include_query(query))
        .map(|query| {
            let mut state = query.state();
            if options.redact_errors {
                redact_query_errors(&mut state, query);
            }
            if let Some(serialize) = &options.serialize_data {
                if let Some(data) = &state.data {
                    state.data = Some(Rc::new(serialize(data)));
                }
            }
            DehydratedQuery {
                query_key: query.key().clone(),
                query_hash: query.query_hash().0.clone(),
                state,
                meta: query.meta(),
            }
        })
        .collect();

    let mutations = client
        .mutation_cache()
        .get_all()
        .iter()
        .filter(|mutation| include_mutation(mutation))
        .map(|mutation| {
            let mut state = mutation.state();
            if options.redact_errors && state.error.take().is_some() {
                warn!(
                    mutation = mutation.mutation_id(),
                    "redacting mutation error during dehydration"
                );
                state.error = Some(QueryError::Redacted);
            }
            DehydratedMutation {
                mutation_key: mutation.mutation_key(),
                state,
                scope: mutation.scope(),
                meta: mutation.meta(),
            }
        })
        .collect();

    DehydratedState { queries, mutations }
}

fn redact_query_errors(state: &mut QueryState, query: &Query) {
    if state.error.take().is_some() {
        warn!(query = %query.query_hash(), "redacting query error during dehydration");
        state.error = Some(QueryError::Redacted);
    }
    if state.fetch_failure_reason.take().is_some() {
        state.fetch_failure_reason = Some(QueryError::Redacted);
    }
}

/// Loads a snapshot into the client's caches.
///
/// A hydrated query never overwrites newer local data, and never arrives
/// mid-fetch: its fetch status is forced to idle. Hydrated paused mutations
/// are recreated paused; resume them explicitly with
/// [`QueryClient::resume_paused_mutations`].
pub fn hydrate(client: &QueryClient, state: DehydratedState, options: &HydrateOptions) {
    client.services().notify.clone().batch(|| {
        for dehydrated in state.queries {
            hydrate_query(client, dehydrated, options);
        }
        for dehydrated in state.mutations {
            hydrate_mutation(client, dehydrated);
        }
    });
}

fn hydrate_query(client: &QueryClient, dehydrated: DehydratedQuery, options: &HydrateOptions) {
    let DehydratedQuery {
        query_key,
        query_hash,
        mut state,
        meta,
    } = dehydrated;

    if let Some(existing) = client.cache().find(&query_key) {
        let newer_locally = match (existing.state().data_updated_at, state.data_updated_at) {
            (Some(local), Some(incoming)) => local >= incoming,
            (Some(_), None) => true,
            _ => false,
        };
        if newer_locally {
            debug!(query = %query_hash, "skipping hydration, local data is newer");
            return;
        }
    }

    if let Some(deserialize) = &options.deserialize_data {
        if let Some(data) = &state.data {
            state.data = Some(Rc::new(deserialize(data)));
        }
    }

    // Whatever fetch was running when the snapshot was taken did not travel
    // with it.
    state.fetch_status = FetchStatus::Idle;
    state.fetch_meta = None;

    let query = client.cache().build_query(
        query_key,
        QueryOptions {
            meta,
            ..QueryOptions::default()
        },
    );
    query.set_state(state);
}

fn hydrate_mutation(client: &QueryClient, dehydrated: DehydratedMutation) {
    let DehydratedMutation {
        mutation_key,
        state,
        scope,
        meta,
    } = dehydrated;
    // Functions and hooks do not serialize; registered defaults supply them.
    let base = client
        .mutation_defaults(mutation_key.as_ref())
        .unwrap_or_default();
    let mutation = client.mutation_cache().build(MutationOptions {
        mutation_key,
        scope,
        meta,
        ..base
    });
    mutation.set_state(state);
}

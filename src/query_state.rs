use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Instant, QueryError};

/// Result status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// No data and no successful fetch yet.
    #[default]
    Pending,
    /// The last settled fetch failed.
    Error,
    /// Data is available.
    Success,
}

/// Activity status of a query, orthogonal to [`QueryStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// No retryer is driving this query.
    #[default]
    Idle,
    /// A fetch is in flight.
    Fetching,
    /// A fetch is suspended (offline, unfocused, or blocked).
    Paused,
}

/// The complete observable state of one query.
///
/// Field names are load-bearing: this shape crosses the dehydrate/hydrate
/// boundary verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryState {
    /// Latest successful data, if any.
    pub data: Option<Rc<Value>>,
    /// When `data` was last written.
    pub data_updated_at: Option<Instant>,
    /// Number of successful data writes.
    pub data_update_count: u32,
    /// Latest error, if the last settled fetch failed.
    pub error: Option<QueryError>,
    /// When `error` was last written.
    pub error_updated_at: Option<Instant>,
    /// Number of recorded errors.
    pub error_update_count: u32,
    /// Failures of the current fetch so far.
    pub fetch_failure_count: u32,
    /// Reason for the most recent failure of the current fetch.
    pub fetch_failure_reason: Option<QueryError>,
    /// Metadata attached to the current fetch.
    pub fetch_meta: Option<Value>,
    /// Whether a retryer is driving the query right now.
    pub fetch_status: FetchStatus,
    /// Result status.
    pub status: QueryStatus,
    /// Marked stale by an explicit invalidation.
    pub is_invalidated: bool,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            data: None,
            data_updated_at: None,
            data_update_count: 0,
            error: None,
            error_updated_at: None,
            error_update_count: 0,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            fetch_meta: None,
            fetch_status: FetchStatus::Idle,
            status: QueryStatus::Pending,
            is_invalidated: false,
        }
    }
}

impl QueryState {
    /// Whether this state has ever seen data.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

/// State transitions. The reducer is the single writer of [`QueryState`]:
/// every transition replaces the state wholesale with a new record.
#[derive(Clone)]
pub(crate) enum QueryAction {
    Fetch {
        meta: Option<Value>,
        fetch_status: FetchStatus,
    },
    Success {
        data: Rc<Value>,
        updated_at: Option<Instant>,
        manual: bool,
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
    Invalidate,
    SetState {
        state: Box<QueryState>,
    },
}

pub(crate) fn reduce(state: &QueryState, action: QueryAction) -> QueryState {
    match action {
        QueryAction::Fetch { meta, fetch_status } => {
            let mut next = state.clone();
            next.fetch_failure_count = 0;
            next.fetch_failure_reason = None;
            next.fetch_meta = meta;
            next.fetch_status = fetch_status;
            // A refetch racing in after a success never resets status.
            if next.data_updated_at.is_none() {
                next.status = QueryStatus::Pending;
                next.error = None;
            }
            next
        }
        QueryAction::Success {
            data,
            updated_at,
            manual,
        } => {
            let mut next = state.clone();
            next.data = Some(data);
            next.data_updated_at = Some(updated_at.unwrap_or_else(Instant::now));
            next.data_update_count = state.data_update_count + 1;
            next.error = None;
            next.status = QueryStatus::Success;
            next.is_invalidated = false;
            // A manual cache write bypasses the fetch path and must not
            // disturb an in-flight fetch's bookkeeping.
            if !manual {
                next.fetch_status = FetchStatus::Idle;
                next.fetch_failure_count = 0;
                next.fetch_failure_reason = None;
            }
            next
        }
        QueryAction::Error { error } => {
            let mut next = state.clone();
            next.fetch_failure_count = state.fetch_failure_count + 1;
            next.fetch_failure_reason = Some(error.clone());
            next.error = Some(error);
            next.error_updated_at = Some(Instant::now());
            next.error_update_count = state.error_update_count + 1;
            next.fetch_status = FetchStatus::Idle;
            next.status = QueryStatus::Error;
            next
        }
        QueryAction::Failed {
            failure_count,
            error,
        } => {
            let mut next = state.clone();
            next.fetch_failure_count = failure_count;
            next.fetch_failure_reason = Some(error);
            next
        }
        QueryAction::Pause => {
            let mut next = state.clone();
            next.fetch_status = FetchStatus::Paused;
            next
        }
        QueryAction::Continue => {
            let mut next = state.clone();
            next.fetch_status = FetchStatus::Fetching;
            next
        }
        QueryAction::Invalidate => {
            let mut next = state.clone();
            next.is_invalidated = true;
            next
        }
        QueryAction::SetState { state } => *state,
    }
}

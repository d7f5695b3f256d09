use std::{
    cell::RefCell,
    collections::HashSet,
    rc::Rc,
};

use serde_json::Value;

use crate::{FetchStatus, Instant, QueryError, QueryStatus};

/// The derived, listener-facing view of one query for one observer.
///
/// Unlike [`QueryState`](crate::QueryState) this is per subscriber: it folds
/// in the observer's placeholder data, select projection and freshness
/// window.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryObserverResult {
    /// Data after placeholder substitution and the select projection.
    pub data: Option<Rc<Value>>,
    /// Latest error, if the last settled fetch failed.
    pub error: Option<QueryError>,
    /// Result status.
    pub status: QueryStatus,
    /// Activity status.
    pub fetch_status: FetchStatus,
    /// When the data was last written.
    pub data_updated_at: Option<Instant>,
    /// When the error was last written.
    pub error_updated_at: Option<Instant>,
    /// Failures of the current fetch so far.
    pub failure_count: u32,
    /// Reason for the most recent failure of the current fetch.
    pub failure_reason: Option<QueryError>,
    /// Stale under this observer's freshness window.
    pub is_stale: bool,
    /// `data` is the observer's placeholder, not cached data.
    pub is_placeholder_data: bool,
}

impl QueryObserverResult {
    /// No data and no error yet.
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Data is available.
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// The last settled fetch failed.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// First load: pending with a fetch in flight.
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// A fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// The fetch is suspended on the environment.
    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// A background refetch of already-loaded data.
    pub fn is_refetching(&self) -> bool {
        self.is_fetching() && !self.is_pending()
    }
}

/// One observable property of a [`QueryObserverResult`], for change
/// detection and tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultField {
    /// The `data` property.
    Data,
    /// The `error` property.
    Error,
    /// The `status` property.
    Status,
    /// The `fetch_status` property.
    FetchStatus,
    /// The `data_updated_at` property.
    DataUpdatedAt,
    /// The `error_updated_at` property.
    ErrorUpdatedAt,
    /// The `failure_count` property.
    FailureCount,
    /// The `failure_reason` property.
    FailureReason,
    /// The `is_stale` property.
    IsStale,
    /// The `is_placeholder_data` property.
    IsPlaceholderData,
}

pub(crate) fn changed_fields(
    previous: &QueryObserverResult,
    next: &QueryObserverResult,
) -> HashSet<ResultField> {
    let mut changed = HashSet::new();
    if previous.data != next.data {
        changed.insert(ResultField::Data);
    }
    if previous.error != next.error {
        changed.insert(ResultField::Error);
    }
    if previous.status != next.status {
        changed.insert(ResultField::Status);
    }
    if previous.fetch_status != next.fetch_status {
        changed.insert(ResultField::FetchStatus);
    }
    if previous.data_updated_at != next.data_updated_at {
        changed.insert(ResultField::DataUpdatedAt);
    }
    if previous.error_updated_at != next.error_updated_at {
        changed.insert(ResultField::ErrorUpdatedAt);
    }
    if previous.failure_count != next.failure_count {
        changed.insert(ResultField::FailureCount);
    }
    if previous.failure_reason != next.failure_reason {
        changed.insert(ResultField::FailureReason);
    }
    if previous.is_stale != next.is_stale {
        changed.insert(ResultField::IsStale);
    }
    if previous.is_placeholder_data != next.is_placeholder_data {
        changed.insert(ResultField::IsPlaceholderData);
    }
    changed
}

/// Which result properties wake an observer's listener.
#[derive(Clone, Default)]
pub enum NotifyOnChangeProps {
    /// Only the properties the listener has actually read through a
    /// [`TrackedResult`]. An untouched result never notifies.
    #[default]
    Tracked,
    /// Every change notifies.
    All,
    /// A fixed list of properties.
    List(Vec<ResultField>),
}

/// Access-tracking wrapper around a [`QueryObserverResult`].
///
/// Each accessor records the property it exposes into the observer's tracked
/// set, so subsequent notifications can be limited to properties the
/// listener demonstrably uses. Tracking accumulates for the observer's
/// lifetime.
#[derive(Clone)]
pub struct TrackedResult {
    result: QueryObserverResult,
    tracked: Rc<RefCell<HashSet<ResultField>>>,
}

impl TrackedResult {
    pub(crate) fn new(
        result: QueryObserverResult,
        tracked: Rc<RefCell<HashSet<ResultField>>>,
    ) -> Self {
        Self { result, tracked }
    }

    fn track(&self, field: ResultField) {
        self.tracked.borrow_mut().insert(field);
    }

    /// The untracked result. Reading through this bypasses tracking.
    pub fn inner(&self) -> &QueryObserverResult {
        &self.result
    }

    /// Data after placeholder substitution and the select projection.
    pub fn data(&self) -> Option<Rc<Value>> {
        self.track(ResultField::Data);
        self.result.data.clone()
    }

    /// Latest error, if any.
    pub fn error(&self) -> Option<QueryError> {
        self.track(ResultField::Error);
        self.result.error.clone()
    }

    /// Result status.
    pub fn status(&self) -> QueryStatus {
        self.track(ResultField::Status);
        self.result.status
    }

    /// Activity status.
    pub fn fetch_status(&self) -> FetchStatus {
        self.track(ResultField::FetchStatus);
        self.result.fetch_status
    }

    /// When the data was last written.
    pub fn data_updated_at(&self) -> Option<Instant> {
        self.track(ResultField::DataUpdatedAt);
        self.result.data_updated_at
    }

    /// When the error was last written.
    pub fn error_updated_at(&self) -> Option<Instant> {
        self.track(ResultField::ErrorUpdatedAt);
        self.result.error_updated_at
    }

    /// Failures of the current fetch so far.
    pub fn failure_count(&self) -> u32 {
        self.track(ResultField::FailureCount);
        self.result.failure_count
    }

    /// Reason for the most recent failure.
    pub fn failure_reason(&self) -> Option<QueryError> {
        self.track(ResultField::FailureReason);
        self.result.failure_reason.clone()
    }

    /// Stale under this observer's freshness window.
    pub fn is_stale(&self) -> bool {
        self.track(ResultField::IsStale);
        self.result.is_stale
    }

    /// Whether `data` is placeholder data.
    pub fn is_placeholder_data(&self) -> bool {
        self.track(ResultField::IsPlaceholderData);
        self.result.is_placeholder_data
    }

    /// Tracked variant of [`QueryObserverResult::is_pending`].
    pub fn is_pending(&self) -> bool {
        self.status() == QueryStatus::Pending
    }

    /// Tracked variant of [`QueryObserverResult::is_success`].
    pub fn is_success(&self) -> bool {
        self.status() == QueryStatus::Success
    }

    /// Tracked variant of [`QueryObserverResult::is_error`].
    pub fn is_error(&self) -> bool {
        self.status() == QueryStatus::Error
    }

    /// Tracked variant of [`QueryObserverResult::is_loading`].
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// Tracked variant of [`QueryObserverResult::is_fetching`].
    pub fn is_fetching(&self) -> bool {
        self.fetch_status() == FetchStatus::Fetching
    }

    /// Tracked variant of [`QueryObserverResult::is_paused`].
    pub fn is_paused(&self) -> bool {
        self.fetch_status() == FetchStatus::Paused
    }
}

pub(crate) fn default_result() -> QueryObserverResult {
    QueryObserverResult {
        data: None,
        error: None,
        status: QueryStatus::Pending,
        fetch_status: FetchStatus::Idle,
        data_updated_at: None,
        error_updated_at: None,
        failure_count: 0,
        failure_reason: None,
        is_stale: true,
        is_placeholder_data: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_detection_names_exactly_the_changed_fields() {
        let previous = default_result();
        let mut next = previous.clone();
        next.data = Some(Rc::new(json!(1)));
        next.status = QueryStatus::Success;

        let changed = changed_fields(&previous, &next);
        assert!(changed.contains(&ResultField::Data));
        assert!(changed.contains(&ResultField::Status));
        assert!(!changed.contains(&ResultField::Error));
        assert!(!changed.contains(&ResultField::FetchStatus));
        assert_eq!(changed.len(), 2);

        assert!(changed_fields(&previous, &previous.clone()).is_empty());
    }

    #[test]
    fn tracked_result_records_accessed_fields() {
        let tracked = Rc::new(RefCell::new(HashSet::new()));
        let result = TrackedResult::new(default_result(), tracked.clone());
        assert!(tracked.borrow().is_empty());

        let _ = result.data();
        let _ = result.is_fetching();
        let seen = tracked.borrow();
        assert!(seen.contains(&ResultField::Data));
        assert!(seen.contains(&ResultField::FetchStatus));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn derived_flags() {
        let mut result = default_result();
        result.fetch_status = FetchStatus::Fetching;
        assert!(result.is_loading());
        assert!(!result.is_refetching());

        result.status = QueryStatus::Success;
        assert!(result.is_refetching());
        assert!(!result.is_loading());
    }
}

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use futures::{
    future::{Either, LocalBoxFuture, Shared},
    FutureExt,
};
use futures_channel::oneshot;

use crate::{CancelledError, QueryError, Services};

/// Whether a failed attempt should be retried.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Never retry.
    Never,
    /// Retry up to this many times (total attempts = 1 + count).
    Count(u32),
    /// Retry indefinitely.
    Always,
    /// Caller-supplied predicate over (failure count, error).
    Predicate(Rc<dyn Fn(u32, &QueryError) -> bool>),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Count(3)
    }
}

impl RetryPolicy {
    pub(crate) fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Count(count) => failure_count <= *count,
            RetryPolicy::Always => true,
            RetryPolicy::Predicate(predicate) => predicate(failure_count, error),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "Never"),
            Self::Count(count) => f.debug_tuple("Count").field(count).finish(),
            Self::Always => write!(f, "Always"),
            Self::Predicate(_) => write!(f, "Predicate"),
        }
    }
}

/// Backoff between retry attempts.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// `min(1000 * 2^failure_count, 30000)` milliseconds.
    #[default]
    Exponential,
    /// Constant delay.
    Fixed(Duration),
    /// Caller-supplied function of the failure count.
    Custom(Rc<dyn Fn(u32) -> Duration>),
}

impl RetryDelay {
    pub(crate) fn resolve(&self, failure_count: u32) -> Duration {
        match self {
            RetryDelay::Exponential => {
                let millis = 1000u64
                    .saturating_mul(2u64.saturating_pow(failure_count))
                    .min(30_000);
                Duration::from_millis(millis)
            }
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Custom(delay_fn) => delay_fn(failure_count),
        }
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exponential => write!(f, "Exponential"),
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// How fetches interact with the online signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// Fetches only start while online and pause when connectivity drops.
    #[default]
    Online,
    /// The online signal is ignored entirely.
    Always,
    /// The first attempt always runs; retries pause while offline.
    OfflineFirst,
}

/// Whether a fetch in the given mode may start right now.
pub(crate) fn can_fetch(network_mode: NetworkMode, services: &Services) -> bool {
    match network_mode {
        NetworkMode::Online => services.online.is_online(),
        NetworkMode::Always | NetworkMode::OfflineFirst => true,
    }
}

fn should_pause(network_mode: NetworkMode, services: &Services) -> bool {
    !services.focus.is_focused()
        || (!services.online.is_online() && network_mode != NetworkMode::Always)
}

pub(crate) type AttemptFn<T> = Box<dyn FnMut() -> LocalBoxFuture<'static, Result<T, QueryError>>>;

/// Configuration for one retryer run.
pub(crate) struct RetryerConfig<T> {
    pub attempt: AttemptFn<T>,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    /// Extra start gate, e.g. mutation scope exclusion. Checked before every
    /// attempt; while false the retryer stays paused.
    pub can_run: Box<dyn Fn() -> bool>,
    pub on_fail: Box<dyn Fn(u32, &QueryError)>,
    pub on_pause: Box<dyn Fn()>,
    pub on_continue: Box<dyn Fn()>,
    pub services: Services,
}

pub(crate) type RetryerFuture<T> = Shared<LocalBoxFuture<'static, Result<T, QueryError>>>;

/// Runs one operation to completion with retry, backoff, pause-on-offline and
/// cooperative cancellation. One retryer per in-flight execution; the owning
/// Query/Mutation holds it so callers can cancel or resume it, and its shared
/// future is what coalesces concurrent fetch callers.
pub(crate) struct Retryer<T: Clone> {
    state: Rc<RetryerState>,
    promise: RetryerFuture<T>,
}

impl<T: Clone> Clone for Retryer<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            promise: self.promise.clone(),
        }
    }
}

pub(crate) struct RetryerState {
    failure_count: Cell<u32>,
    paused: Cell<bool>,
    resolved: Cell<bool>,
    retries_allowed: Cell<bool>,
    cancel_tx: RefCell<Option<oneshot::Sender<CancelledError>>>,
    continue_tx: RefCell<Option<oneshot::Sender<()>>>,
    abort: RefCell<Option<Box<dyn Fn()>>>,
}

impl<T: Clone + 'static> Retryer<T> {
    /// Builds and arms a retryer. `abort` fires when the run is cancelled so
    /// the owner can flip its abort signal.
    pub(crate) fn new(config: RetryerConfig<T>, abort: impl Fn() + 'static) -> Self {
        let state = Rc::new(RetryerState {
            failure_count: Cell::new(0),
            paused: Cell::new(false),
            resolved: Cell::new(false),
            retries_allowed: Cell::new(true),
            cancel_tx: RefCell::new(None),
            continue_tx: RefCell::new(None),
            abort: RefCell::new(Some(Box::new(abort))),
        });
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *state.cancel_tx.borrow_mut() = Some(cancel_tx);
        let promise = run(config, state.clone(), cancel_rx).boxed_local().shared();
        Self { state, promise }
    }

    /// The shared result future. Cloning it is how concurrent callers
    /// coalesce onto one execution.
    pub(crate) fn promise(&self) -> RetryerFuture<T> {
        self.promise.clone()
    }

    /// Rejects the run with a [`CancelledError`] and fires the abort hook.
    /// No-op once resolved.
    pub(crate) fn cancel(&self, options: CancelledError) {
        if self.state.resolved.get() {
            return;
        }
        if let Some(abort) = self.state.abort.borrow().as_ref() {
            abort();
        }
        if let Some(tx) = self.state.cancel_tx.borrow_mut().take() {
            let _ = tx.send(options);
        }
    }

    /// Stops future retries without interrupting the current attempt; its
    /// result still lands when it settles.
    pub(crate) fn cancel_retry(&self) {
        self.state.retries_allowed.set(false);
    }

    /// Re-allows retries after [`cancel_retry`](Self::cancel_retry).
    pub(crate) fn continue_retry(&self) {
        self.state.retries_allowed.set(true);
    }

    /// Resumes a paused run. Returns false if the run was not paused.
    pub(crate) fn resume(&self) -> bool {
        if let Some(tx) = self.state.continue_tx.borrow_mut().take() {
            tx.send(()).is_ok()
        } else {
            false
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.state.paused.get()
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.state.resolved.get()
    }

    /// Identity handle: two retryers are the same execution iff their states
    /// are the same allocation.
    pub(crate) fn state_rc(&self) -> Rc<RetryerState> {
        self.state.clone()
    }
}

async fn run<T: Clone>(
    config: RetryerConfig<T>,
    state: Rc<RetryerState>,
    mut cancel_rx: oneshot::Receiver<CancelledError>,
) -> Result<T, QueryError> {
    let RetryerConfig {
        mut attempt,
        retry,
        retry_delay,
        network_mode,
        can_run,
        on_fail,
        on_pause,
        on_continue,
        services,
    } = config;

    loop {
        // Gate before every attempt: scope exclusion and the online signal.
        while !can_run() || !can_fetch(network_mode, &services) {
            pause(&state, &on_pause, &on_continue, &mut cancel_rx).await?;
        }

        let fut = attempt();
        match futures::future::select(fut, &mut cancel_rx).await {
            Either::Right((cancelled, _)) => {
                state.resolved.set(true);
                return Err(QueryError::Cancelled(cancelled.unwrap_or_default()));
            }
            Either::Left((Ok(value), _)) => {
                state.resolved.set(true);
                return Ok(value);
            }
            Either::Left((Err(error), _)) => {
                let failure_count = state.failure_count.get() + 1;
                state.failure_count.set(failure_count);

                if !state.retries_allowed.get() || !retry.should_retry(failure_count, &error) {
                    state.resolved.set(true);
                    return Err(error);
                }
                on_fail(failure_count, &error);

                let sleep = services.timers.sleep(retry_delay.resolve(failure_count));
                if let Either::Right((cancelled, _)) =
                    futures::future::select(sleep, &mut cancel_rx).await
                {
                    state.resolved.set(true);
                    return Err(QueryError::Cancelled(cancelled.unwrap_or_default()));
                }

                // Retries revoked mid-backoff (all observers detached).
                if !state.retries_allowed.get() {
                    state.resolved.set(true);
                    return Err(error);
                }

                while should_pause(network_mode, &services) {
                    pause(&state, &on_pause, &on_continue, &mut cancel_rx).await?;
                }
            }
        }
    }
}

async fn pause(
    state: &Rc<RetryerState>,
    on_pause: &dyn Fn(),
    on_continue: &dyn Fn(),
    cancel_rx: &mut oneshot::Receiver<CancelledError>,
) -> Result<(), QueryError> {
    state.paused.set(true);
    on_pause();

    let (tx, rx) = oneshot::channel();
    *state.continue_tx.borrow_mut() = Some(tx);

    match futures::future::select(rx, cancel_rx).await {
        Either::Right((cancelled, _)) => {
            state.paused.set(false);
            state.resolved.set(true);
            Err(QueryError::Cancelled(cancelled.unwrap_or_default()))
        }
        Either::Left(_) => {
            state.paused.set(false);
            on_continue();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config<T: Clone>(
        attempt: AttemptFn<T>,
        retry: RetryPolicy,
        services: Services,
    ) -> RetryerConfig<T> {
        RetryerConfig {
            attempt,
            retry,
            retry_delay: RetryDelay::Exponential,
            network_mode: NetworkMode::Online,
            can_run: Box::new(|| true),
            on_fail: Box::new(|_, _| {}),
            on_pause: Box::new(|| {}),
            on_continue: Box::new(|| {}),
            services,
        }
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let delay = RetryDelay::Exponential;
        assert_eq!(delay.resolve(1), Duration::from_millis(2000));
        assert_eq!(delay.resolve(2), Duration::from_millis(4000));
        assert_eq!(delay.resolve(3), Duration::from_millis(8000));
        assert_eq!(delay.resolve(10), Duration::from_millis(30_000));
    }

    #[test]
    fn count_policy_allows_exactly_that_many_retries() {
        let policy = RetryPolicy::Count(3);
        let error = QueryError::fetch("nope");
        assert!(policy.should_retry(1, &error));
        assert!(policy.should_retry(3, &error));
        assert!(!policy.should_retry(4, &error));
        assert!(!RetryPolicy::Never.should_retry(1, &error));
        assert!(RetryPolicy::Always.should_retry(100, &error));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_resolves() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let services = Services::new();
                let attempts = Rc::new(Cell::new(0u32));
                let counter = attempts.clone();
                let attempt: AttemptFn<u32> = Box::new(move || {
                    let counter = counter.clone();
                    async move {
                        counter.set(counter.get() + 1);
                        if counter.get() < 3 {
                            Err(QueryError::fetch("transient"))
                        } else {
                            Ok(7)
                        }
                    }
                    .boxed_local()
                });

                let retryer = Retryer::new(
                    test_config(attempt, RetryPolicy::Count(5), services),
                    || {},
                );
                let result = retryer.promise().await;
                assert_eq!(result, Ok(7));
                assert_eq!(attempts.get(), 3);
                assert!(retryer.is_resolved());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_reject_with_the_last_error() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let services = Services::new();
                let attempts = Rc::new(Cell::new(0u32));
                let counter = attempts.clone();
                let attempt: AttemptFn<u32> = Box::new(move || {
                    let counter = counter.clone();
                    async move {
                        counter.set(counter.get() + 1);
                        Err(QueryError::fetch("permanent"))
                    }
                    .boxed_local()
                });

                let retryer = Retryer::new(
                    test_config(attempt, RetryPolicy::Count(3), services),
                    || {},
                );
                let result = retryer.promise().await;
                assert_eq!(result, Err(QueryError::fetch("permanent")));
                // 1 initial + 3 retries.
                assert_eq!(attempts.get(), 4);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_rejects_with_cancelled_error() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let services = Services::new();
                let attempt: AttemptFn<u32> = Box::new(|| {
                    async {
                        futures::future::pending::<()>().await;
                        unreachable!()
                    }
                    .boxed_local()
                });

                let aborted = Rc::new(Cell::new(false));
                let abort_flag = aborted.clone();
                let retryer = Retryer::new(
                    test_config(attempt, RetryPolicy::Always, services),
                    move || abort_flag.set(true),
                );

                let promise = retryer.promise();
                let driver = tokio::task::spawn_local(promise);
                tokio::task::yield_now().await;

                retryer.cancel(CancelledError {
                    revert: true,
                    silent: false,
                });

                let result = driver.await.unwrap();
                assert_eq!(
                    result,
                    Err(QueryError::Cancelled(CancelledError {
                        revert: true,
                        silent: false,
                    }))
                );
                assert!(aborted.get());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_start_pauses_until_online() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let services = Services::new();
                services.online.set_online(false);

                let paused = Rc::new(Cell::new(false));
                let pause_flag = paused.clone();
                let attempt: AttemptFn<u32> = Box::new(|| async { Ok(1) }.boxed_local());
                let mut config = test_config(attempt, RetryPolicy::Never, services.clone());
                config.on_pause = Box::new(move || pause_flag.set(true));

                let retryer = Retryer::new(config, || {});
                let driver = tokio::task::spawn_local(retryer.promise());
                tokio::task::yield_now().await;

                assert!(paused.get());
                assert!(retryer.is_paused());

                services.online.set_online(true);
                assert!(retryer.resume());

                let result = driver.await.unwrap();
                assert_eq!(result, Ok(1));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_retry_lets_the_current_attempt_finish() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let services = Services::new();
                let attempts = Rc::new(Cell::new(0u32));
                let counter = attempts.clone();
                let attempt: AttemptFn<u32> = Box::new(move || {
                    let counter = counter.clone();
                    async move {
                        counter.set(counter.get() + 1);
                        Err(QueryError::fetch("always"))
                    }
                    .boxed_local()
                });

                let retryer = Retryer::new(
                    test_config(attempt, RetryPolicy::Always, services),
                    || {},
                );
                let driver = tokio::task::spawn_local(retryer.promise());
                tokio::task::yield_now().await;

                // Revoke retries while the backoff sleep is pending.
                retryer.cancel_retry();

                let result = driver.await.unwrap();
                assert_eq!(result, Err(QueryError::fetch("always")));
                assert_eq!(attempts.get(), 1);
            })
            .await;
    }
}

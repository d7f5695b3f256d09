use std::{cell::Cell, cell::RefCell, rc::Rc, time::Duration};

use async_query::*;
use futures::FutureExt;
use serde_json::{json, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn counting_query_fn(counter: Rc<Cell<u32>>, value: Value) -> QueryFn {
    Rc::new(move |_context| {
        counter.set(counter.get() + 1);
        let value = value.clone();
        async move { Ok(Some(value)) }.boxed_local()
    })
}

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_share_one_execution() {
    let local = tokio::task::LocalSet::new();
    init_tracing();
    local
        .run_until(async {
            let client = QueryClient::new(Services::new(), DefaultOptions::default());
            let calls = Rc::new(Cell::new(0u32));
            let options = QueryOptions {
                query_fn: Some(Rc::new({
                    let calls = calls.clone();
                    move |_context| {
                        calls.set(calls.get() + 1);
                        async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Some(json!({"shared": true})))
                        }
                        .boxed_local()
                    }
                })),
                ..QueryOptions::default()
            };
            let query = client.cache().build_query(QueryKey::new(("shared",)), options);

            let (a, b, c) = futures::future::join3(
                query.fetch(FetchOptions::default()),
                query.fetch(FetchOptions::default()),
                query.fetch(FetchOptions::default()),
            )
            .await;

            let a = a.unwrap();
            assert!(Rc::ptr_eq(&a, &b.unwrap()));
            assert!(Rc::ptr_eq(&a, &c.unwrap()));
            assert_eq!(calls.get(), 1);
            assert_eq!(query.state().data_update_count, 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn retries_back_off_exponentially() {
    let local = tokio::task::LocalSet::new();
    init_tracing();
    local
        .run_until(async {
            let client = QueryClient::new(Services::new(), DefaultOptions::default());
            let attempts = Rc::new(RefCell::new(Vec::new()));
            let options = QueryOptions {
                query_fn: Some(Rc::new({
                    let attempts = attempts.clone();
                    move |_context| {
                        attempts.borrow_mut().push(tokio::time::Instant::now());
                        async { Err(QueryError::fetch("flaky")) }.boxed_local()
                    }
                })),
                retry: RetryPolicy::Count(3),
                ..QueryOptions::default()
            };
            let query = client.cache().build_query(QueryKey::new(("flaky",)), options);

            let result = query.fetch(FetchOptions::default()).await;
            assert_eq!(result, Err(QueryError::fetch("flaky")));

            let timestamps = attempts.borrow();
            assert_eq!(timestamps.len(), 4);
            let gaps: Vec<u64> = timestamps
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).as_millis() as u64)
                .collect();
            assert_eq!(gaps, vec![2000, 4000, 8000]);

            let state = query.state();
            assert_eq!(state.status, QueryStatus::Error);
            assert_eq!(state.fetch_failure_count, 4);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn offline_mutation_survives_a_round_trip_and_resumes() {
    let local = tokio::task::LocalSet::new();
    init_tracing();
    local
        .run_until(async {
            // First process: go offline, submit, snapshot.
            let offline_services = Services::new();
            offline_services.online.set_online(false);
            let source = QueryClient::new(offline_services, DefaultOptions::default());

            let observer = MutationObserver::new(
                source.mutation_cache().clone(),
                MutationOptions {
                    mutation_key: Some(QueryKey::new(("todos", "add"))),
                    ..MutationOptions::new(Rc::new(|_| {
                        async { Err(QueryError::fetch("unreachable offline")) }.boxed_local()
                    }))
                },
            );
            let pending = observer.mutate(json!({"title": "buy milk"}));
            tokio::task::spawn_local(async move {
                let _ = pending.await;
            });
            tokio::task::yield_now().await;
            assert!(observer.current_result().is_paused);

            let snapshot = dehydrate(&source, &DehydrateOptions::default());
            let wire = serde_json::to_string(&snapshot).unwrap();

            // Second process: register defaults, hydrate, resume.
            let executed = Rc::new(RefCell::new(Vec::new()));
            let target = QueryClient::new(Services::new(), DefaultOptions::default());
            target.set_mutation_defaults(
                QueryKey::new(("todos",)),
                MutationOptions::new(Rc::new({
                    let executed = executed.clone();
                    move |variables| {
                        executed.borrow_mut().push(variables.clone());
                        async move { Ok(json!({"saved": variables})) }.boxed_local()
                    }
                })),
            );
            hydrate(
                &target,
                serde_json::from_str(&wire).unwrap(),
                &HydrateOptions::default(),
            );
            assert_eq!(target.is_mutating(), 1);

            target.resume_paused_mutations().await;

            assert_eq!(*executed.borrow(), vec![json!({"title": "buy milk"})]);
            let states: Vec<MutationStatus> = target
                .mutation_cache()
                .get_all()
                .iter()
                .map(|mutation| mutation.state().status)
                .collect();
            assert_eq!(states, vec![MutationStatus::Success]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn invalidation_marks_stale_and_refetches_through_the_client() {
    let local = tokio::task::LocalSet::new();
    init_tracing();
    local
        .run_until(async {
            let client = QueryClient::new(Services::new(), DefaultOptions::default());
            let calls = Rc::new(Cell::new(0u32));

            let observer = QueryObserver::new(
                client.cache().clone(),
                QueryKey::new(("todos", "list")),
                QueryObserverOptions {
                    query: QueryOptions {
                        query_fn: Some(counting_query_fn(calls.clone(), json!(["a", "b"]))),
                        ..QueryOptions::default()
                    },
                    stale_time: Duration::from_secs(600),
                    ..QueryObserverOptions::default()
                },
            );
            let sub = observer.subscribe(|_| {});
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            assert_eq!(calls.get(), 1);
            assert!(!observer.current_result().inner().is_stale);

            client
                .invalidate_queries(&QueryFilters::prefix(QueryKey::new(("todos",))))
                .await;

            assert_eq!(calls.get(), 2);
            assert!(!observer.current_result().inner().is_stale);
            observer.unsubscribe(sub);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn unchanged_refetch_data_keeps_the_previous_allocation() {
    let local = tokio::task::LocalSet::new();
    init_tracing();
    local
        .run_until(async {
            let client = QueryClient::new(Services::new(), DefaultOptions::default());
            let observer = QueryObserver::new(
                client.cache().clone(),
                QueryKey::new(("stable",)),
                QueryObserverOptions {
                    query: QueryOptions {
                        query_fn: Some(Rc::new(|_context| {
                            async { Ok(Some(json!({"list": [1, 2, 3]}))) }.boxed_local()
                        })),
                        ..QueryOptions::default()
                    },
                    ..QueryObserverOptions::default()
                },
            );
            let sub = observer.subscribe(|_| {});
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;

            let first = observer.current_result().data().unwrap();
            observer.refetch().await.unwrap();
            let second = observer.current_result().data().unwrap();

            assert!(Rc::ptr_eq(&first, &second));
            // The cache still recorded a second write.
            assert_eq!(observer.query().state().data_update_count, 2);

            observer.unsubscribe(sub);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn cache_events_track_the_query_lifecycle() {
    let local = tokio::task::LocalSet::new();
    init_tracing();
    local
        .run_until(async {
            let client = QueryClient::new(Services::new(), DefaultOptions::default());
            let events = Rc::new(RefCell::new(Vec::new()));
            let log = events.clone();
            let key = client.cache().subscribe(move |event| {
                let label = match event {
                    QueryCacheEvent::Added(_) => "added",
                    QueryCacheEvent::Removed(_) => "removed",
                    QueryCacheEvent::Updated(_) => "updated",
                    QueryCacheEvent::ObserverAdded(_) => "observer added",
                    QueryCacheEvent::ObserverRemoved(_) => "observer removed",
                };
                log.borrow_mut()
                    .push((label, event.query().key().clone()));
            });

            let watched = QueryKey::new(("watched",));
            client.set_query_data(watched.clone(), json!(1), None);
            client.remove_queries(&QueryFilters::default());

            assert_eq!(
                *events.borrow(),
                vec![
                    ("added", watched.clone()),
                    ("updated", watched.clone()),
                    ("removed", watched),
                ]
            );
            client.cache().unsubscribe(key);
        })
        .await;
}

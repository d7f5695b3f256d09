use std::rc::Rc;

use futures::FutureExt;
use serde_json::{json, Value};

use crate::{
    query::{FetchBehavior, FetchContext, QueryFnContext},
    FetchDirection,
};

/// Computes the page parameter for the page adjacent to `page`, given every
/// page loaded so far. `None` means there is no further page.
pub type PageParamFn = Rc<dyn Fn(&Value, &[Value]) -> Option<Value>>;

/// Fetch behavior for paged data.
///
/// The cached value is a single object `{"pages": [...], "pageParams":
/// [...]}`. A directed fetch appends or prepends one page; an undirected
/// refetch reloads every cached page sequentially so later page parameters
/// can depend on earlier results.
#[derive(Clone)]
pub struct InfiniteQueryBehavior {
    /// Page parameter for the very first page.
    pub initial_page_param: Value,
    /// Parameter for the page after the last one.
    pub get_next_page_param: PageParamFn,
    /// Parameter for the page before the first one. Backward fetches require
    /// it.
    pub get_previous_page_param: Option<PageParamFn>,
    /// Cap on retained pages. Fetching past the cap drops pages from the
    /// opposite end.
    pub max_pages: Option<usize>,
}

impl InfiniteQueryBehavior {
    /// Forward-only paging.
    pub fn new(initial_page_param: Value, get_next_page_param: PageParamFn) -> Self {
        Self {
            initial_page_param,
            get_next_page_param,
            get_previous_page_param: None,
            max_pages: None,
        }
    }

    /// The parameter a forward fetch would use against `data`, or `None`
    /// when the last page reports no successor.
    pub fn next_page_param(&self, data: &Value) -> Option<Value> {
        let (pages, _) = split_pages(data);
        match pages.last() {
            Some(last) => (self.get_next_page_param)(last, &pages),
            None => Some(self.initial_page_param.clone()),
        }
    }

    /// The parameter a backward fetch would use against `data`.
    pub fn previous_page_param(&self, data: &Value) -> Option<Value> {
        let get_previous = self.get_previous_page_param.as_ref()?;
        let (pages, _) = split_pages(data);
        let first = pages.first()?;
        get_previous(first, &pages)
    }
}

fn split_pages(data: &Value) -> (Vec<Value>, Vec<Value>) {
    let pages = data["pages"].as_array().cloned().unwrap_or_default();
    let params = data["pageParams"].as_array().cloned().unwrap_or_default();
    (pages, params)
}

// Trims the oldest pages after a forward append.
fn join_pages(mut pages: Vec<Value>, mut params: Vec<Value>, max_pages: Option<usize>) -> Value {
    if let Some(max) = max_pages {
        while pages.len() > max && !pages.is_empty() {
            pages.remove(0);
            if !params.is_empty() {
                params.remove(0);
            }
        }
    }
    json!({ "pages": pages, "pageParams": params })
}

impl FetchBehavior for InfiniteQueryBehavior {
    fn on_fetch(&self, context: &mut FetchContext) {
        let behavior = self.clone();
        let query_fn = context.query_fn.clone();
        let query_key = context.query_key.clone();
        let meta = context.meta.clone();
        let signal = context.signal.clone();
        let direction = context.direction;
        let existing = context
            .state
            .data
            .as_ref()
            .map(|data| split_pages(data))
            .unwrap_or_default();

        context.fetch_fn = Rc::new(move || {
            let behavior = behavior.clone();
            let query_fn = query_fn.clone();
            let query_key = query_key.clone();
            let meta = meta.clone();
            let signal = signal.clone();
            let (mut pages, mut params) = existing.clone();

            async move {
                let fetch_page = |param: Value, direction: FetchDirection| {
                    let context = QueryFnContext::new(
                        query_key.clone(),
                        meta.clone(),
                        Some(param),
                        Some(direction),
                        signal.clone(),
                    );
                    query_fn(context)
                };

                match direction {
                    Some(FetchDirection::Backward) => {
                        let current = json!({ "pages": pages, "pageParams": params });
                        let Some(param) = behavior.previous_page_param(&current) else {
                            return Ok(Some(current));
                        };
                        let Some(page) = fetch_page(param.clone(), FetchDirection::Backward).await?
                        else {
                            return Ok(None);
                        };
                        pages.insert(0, page);
                        params.insert(0, param);
                        if let Some(max) = behavior.max_pages {
                            while pages.len() > max {
                                pages.pop();
                                params.pop();
                            }
                        }
                        Ok(Some(json!({ "pages": pages, "pageParams": params })))
                    }
                    Some(FetchDirection::Forward) => {
                        let current = json!({ "pages": pages, "pageParams": params });
                        let Some(param) = behavior.next_page_param(&current) else {
                            return Ok(Some(current));
                        };
                        let Some(page) = fetch_page(param.clone(), FetchDirection::Forward).await?
                        else {
                            return Ok(None);
                        };
                        pages.push(page);
                        params.push(param);
                        Ok(Some(join_pages(pages, params, behavior.max_pages)))
                    }
                    None => {
                        // Full refetch: reload every cached page in order,
                        // recomputing parameters as results come in.
                        let count = pages.len().max(1);
                        let mut next_pages: Vec<Value> = Vec::with_capacity(count);
                        let mut next_params: Vec<Value> = Vec::with_capacity(count);
                        let mut param = Some(behavior.initial_page_param.clone());
                        for _ in 0..count {
                            let Some(current_param) = param else {
                                break;
                            };
                            let Some(page) =
                                fetch_page(current_param.clone(), FetchDirection::Forward).await?
                            else {
                                return Ok(None);
                            };
                            next_pages.push(page);
                            next_params.push(current_param);
                            param = (behavior.get_next_page_param)(
                                next_pages
                                    .last()
                                    .unwrap_or(&Value::Null),
                                &next_pages,
                            );
                        }
                        Ok(Some(json!({
                            "pages": next_pages,
                            "pageParams": next_params,
                        })))
                    }
                }
            }
            .boxed_local()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FetchOptions, QueryCache, QueryCacheConfig, QueryKey, QueryOptions, Services};
    use std::cell::RefCell;

    fn page_behavior(max_pages: Option<usize>) -> InfiniteQueryBehavior {
        InfiniteQueryBehavior {
            initial_page_param: json!(0),
            get_next_page_param: Rc::new(|last, _pages| {
                let cursor = last["next"].as_i64();
                cursor.map(Value::from)
            }),
            get_previous_page_param: Some(Rc::new(|first, _pages| {
                let cursor = first["prev"].as_i64();
                cursor.map(Value::from)
            })),
            max_pages,
        }
    }

    fn page_query_fn(log: Rc<RefCell<Vec<Value>>>) -> crate::QueryFn {
        Rc::new(move |context| {
            let param = context.page_param.clone().unwrap_or(Value::Null);
            log.borrow_mut().push(param.clone());
            let cursor = param.as_i64().unwrap_or(0);
            async move {
                Ok(Some(json!({
                    "items": [cursor * 10, cursor * 10 + 1],
                    "next": cursor + 1,
                    "prev": cursor - 1,
                })))
            }
            .boxed_local()
        })
    }

    fn infinite_options(
        behavior: InfiniteQueryBehavior,
        log: Rc<RefCell<Vec<Value>>>,
    ) -> QueryOptions {
        QueryOptions {
            query_fn: Some(page_query_fn(log)),
            behavior: Some(Rc::new(behavior)),
            ..QueryOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forward_fetches_append_pages() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cache = QueryCache::new(QueryCacheConfig::default(), Services::new());
                let log = Rc::new(RefCell::new(Vec::new()));
                let query = cache.build_query(
                    QueryKey::new(("feed",)),
                    infinite_options(page_behavior(None), log.clone()),
                );

                query.fetch(FetchOptions::default()).await.unwrap();
                let next = query
                    .fetch(FetchOptions {
                        direction: Some(FetchDirection::Forward),
                        ..FetchOptions::default()
                    })
                    .await
                    .unwrap();

                assert_eq!(next["pages"].as_array().unwrap().len(), 2);
                assert_eq!(next["pageParams"], json!([0, 1]));
                assert_eq!(*log.borrow(), vec![json!(0), json!(1)]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn backward_fetches_prepend_pages() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cache = QueryCache::new(QueryCacheConfig::default(), Services::new());
                let log = Rc::new(RefCell::new(Vec::new()));
                let query = cache.build_query(
                    QueryKey::new(("history",)),
                    infinite_options(page_behavior(None), log.clone()),
                );

                query.fetch(FetchOptions::default()).await.unwrap();
                let data = query
                    .fetch(FetchOptions {
                        direction: Some(FetchDirection::Backward),
                        ..FetchOptions::default()
                    })
                    .await
                    .unwrap();

                assert_eq!(data["pageParams"], json!([-1, 0]));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn max_pages_drops_the_oldest_page() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cache = QueryCache::new(QueryCacheConfig::default(), Services::new());
                let log = Rc::new(RefCell::new(Vec::new()));
                let query = cache.build_query(
                    QueryKey::new(("capped",)),
                    infinite_options(page_behavior(Some(2)), log.clone()),
                );

                query.fetch(FetchOptions::default()).await.unwrap();
                for _ in 0..2 {
                    query
                        .fetch(FetchOptions {
                            direction: Some(FetchDirection::Forward),
                            ..FetchOptions::default()
                        })
                        .await
                        .unwrap();
                }

                let data = query.state().data.unwrap();
                assert_eq!(data["pages"].as_array().unwrap().len(), 2);
                assert_eq!(data["pageParams"], json!([1, 2]));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn undirected_refetch_reloads_every_page() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cache = QueryCache::new(QueryCacheConfig::default(), Services::new());
                let log = Rc::new(RefCell::new(Vec::new()));
                let query = cache.build_query(
                    QueryKey::new(("reload",)),
                    infinite_options(page_behavior(None), log.clone()),
                );

                query.fetch(FetchOptions::default()).await.unwrap();
                query
                    .fetch(FetchOptions {
                        direction: Some(FetchDirection::Forward),
                        ..FetchOptions::default()
                    })
                    .await
                    .unwrap();
                log.borrow_mut().clear();

                let data = query.fetch(FetchOptions::default()).await.unwrap();
                assert_eq!(data["pages"].as_array().unwrap().len(), 2);
                assert_eq!(*log.borrow(), vec![json!(0), json!(1)]);
            })
            .await;
    }
}

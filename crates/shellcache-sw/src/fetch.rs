//! Fetch interception: cache first, revalidate in the background.
//!
//! ```text
//! request ──▶ lookup ──hit──▶ respond from cache
//!               │                └─ spawn revalidation ──▶ put if cacheable
//!               └─miss──▶ network ──ok──▶ put clone if cacheable ──▶ respond
//!                            └─threw──▶ navigation? offline document : 503
//! ```
//!
//! The revalidation task is detached. The response path never awaits it;
//! [`Revalidation::join`] exists so callers that care (tests, the smoke
//! binary) can observe its outcome.

use std::sync::Arc;

use http::{Method, StatusCode};
use shellcache_net::{Fetcher, Request, Response};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use crate::clients::ClientId;
use crate::offline::OfflinePage;
use crate::store::CacheStore;

/// A request issued by a controlled page.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,
    pub client_id: Option<ClientId>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }

    pub fn from_client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    OfflineFallback,
}

/// Response handed back to the page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchResponse {
    /// Check if served from cache.
    pub fn from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}

/// Outcome of a background revalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevalidationResult {
    /// The cache entry was replaced with the fresh response.
    Updated,
    /// The network answered with something that may not be cached.
    NotCacheable(StatusCode),
    /// The fetch threw or the store rejected the write.
    Failed(String),
    /// The generation was deleted while the fetch was in flight; nothing was
    /// written.
    Retired,
    /// The task did not run to completion.
    Aborted,
}

/// Handle to a detached revalidation task.
#[derive(Debug)]
pub struct Revalidation {
    url: Url,
    handle: JoinHandle<RevalidationResult>,
}

impl Revalidation {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task. Dropping the handle instead leaves it running.
    pub async fn join(self) -> RevalidationResult {
        self.handle.await.unwrap_or(RevalidationResult::Aborted)
    }
}

/// Result of one intercepted fetch.
#[derive(Debug)]
pub struct FetchOutcome {
    pub response: FetchResponse,
    pub revalidation: Option<Revalidation>,
}

impl FetchOutcome {
    fn immediate(response: Response, source: ResponseSource) -> Self {
        Self {
            response: FetchResponse { response, source },
            revalidation: None,
        }
    }
}

/// Cache-first fetch handler for one generation.
#[derive(Clone)]
pub struct FetchInterceptor {
    cache_name: String,
    store: CacheStore,
    fetcher: Arc<dyn Fetcher>,
    offline: OfflinePage,
}

impl FetchInterceptor {
    pub fn new(
        cache_name: impl Into<String>,
        store: CacheStore,
        fetcher: Arc<dyn Fetcher>,
        offline: OfflinePage,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            store,
            fetcher,
            offline,
        }
    }

    pub async fn handle(&self, event: FetchEvent) -> FetchOutcome {
        let request = event.request;

        // Only GET pairs are ever stored.
        if request.method != Method::GET {
            return self.network_only(request).await;
        }

        if let Some(cached) = self.store.lookup(&self.cache_name, &request).await {
            trace!(url = %request.url, cache = %self.cache_name, "Serving from cache");
            let revalidation = self.spawn_revalidation(request);
            return FetchOutcome {
                response: FetchResponse {
                    response: cached,
                    source: ResponseSource::Cache,
                },
                revalidation: Some(revalidation),
            };
        }

        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                if response.is_cacheable() {
                    // A retired generation drops the write; the store logs it.
                    if let Err(e) = self
                        .store
                        .put(&self.cache_name, &request, response.clone())
                        .await
                    {
                        warn!(url = %request.url, error = %e, "Failed to cache network response");
                    }
                }
                FetchOutcome::immediate(response, ResponseSource::Network)
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Network fetch failed, serving offline fallback");
                self.fallback(&request)
            }
        }
    }

    async fn network_only(&self, request: Request) -> FetchOutcome {
        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => FetchOutcome::immediate(response, ResponseSource::Network),
            Err(e) => {
                warn!(url = %request.url, method = %request.method, error = %e, "Network fetch failed");
                self.fallback(&request)
            }
        }
    }

    fn fallback(&self, request: &Request) -> FetchOutcome {
        let response = if request.is_navigation() {
            self.offline.navigation_response(&request.url)
        } else {
            self.offline.resource_response(&request.url)
        };
        FetchOutcome::immediate(response, ResponseSource::OfflineFallback)
    }

    fn spawn_revalidation(&self, request: Request) -> Revalidation {
        let url = request.url.clone();
        let store = self.store.clone();
        let fetcher = self.fetcher.clone();
        let cache_name = self.cache_name.clone();

        let handle = tokio::spawn(async move {
            match fetcher.fetch(request.clone()).await {
                Ok(response) if response.is_cacheable() => {
                    match store.put(&cache_name, &request, response).await {
                        Ok(true) => {
                            debug!(url = %request.url, cache = %cache_name, "Revalidated cache entry");
                            RevalidationResult::Updated
                        }
                        Ok(false) => RevalidationResult::Retired,
                        Err(e) => {
                            warn!(url = %request.url, error = %e, "Revalidation could not update cache");
                            RevalidationResult::Failed(e.to_string())
                        }
                    }
                }
                Ok(response) => {
                    debug!(url = %request.url, status = %response.status, "Revalidation response not cacheable");
                    RevalidationResult::NotCacheable(response.status)
                }
                Err(e) => {
                    debug!(url = %request.url, error = %e, "Revalidation fetch failed");
                    RevalidationResult::Failed(e.to_string())
                }
            }
        });

        Revalidation { url, handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::is_offline_fallback;
    use crate::storage::MemoryCacheStorage;
    use shellcache_net::RouteFetcher;
    use std::time::Duration;

    const CACHE: &str = "shellcache-v1";

    fn origin() -> Url {
        Url::parse("https://app.example.com/").unwrap()
    }

    async fn setup(fetcher: RouteFetcher) -> (FetchInterceptor, CacheStore, Arc<RouteFetcher>) {
        let fetcher = Arc::new(fetcher);
        let store = CacheStore::new(Arc::new(MemoryCacheStorage::new()), fetcher.clone());
        store.open_generation(CACHE).await.unwrap();
        let interceptor =
            FetchInterceptor::new(CACHE, store.clone(), fetcher.clone(), OfflinePage::default());
        (interceptor, store, fetcher)
    }

    fn get(path: &str) -> FetchEvent {
        FetchEvent::new(Request::get(origin().join(path).unwrap()))
    }

    #[tokio::test]
    async fn test_miss_fetches_and_stores() {
        let (interceptor, store, _) =
            setup(RouteFetcher::new(origin()).with_route("/app.js", 200, "v1")).await;

        let outcome = interceptor.handle(get("/app.js")).await;
        assert_eq!(outcome.response.source, ResponseSource::Network);
        assert!(outcome.revalidation.is_none());

        let cached = store.lookup(CACHE, &get("/app.js").request).await.unwrap();
        assert_eq!(&cached.body[..], b"v1");
    }

    #[tokio::test]
    async fn test_miss_does_not_store_error_status() {
        let (interceptor, store, _) = setup(RouteFetcher::new(origin())).await;
        let outcome = interceptor.handle(get("/missing.png")).await;
        assert_eq!(outcome.response.response.status, StatusCode::NOT_FOUND);
        assert!(store.lookup(CACHE, &get("/missing.png").request).await.is_none());
    }

    #[tokio::test]
    async fn test_hit_serves_cache_and_revalidates() {
        let (interceptor, store, fetcher) =
            setup(RouteFetcher::new(origin()).with_route("/app.js", 200, "v1")).await;
        interceptor.handle(get("/app.js")).await;

        fetcher.serve("/app.js", 200, "v2").await;
        let outcome = interceptor.handle(get("/app.js")).await;
        assert!(outcome.response.from_cache());
        assert_eq!(&outcome.response.response.body[..], b"v1");

        let result = outcome.revalidation.unwrap().join().await;
        assert_eq!(result, RevalidationResult::Updated);
        let cached = store.lookup(CACHE, &get("/app.js").request).await.unwrap();
        assert_eq!(&cached.body[..], b"v2");
    }

    #[tokio::test]
    async fn test_hit_is_not_delayed_by_revalidation() {
        let (interceptor, _, fetcher) =
            setup(RouteFetcher::new(origin()).with_route("/app.js", 200, "v1")).await;
        interceptor.handle(get("/app.js")).await;
        fetcher.delay("/app.js", Duration::from_secs(30)).await;

        let outcome = tokio::time::timeout(Duration::from_secs(1), interceptor.handle(get("/app.js")))
            .await
            .expect("cache hit must not wait for the network");
        assert!(outcome.response.from_cache());
        assert!(!outcome.revalidation.unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_revalidation_failure_keeps_entry() {
        let (interceptor, store, fetcher) =
            setup(RouteFetcher::new(origin()).with_route("/app.js", 200, "v1")).await;
        interceptor.handle(get("/app.js")).await;
        fetcher.set_online(false);

        let outcome = interceptor.handle(get("/app.js")).await;
        assert!(outcome.response.from_cache());
        assert!(matches!(
            outcome.revalidation.unwrap().join().await,
            RevalidationResult::Failed(_)
        ));
        assert!(store.lookup(CACHE, &get("/app.js").request).await.is_some());
    }

    #[tokio::test]
    async fn test_revalidation_ignores_uncacheable() {
        let (interceptor, store, fetcher) =
            setup(RouteFetcher::new(origin()).with_route("/app.js", 200, "v1")).await;
        interceptor.handle(get("/app.js")).await;
        fetcher.serve("/app.js", 500, "boom").await;

        let outcome = interceptor.handle(get("/app.js")).await;
        assert_eq!(
            outcome.revalidation.unwrap().join().await,
            RevalidationResult::NotCacheable(StatusCode::INTERNAL_SERVER_ERROR)
        );
        let cached = store.lookup(CACHE, &get("/app.js").request).await.unwrap();
        assert_eq!(&cached.body[..], b"v1");
    }

    #[tokio::test]
    async fn test_offline_navigation_gets_document() {
        let (interceptor, _, fetcher) = setup(RouteFetcher::new(origin())).await;
        fetcher.set_online(false);

        let event = FetchEvent::new(Request::navigate(origin().join("/dashboard").unwrap()));
        let outcome = interceptor.handle(event).await;
        let response = outcome.response.response;
        assert_eq!(outcome.response.source, ResponseSource::OfflineFallback);
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_type().unwrap().essence_str(), "text/html");
        assert!(is_offline_fallback(&response));
    }

    #[tokio::test]
    async fn test_offline_resource_gets_503() {
        let (interceptor, store, fetcher) = setup(RouteFetcher::new(origin())).await;
        fetcher.set_online(false);

        let outcome = interceptor.handle(get("/static/js/chunk.js")).await;
        assert_eq!(outcome.response.response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(store.lookup(CACHE, &get("/static/js/chunk.js").request).await.is_none());
    }

    #[tokio::test]
    async fn test_post_bypasses_cache() {
        let (interceptor, store, fetcher) =
            setup(RouteFetcher::new(origin()).with_route("/api/save", 200, "ok")).await;

        let post = Request::get(origin().join("/api/save").unwrap()).method(Method::POST);
        let outcome = interceptor.handle(FetchEvent::new(post.clone())).await;
        assert_eq!(outcome.response.source, ResponseSource::Network);
        assert!(store.lookup(CACHE, &post).await.is_none());

        fetcher.set_online(false);
        let outcome = interceptor.handle(FetchEvent::new(post)).await;
        assert_eq!(outcome.response.response.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_revalidation_does_not_resurrect_retired_generation() {
        let (interceptor, store, fetcher) =
            setup(RouteFetcher::new(origin()).with_route("/app.js", 200, "v1")).await;
        interceptor.handle(get("/app.js")).await;

        fetcher.delay("/app.js", Duration::from_millis(100)).await;
        let outcome = interceptor.handle(get("/app.js")).await;
        assert!(outcome.response.from_cache());

        // A newer generation takes over while the fetch is in flight.
        store.open_generation("shellcache-v2").await.unwrap();
        store.delete_all_except("shellcache-v2").await;

        assert_eq!(
            outcome.revalidation.unwrap().join().await,
            RevalidationResult::Retired
        );
        assert_eq!(
            store.storage().keys().await.unwrap(),
            vec!["shellcache-v2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_miss_after_retirement_serves_without_storing() {
        let (interceptor, store, _) =
            setup(RouteFetcher::new(origin()).with_route("/app.js", 200, "v1")).await;
        store.storage().delete(CACHE).await.unwrap();

        let outcome = interceptor.handle(get("/app.js")).await;
        assert_eq!(outcome.response.source, ResponseSource::Network);
        assert!(store.storage().keys().await.unwrap().is_empty());
    }
}

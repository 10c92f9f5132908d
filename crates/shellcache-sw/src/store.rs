//! Cache Store: bulk and per-item population, lookup and generation cleanup.
//!
//! Population runs in two tiers. The bulk tier fetches every manifest entry
//! concurrently and stores the set atomically; if any fetch throws or any
//! response is not cacheable the whole set is rejected. The per-item tier then
//! fetches each entry again with [`CacheMode::Reload`] and stores the ones that
//! succeed, skipping the rest.

use std::sync::Arc;

use futures::future::join_all;
use shellcache_common::{retry_with_backoff, RetryConfig};
use shellcache_net::{CacheMode, Fetcher, Request, Response};
use tracing::{debug, info, warn};
use url::Url;

use crate::storage::{CacheHandle, CacheStorage};
use crate::{Result, ServiceWorkerError};

/// What a population pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulateReport {
    /// URLs stored in the generation.
    pub cached: Vec<Url>,

    /// URLs skipped, with the reason.
    pub skipped: Vec<(Url, String)>,

    /// Whether the bulk tier stored everything.
    pub bulk: bool,
}

impl PopulateReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// What a generation cleanup did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Thin wrapper over a [`CacheStorage`] and a [`Fetcher`].
#[derive(Clone)]
pub struct CacheStore {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    retry: RetryConfig,
}

impl CacheStore {
    pub fn new(storage: Arc<dyn CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            storage,
            fetcher,
            retry: RetryConfig::none(),
        }
    }

    /// Retry policy for the per-item tier.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Open or create a generation.
    pub async fn open_generation(&self, name: &str) -> Result<CacheHandle> {
        self.storage.open(name).await
    }

    /// Populate `handle` with `urls`, bulk first, then item by item.
    pub async fn put_all(&self, handle: &CacheHandle, urls: &[Url]) -> Result<PopulateReport> {
        if urls.is_empty() {
            return Ok(PopulateReport {
                bulk: true,
                ..Default::default()
            });
        }

        match self.bulk_put(handle, urls).await {
            Ok(()) => {
                debug!(cache = %handle.name(), count = urls.len(), "Bulk put succeeded");
                return Ok(PopulateReport {
                    cached: urls.to_vec(),
                    skipped: Vec::new(),
                    bulk: true,
                });
            }
            Err(e) => {
                info!(
                    cache = %handle.name(),
                    error = %e,
                    "Bulk put failed, falling back to per-item caching"
                );
            }
        }

        let mut report = PopulateReport::default();
        for url in urls {
            match self.put_one(handle, url).await {
                Ok(()) => report.cached.push(url.clone()),
                Err(e) => {
                    warn!(cache = %handle.name(), url = %url, error = %e, "Skipping asset");
                    report.skipped.push((url.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn bulk_put(&self, handle: &CacheHandle, urls: &[Url]) -> Result<()> {
        let fetches = urls.iter().map(|url| {
            let request = Request::get(url.clone());
            async move {
                let response = self.fetcher.fetch(request.clone()).await?;
                Ok::<_, ServiceWorkerError>((request, response))
            }
        });

        let pairs = join_all(fetches)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        handle.put_all(pairs).await
    }

    async fn put_one(&self, handle: &CacheHandle, url: &Url) -> Result<()> {
        let fetcher = &self.fetcher;
        retry_with_backoff(&self.retry, move || async move {
            let request = Request::get(url.clone()).cache_mode(CacheMode::Reload);
            let response = fetcher.fetch(request.clone()).await?;
            if !response.is_cacheable() {
                return Err(ServiceWorkerError::CacheError(format!(
                    "status {} ({:?})",
                    response.status, response.response_type
                )));
            }
            handle.put(&request, response).await
        })
        .await
    }

    /// Store one pair in the generation named `name`.
    ///
    /// Returns `false` without writing when the generation no longer exists,
    /// which happens once a newer worker has retired it.
    pub async fn put(&self, name: &str, request: &Request, response: Response) -> Result<bool> {
        let Some(handle) = self.storage.open_existing(name).await? else {
            debug!(cache = %name, url = %request.url, "Generation retired, dropping write");
            return Ok(false);
        };
        handle.put(request, response).await?;
        Ok(true)
    }

    /// Look `request` up in the generation named `name`.
    ///
    /// A missing generation is a miss and is not created. Storage errors are
    /// logged and reported as a miss.
    pub async fn lookup(&self, name: &str, request: &Request) -> Option<Response> {
        let handle = match self.storage.open_existing(name).await {
            Ok(Some(handle)) => handle,
            Ok(None) => return None,
            Err(e) => {
                warn!(cache = %name, error = %e, "Cache open failed during lookup");
                return None;
            }
        };
        match handle.match_request(request).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(cache = %name, url = %request.url, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Delete every generation except `current`.
    ///
    /// Each deletion is independent; failures are collected, not propagated.
    pub async fn delete_all_except(&self, current: &str) -> DeletionReport {
        let mut report = DeletionReport::default();
        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Could not enumerate cache generations");
                return report;
            }
        };

        for name in names.into_iter().filter(|n| n != current) {
            match self.storage.delete(&name).await {
                Ok(_) => {
                    info!(cache = %name, "Deleted stale generation");
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete stale generation");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCacheStorage;
    use shellcache_net::RouteFetcher;

    fn origin() -> Url {
        Url::parse("https://app.example.com/").unwrap()
    }

    fn urls(paths: &[&str]) -> Vec<Url> {
        paths.iter().map(|p| origin().join(p).unwrap()).collect()
    }

    fn store(fetcher: Arc<RouteFetcher>) -> CacheStore {
        CacheStore::new(Arc::new(MemoryCacheStorage::new()), fetcher)
    }

    #[tokio::test]
    async fn test_bulk_put_all_succeeds() {
        let fetcher = Arc::new(
            RouteFetcher::new(origin())
                .with_route("/index.html", 200, "<html/>")
                .with_route("/app.js", 200, "js"),
        );
        let store = store(fetcher.clone());
        let handle = store.open_generation("v1").await.unwrap();

        let report = store
            .put_all(&handle, &urls(&["/index.html", "/app.js"]))
            .await
            .unwrap();

        assert!(report.bulk);
        assert_eq!(report.cached.len(), 2);
        assert_eq!(handle.keys().await.unwrap().len(), 2);
        assert_eq!(fetcher.cache_modes("/app.js").await, vec![CacheMode::Default]);
    }

    #[tokio::test]
    async fn test_falls_back_per_item_and_skips_missing() {
        let fetcher = Arc::new(
            RouteFetcher::new(origin())
                .with_route("/index.html", 200, "<html/>")
                .with_route("/app.js", 200, "js"),
        );
        let store = store(fetcher.clone());
        let handle = store.open_generation("v1").await.unwrap();

        let report = store
            .put_all(&handle, &urls(&["/index.html", "/missing.png", "/app.js"]))
            .await
            .unwrap();

        assert!(!report.bulk);
        assert_eq!(report.cached.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, origin().join("/missing.png").unwrap());
        assert_eq!(handle.keys().await.unwrap().len(), 2);

        // The per-item tier bypasses HTTP caches.
        assert_eq!(
            fetcher.cache_modes("/app.js").await,
            vec![CacheMode::Default, CacheMode::Reload]
        );
    }

    #[tokio::test]
    async fn test_per_item_skips_thrown_fetch() {
        let fetcher = Arc::new(RouteFetcher::new(origin()).with_route("/a.js", 200, "a"));
        fetcher.fail("/b.js").await;
        let store = store(fetcher);
        let handle = store.open_generation("v1").await.unwrap();

        let report = store.put_all(&handle, &urls(&["/a.js", "/b.js"])).await.unwrap();
        assert_eq!(report.cached, urls(&["/a.js"]));
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_retry_recovers_flaky_asset() {
        let fetcher = Arc::new(RouteFetcher::new(origin()).with_route("/a.js", 200, "a"));
        fetcher.fail("/b.js").await;
        let retry = RetryConfig {
            max_attempts: 3,
            initial_delay: std::time::Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        };
        let store = store(fetcher.clone()).with_retry(retry);
        let handle = store.open_generation("v1").await.unwrap();

        let report = store.put_all(&handle, &urls(&["/a.js", "/b.js"])).await.unwrap();
        assert_eq!(report.skipped.len(), 1);
        // One bulk attempt plus three per-item attempts.
        assert_eq!(fetcher.fetch_count("/b.js").await, 4);
    }

    #[tokio::test]
    async fn test_lookup_hit_and_miss() {
        let fetcher = Arc::new(RouteFetcher::new(origin()));
        let store = store(fetcher);
        let request = Request::get(origin().join("/a.js").unwrap());
        let response = Response::new(request.url.clone(), http::StatusCode::OK, "a");

        store.open_generation("v1").await.unwrap();
        assert!(store.lookup("v1", &request).await.is_none());
        assert!(store.put("v1", &request, response).await.unwrap());
        assert!(store.lookup("v1", &request).await.is_some());
        assert!(store.lookup("v2", &request).await.is_none());
        assert_eq!(store.storage().keys().await.unwrap(), vec!["v1".to_string()]);
    }

    #[tokio::test]
    async fn test_put_into_retired_generation_is_dropped() {
        let fetcher = Arc::new(RouteFetcher::new(origin()));
        let store = store(fetcher);
        let request = Request::get(origin().join("/a.js").unwrap());
        let response = Response::new(request.url.clone(), http::StatusCode::OK, "a");

        store.open_generation("shellcache-v1").await.unwrap();
        store.open_generation("shellcache-v2").await.unwrap();
        store.delete_all_except("shellcache-v2").await;

        assert!(!store.put("shellcache-v1", &request, response).await.unwrap());
        assert!(store.lookup("shellcache-v1", &request).await.is_none());
        assert_eq!(
            store.storage().keys().await.unwrap(),
            vec!["shellcache-v2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_all_except_current() {
        let fetcher = Arc::new(RouteFetcher::new(origin()));
        let store = store(fetcher);
        for name in ["shellcache-v1", "shellcache-v2", "other", "shellcache-v3"] {
            store.open_generation(name).await.unwrap();
        }

        let report = store.delete_all_except("shellcache-v3").await;
        assert_eq!(report.deleted.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(
            store.storage().keys().await.unwrap(),
            vec!["shellcache-v3".to_string()]
        );
    }
}

//! Install handler.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::global::WorkerHost;
use crate::manifest::AssetManifest;
use crate::store::{CacheStore, PopulateReport};
use crate::Result;

/// Populates one generation with the shell manifest.
///
/// Shared by install, `REFRESH_CACHE` and periodic refresh.
#[derive(Clone)]
pub struct Precacher {
    cache_name: String,
    manifest: Arc<AssetManifest>,
    store: CacheStore,
}

impl Precacher {
    pub fn new(cache_name: impl Into<String>, manifest: AssetManifest, store: CacheStore) -> Self {
        Self {
            cache_name: cache_name.into(),
            manifest: Arc::new(manifest),
            store,
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn manifest(&self) -> &AssetManifest {
        &self.manifest
    }

    /// Open the generation and cache every manifest entry.
    pub async fn run(&self) -> Result<PopulateReport> {
        let handle = self.store.open_generation(&self.cache_name).await?;
        self.store.put_all(&handle, self.manifest.entries()).await
    }
}

/// Result of an install event. Install itself never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub cache_name: String,
    pub report: Option<PopulateReport>,
    pub error: Option<String>,
}

impl InstallOutcome {
    /// Whether some or all assets could not be cached.
    pub fn is_degraded(&self) -> bool {
        self.error.is_some() || self.report.as_ref().is_some_and(|r| !r.is_complete())
    }
}

/// Handles the install lifecycle event.
#[derive(Clone)]
pub struct InstallHandler {
    precacher: Precacher,
    skip_waiting: bool,
}

impl InstallHandler {
    pub fn new(precacher: Precacher, skip_waiting: bool) -> Self {
        Self {
            precacher,
            skip_waiting,
        }
    }

    pub async fn handle(&self, host: &dyn WorkerHost) -> InstallOutcome {
        let cache_name = self.precacher.cache_name().to_string();

        if self.skip_waiting {
            host.skip_waiting();
        }

        info!(
            cache = %cache_name,
            assets = self.precacher.manifest().len(),
            "Installing generation"
        );

        match self.precacher.run().await {
            Ok(report) => {
                if report.is_complete() {
                    info!(cache = %cache_name, cached = report.cached.len(), "Install complete");
                } else {
                    warn!(
                        cache = %cache_name,
                        cached = report.cached.len(),
                        skipped = report.skipped.len(),
                        "Install complete with missing assets"
                    );
                }
                InstallOutcome {
                    cache_name,
                    report: Some(report),
                    error: None,
                }
            }
            Err(e) => {
                error!(cache = %cache_name, error = %e, "Install could not populate cache");
                InstallOutcome {
                    cache_name,
                    report: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::HostSignals;
    use crate::storage::{CacheHandle, CacheStorage, MemoryCacheStorage};
    use crate::ServiceWorkerError;
    use async_trait::async_trait;
    use shellcache_net::RouteFetcher;
    use url::Url;

    fn base() -> Url {
        Url::parse("https://app.example.com/").unwrap()
    }

    fn precacher(storage: Arc<dyn CacheStorage>, fetcher: Arc<RouteFetcher>) -> Precacher {
        let manifest = AssetManifest::resolve(
            &base(),
            &["index.html".to_string(), "app.js".to_string()],
        );
        Precacher::new("shellcache-v1", manifest, CacheStore::new(storage, fetcher))
    }

    struct BrokenStorage;

    #[async_trait]
    impl CacheStorage for BrokenStorage {
        async fn open(&self, _name: &str) -> Result<CacheHandle> {
            Err(ServiceWorkerError::CacheError("quota exceeded".to_string()))
        }
        async fn has(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn keys(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn delete(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_install_caches_and_skips_waiting() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = Arc::new(
            RouteFetcher::new(base())
                .with_route("/index.html", 200, "<html/>")
                .with_route("/app.js", 200, "js"),
        );
        let handler = InstallHandler::new(precacher(storage.clone(), fetcher), true);
        let signals = HostSignals::default();

        let outcome = handler.handle(&signals).await;

        assert!(!outcome.is_degraded());
        assert!(signals.skip_waiting_requested());
        let cache = storage.open("shellcache-v1").await.unwrap();
        assert_eq!(cache.keys().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_install_without_skip_waiting() {
        let fetcher = Arc::new(RouteFetcher::new(base()));
        let handler = InstallHandler::new(
            precacher(Arc::new(MemoryCacheStorage::new()), fetcher),
            false,
        );
        let signals = HostSignals::default();
        handler.handle(&signals).await;
        assert!(!signals.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_install_swallows_storage_failure() {
        let fetcher = Arc::new(RouteFetcher::new(base()));
        let handler = InstallHandler::new(precacher(Arc::new(BrokenStorage), fetcher), true);

        let outcome = handler.handle(&HostSignals::default()).await;
        assert!(outcome.is_degraded());
        assert!(outcome.report.is_none());
        assert!(outcome.error.unwrap().contains("quota exceeded"));
    }
}
